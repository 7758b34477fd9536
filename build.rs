fn main() -> std::io::Result<()> {
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/runtime/v1alpha2/api.proto"], &["proto"])?;

    Ok(())
}
