/// Entry point of the container stdout agent.
///
/// Discovers the node's containers, tails their stdout logs and prints the reconstructed records
/// as JSON lines. An API server exposes the container registry and the metrics.
///
/// # Errors
///
/// Returns an error if initialization fails, e.g. no container runtime is reachable.
///
/// # Examples
///
/// ```bash
/// RUST_LOG=info STDOUT_PIPELINES_CONFIG=pipelines.json cargo run
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    container_stdout_core::run().await
}
