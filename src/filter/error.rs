#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid regex `{pattern}` for key `{key}`: {source}")]
    InvalidRegex {
        key: String,
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
}
pub type Result<T> = std::result::Result<T, Error>;
