#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("shared store failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to spawn background worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("signal prefix must not be empty")]
    EmptySignalPrefix,
    #[error("state key `{0}` collides with the signal prefix")]
    StateKeyCollision(String),
    #[error("grace period must be greater than zero")]
    ZeroGracePeriod,
}

pub type SyncResult<T> = Result<T, SyncError>;

// minicbor's encode error is generic over the writer, flatten it to text.
pub(crate) fn encode_error<E: std::fmt::Display>(err: minicbor::encode::Error<E>) -> SyncError {
    SyncError::Encode(err.to_string())
}
