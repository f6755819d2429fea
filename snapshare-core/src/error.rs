use thiserror::Error;

/// Error taxonomy for transfers, cache access and feed synchronization.
///
/// `Network` and `Service` are the only retryable kinds; `NotFound` means the
/// remote object is already gone and `Permission` needs the user to act
/// outside the app.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),

    #[error("service rejected request: {0}")]
    Service(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid model value: {0}")]
    Model(#[from] snapshare_model::ModelError),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_) | TransferError::Service(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferError::NotFound(_))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, TransferError::Permission(_))
    }
}

impl From<config::ConfigError> for TransferError {
    fn from(err: config::ConfigError) -> Self {
        TransferError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
