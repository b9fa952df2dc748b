use crate::quota::QuotaError;

/// Core error type for the formatter.
///
/// The adapter crate maps its specific failures into this type so the
/// pipeline can handle them consistently (fatal config vs recoverable
/// per-post failures).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("api error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, Error>;
