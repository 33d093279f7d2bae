use thiserror::Error;

/// Errors produced by the route proxy protocol layer.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RouteError {
    fn from(e: serde_json::Error) -> Self {
        RouteError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for RouteError {
    fn from(e: base64::DecodeError) -> Self {
        RouteError::Codec(format!("base64: {e}"))
    }
}

pub type RouteResult<T> = Result<T, RouteError>;
