use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The requested chat, user or peer does not exist or is not visible.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("api error in {method}: code={code} {description}")]
    Api {
        method: String,
        code: i64,
        description: String,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("inbound queue closed")]
    Closed,
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Http(format!("decode: {e}"))
    }
}
