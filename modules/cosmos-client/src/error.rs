use thiserror::Error;

pub type Result<T> = std::result::Result<T, CosmosError>;

#[derive(Debug, Error)]
pub enum CosmosError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Auth error: {0}")]
    Auth(String),
}

impl CosmosError {
    /// 409 — a document with the same id already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CosmosError::Api { status: 409, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CosmosError::Api { status: 404, .. })
    }
}

impl From<reqwest::Error> for CosmosError {
    fn from(err: reqwest::Error) -> Self {
        CosmosError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for CosmosError {
    fn from(err: serde_json::Error) -> Self {
        CosmosError::Parse(err.to_string())
    }
}
