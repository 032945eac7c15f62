use thiserror::Error;

/// Errors raised while talking to a server's query endpoint.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unsupported response: {0}")]
    Unsupported(String),

    #[error("could not resolve query address {0}")]
    Resolve(String),
}

impl QueryError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        QueryError::Malformed(detail.into())
    }
}
