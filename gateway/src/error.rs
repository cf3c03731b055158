use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("listener error: {0}")]
    Listener(std::io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Per-request failure surfaced to the client as an HTTP status. Operational
/// errors stay inside their subsystem; this is the one cross-system surface.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    #[error("origin dial failed: {0}")]
    Dial(String),

    #[error("origin protocol error: {0}")]
    Protocol(String),

    #[error("origin stream reset")]
    StreamReset,

    #[error("origin timed out")]
    Timeout,

    #[error("no route for request")]
    NoRoute,

    #[error("server overloaded")]
    Overloaded,
}

impl ProxyError {
    /// The status each failure kind surfaces upstream.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Dial(_) | ProxyError::Protocol(_) | ProxyError::StreamReset => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::NoRoute => StatusCode::NOT_FOUND,
            ProxyError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
