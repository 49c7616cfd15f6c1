use thiserror::Error;

/// Error types for a tunneled fetch session
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Tunnel engine failed to start: {0}")]
    EngineStart(String),

    #[error("Client-side error in request to {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Server-side error in request to {url}: status {status}")]
    Server { url: String, status: http::StatusCode },

    #[error("Data from request to {url} is empty")]
    EmptyResponse { url: String },

    #[error("Failed to decode response from {url} as {charset}")]
    Decoding { url: String, charset: String },

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] crate::validation::ValidationError),
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
