use thiserror::Error;

/// Errors raised by the HTTP serving layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Server error: {message}")]
    ServerError { message: String },
}
