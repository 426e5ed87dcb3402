//! Errors raised by external collaborators

use maas_durable::ActivityError;
use thiserror::Error;

/// `error_type` values set by MAAS activities
pub mod error_types {
    /// Connection, TLS or timeout failure talking to a remote service
    pub const TRANSPORT: &str = "TRANSPORT";
    /// Remote answered with a status code outside the activity's table
    pub const UNEXPECTED_STATUS: &str = "UNEXPECTED_STATUS";
    /// Remote payload or header could not be decoded
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    /// Enrolment is accepted but not yet approved
    pub const ENROLMENT_PENDING: &str = "ENROLMENT_PENDING";
    /// Enrolment metainfo is not a YAML mapping
    pub const INVALID_METAINFO: &str = "INVALID_METAINFO";
    /// A database or store collaborator failed
    pub const STORE: &str = "STORE";
    /// The requested object does not exist
    pub const NOT_FOUND: &str = "NOT_FOUND";
}

/// Failure of a secret store, machine source, rack source or provisioner
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

impl From<CollaboratorError> for ActivityError {
    fn from(err: CollaboratorError) -> Self {
        let message = err.to_string();
        match err {
            CollaboratorError::NotFound(_) => {
                ActivityError::non_retryable(message).with_type(error_types::NOT_FOUND)
            }
            CollaboratorError::Http(_) => {
                ActivityError::retryable(message).with_type(error_types::TRANSPORT)
            }
            CollaboratorError::Api { status, .. } if status >= 500 => {
                ActivityError::retryable(message).with_type(error_types::UNEXPECTED_STATUS)
            }
            CollaboratorError::Api { .. } => {
                ActivityError::non_retryable(message).with_type(error_types::UNEXPECTED_STATUS)
            }
            CollaboratorError::Database(_) | CollaboratorError::Other(_) => {
                ActivityError::retryable(message).with_type(error_types::STORE)
            }
            CollaboratorError::Serialization(_) | CollaboratorError::Url(_) => {
                ActivityError::non_retryable(message).with_type(error_types::INVALID_RESPONSE)
            }
        }
    }
}
