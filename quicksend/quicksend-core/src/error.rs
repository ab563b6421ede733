use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure reasons surfaced by core operations.
///
/// Structural errors (`InvalidInput`, `CycleDetected`, `Protected`) are raised
/// before a document is mutated, so nothing is persisted when they occur.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("cycle detected: {0}")]
    CycleDetected(String),
    #[error("protected: {0}")]
    Protected(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable reason code reported alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::CycleDetected(_) => "cycle_detected",
            Error::Protected(_) => "protected",
            Error::Forbidden(_) => "forbidden",
            Error::StorageFailure(_) => "storage_failure",
            Error::DeliveryFailed(_) => "delivery_failed",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidInput(what.into())
    }

    pub(crate) fn forbidden(what: impl Into<String>) -> Self {
        Error::Forbidden(what.into())
    }
}
