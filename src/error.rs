//! Error taxonomy for device, store and preview failures

use serde::Serialize;
use thiserror::Error;

use crate::biometrics::store::StoreError;
use crate::validation::ValidationError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Port could not be opened or the device did not answer
    #[error("Device unavailable on {port}: {reason}")]
    DeviceUnavailable { port: String, reason: String },

    /// Driver reported a non-success terminal status
    #[error("{operation} failed with status {status}")]
    OperationFailed {
        operation: &'static str,
        status: String,
    },

    /// Generic failure raised by the driver while setting up an operation
    #[error("Device failure: {0}")]
    Driver(String),

    /// Driver returned without ever delivering a terminal status
    #[error("{0} finished without a terminal status")]
    MissingResult(&'static str),

    #[error("DB integrity error: {count} records found for user_id {user_id}")]
    Integrity { user_id: String, count: usize },

    #[error("User not found: {0}")]
    NotFound(String),

    #[error("User already exists: {0}")]
    Duplicate(String),

    #[error("Frame encoding failed: {0}")]
    Encoding(String),

    #[error("Invalid image: {0}")]
    Image(String),

    #[error("Invalid firmware image: {0}")]
    Firmware(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(user_id) => Error::NotFound(user_id),
            StoreError::Duplicate(user_id) => Error::Duplicate(user_id),
            StoreError::Integrity { user_id, count } => Error::Integrity { user_id, count },
            other => Error::Store(other),
        }
    }
}

/// Friendly error message with a stable code
#[derive(Debug, Clone, Serialize)]
pub struct FriendlyError {
    pub message: String,
    pub code: String,
    pub technical: String,
}

/// Map library errors to short messages suitable for an operator console
pub fn friendly_error(error: &Error) -> FriendlyError {
    let technical = error.to_string();

    let (code, message) = match error {
        Error::DeviceUnavailable { .. } => (
            "device_unavailable",
            "Camera is not reachable. Check the cable and the configured port.",
        ),
        Error::OperationFailed { .. } => (
            "operation_failed",
            "The camera rejected the request. Try again facing the camera.",
        ),
        Error::Driver(_) | Error::MissingResult(_) => (
            "device_error",
            "The camera reported an internal error. Reconnect it and try again.",
        ),
        Error::Integrity { .. } => (
            "integrity",
            "The faceprint database is inconsistent for this user. Manual cleanup is required.",
        ),
        Error::NotFound(_) => ("not_found", "No such user is enrolled."),
        Error::Duplicate(_) => ("duplicate", "This user is already enrolled."),
        Error::Encoding(_) => ("encoding", "Preview frame could not be encoded."),
        Error::Image(_) => ("invalid_image", "The image could not be read."),
        Error::Firmware(_) => (
            "invalid_firmware",
            "The firmware file could not be read or is not a firmware image.",
        ),
        Error::Store(_) => (
            "store_error",
            "The faceprint database could not be read or written.",
        ),
        Error::Validation(_) => ("invalid_input", "The request contains invalid values."),
    };

    FriendlyError {
        message: message.to_string(),
        code: code.to_string(),
        technical,
    }
}
