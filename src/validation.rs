/**
 * Input Validation Module
 *
 * Centralized validation for operation inputs and configuration values.
 * Rejects malformed user ids before they reach the device or the store.
 */
use thiserror::Error;

/// Longest user id the device accepts (31 byte buffer incl. terminator)
pub const MAX_USER_ID_LEN: usize = 30;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Value too long: max {max}, got {actual}")]
    ValueTooLong { max: usize, actual: usize },
}

/// Validate a user id (max 30 bytes, no control characters)
pub fn validate_user_id(user_id: &str) -> Result<String, ValidationError> {
    if user_id.is_empty() {
        return Err(ValidationError::InvalidFormat(
            "User id cannot be empty".to_string(),
        ));
    }

    if user_id.len() > MAX_USER_ID_LEN {
        return Err(ValidationError::ValueTooLong {
            max: MAX_USER_ID_LEN,
            actual: user_id.len(),
        });
    }

    if user_id.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidFormat(
            "User id contains invalid control characters".to_string(),
        ));
    }

    Ok(user_id.to_string())
}

/// Validate serial port name (max 256 chars, no control characters)
pub fn validate_port(port: &str) -> Result<String, ValidationError> {
    if port.is_empty() {
        return Err(ValidationError::InvalidFormat(
            "Port cannot be empty".to_string(),
        ));
    }

    if port.len() > 256 {
        return Err(ValidationError::ValueTooLong {
            max: 256,
            actual: port.len(),
        });
    }

    if port.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidFormat(
            "Port contains invalid control characters".to_string(),
        ));
    }

    Ok(port.to_string())
}

/// Validate an encoder quality (1 to 100)
pub fn validate_quality(quality: u8) -> Result<u8, ValidationError> {
    if !(1..=100).contains(&quality) {
        return Err(ValidationError::InvalidRange(format!(
            "Quality must be between 1 and 100, got {}",
            quality
        )));
    }
    Ok(quality)
}

/// Validate a cosine score threshold (-1.0 to 1.0)
pub fn validate_score_threshold(threshold: f32) -> Result<f32, ValidationError> {
    if !(-1.0..=1.0).contains(&threshold) {
        return Err(ValidationError::InvalidRange(format!(
            "Score threshold must be between -1.0 and 1.0, got {}",
            threshold
        )));
    }
    Ok(threshold)
}

/// Validate nearest-neighbor result count (1 to 1000)
pub fn validate_max_results(max_results: usize) -> Result<usize, ValidationError> {
    if !(1..=1000).contains(&max_results) {
        return Err(ValidationError::InvalidRange(format!(
            "Max results must be between 1 and 1000, got {}",
            max_results
        )));
    }
    Ok(max_results)
}

/// Validate preview camera number (-1 = auto)
pub fn validate_camera_number(camera_number: i32) -> Result<i32, ValidationError> {
    if camera_number < -1 {
        return Err(ValidationError::InvalidRange(format!(
            "Camera number must be >= -1, got {}",
            camera_number
        )));
    }
    Ok(camera_number)
}

/// Validate the enroll image buffer limit (64 KiB to 16 MiB)
pub fn validate_image_budget(max_bytes: usize) -> Result<usize, ValidationError> {
    if !(64 * 1024..=16 * 1024 * 1024).contains(&max_bytes) {
        return Err(ValidationError::InvalidRange(format!(
            "Image budget must be between 64 KiB and 16 MiB, got {} bytes",
            max_bytes
        )));
    }
    Ok(max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_valid() {
        assert!(validate_user_id("alice").is_ok());
        assert!(validate_user_id("john_doe-2024").is_ok());
        assert!(validate_user_id("j.doe@site").is_ok());
        assert!(validate_user_id("John Smith").is_ok());
        assert!(validate_user_id("Zoë/ops").is_ok());
        assert!(validate_user_id(&"a".repeat(MAX_USER_ID_LEN)).is_ok());
    }

    #[test]
    fn test_user_id_invalid() {
        assert!(validate_user_id("").is_err()); // Empty
        assert!(validate_user_id(&"a".repeat(MAX_USER_ID_LEN + 1)).is_err()); // Too long
        assert!(validate_user_id("user\nname").is_err()); // Newline
        assert!(validate_user_id("tab\there").is_err());
        assert!(validate_user_id(&"é".repeat(16)).is_err()); // 32 bytes
    }

    #[test]
    fn test_port_valid() {
        assert!(validate_port("/dev/ttyACM0").is_ok());
        assert!(validate_port("COM3").is_ok());
    }

    #[test]
    fn test_port_invalid() {
        assert!(validate_port("").is_err());
        assert!(validate_port(&"a".repeat(257)).is_err());
        assert!(validate_port("tty\x00ACM0").is_err());
    }

    #[test]
    fn test_quality_bounds() {
        assert!(validate_quality(1).is_ok());
        assert!(validate_quality(85).is_ok());
        assert!(validate_quality(100).is_ok());
        assert!(validate_quality(0).is_err());
        assert!(validate_quality(101).is_err());
    }

    #[test]
    fn test_camera_number() {
        assert!(validate_camera_number(-1).is_ok());
        assert!(validate_camera_number(2).is_ok());
        assert!(validate_camera_number(-2).is_err());
    }

    #[test]
    fn test_image_budget() {
        assert!(validate_image_budget(890 * 1024).is_ok());
        assert!(validate_image_budget(1024).is_err());
    }
}
