//! Validation helpers for DTOs.

use validator::ValidationError;

const MIN_ROOM_CODE_LEN: usize = 4;
const MAX_ROOM_CODE_LEN: usize = 12;
const MAX_USER_ID_LEN: usize = 64;

/// Validates a user-entered room code: 4 to 12 ASCII letters or digits, surrounding
/// whitespace and case ignored.
///
/// # Examples
///
/// ```ignore
/// validate_room_code("AB3K9Z")   // Ok
/// validate_room_code(" ab3k9z ") // Ok - normalised later
/// validate_room_code("AB-3K")    // Err - punctuation
/// ```
pub fn validate_room_code(code: &str) -> Result<(), ValidationError> {
    let code = code.trim();
    if !(MIN_ROOM_CODE_LEN..=MAX_ROOM_CODE_LEN).contains(&code.len()) {
        let mut err = ValidationError::new("room_code_length");
        err.message = Some(
            format!(
                "Room code must be {MIN_ROOM_CODE_LEN} to {MAX_ROOM_CODE_LEN} characters (got {})",
                code.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        let mut err = ValidationError::new("room_code_format");
        err.message = Some("Room code must contain only letters and digits".into());
        return Err(err);
    }

    Ok(())
}

/// Validates an opaque participant identifier: non-empty, at most 64 characters, no
/// whitespace or control characters.
pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.is_empty() || user_id.chars().count() > MAX_USER_ID_LEN {
        let mut err = ValidationError::new("user_id_length");
        err.message =
            Some(format!("User ID must be 1 to {MAX_USER_ID_LEN} characters").into());
        return Err(err);
    }

    if user_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        let mut err = ValidationError::new("user_id_format");
        err.message = Some("User ID must not contain whitespace".into());
        return Err(err);
    }

    Ok(())
}
