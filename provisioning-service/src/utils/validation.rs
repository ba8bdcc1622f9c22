use std::borrow::Cow;

use validator::ValidationError;

pub const MAX_NAME_LENGTH: usize = 50;

/// Letters, spaces, apostrophes, hyphens and periods; at least one letter.
pub fn validate_person_name(value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err(name_error("name_empty", "must not be empty"));
    }

    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(name_error("name_too_long", "must be at most 50 characters"));
    }

    if !trimmed.chars().any(char::is_alphabetic) {
        return Err(name_error("name_charset", "must contain at least one letter"));
    }

    let allowed = |c: char| c.is_alphabetic() || matches!(c, ' ' | '\'' | '-' | '.');
    if !trimmed.chars().all(allowed) {
        return Err(name_error(
            "name_charset",
            "may only contain letters, spaces, apostrophes, hyphens and periods",
        ));
    }

    Ok(())
}

fn name_error(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Borrowed(message));
    err
}
