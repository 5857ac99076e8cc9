use sha2::{Digest, Sha256};

use crate::error::CoreError;

const MAX_USER_ID_LEN: usize = 128;

/// Returns the pair in canonical (lexicographic) order. Both sides of a
/// conversation compute the same ordering regardless of who initiates.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub fn validate_user_id(user_id: &str) -> Result<(), CoreError> {
    if user_id.trim().is_empty() {
        return Err(CoreError::Validation("user id is empty".to_string()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(CoreError::Validation("user id too long".to_string()));
    }
    if user_id.chars().any(|c| c.is_control() || c == ':') {
        return Err(CoreError::Validation(
            "user id contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Deterministic thread key for an unordered participant pair. Pure and
/// order-independent, so two callers racing to contact each other for the
/// first time compute the identical key.
pub fn resolve(a: &str, b: &str) -> Result<String, CoreError> {
    validate_user_id(a)?;
    validate_user_id(b)?;
    if a == b {
        return Err(CoreError::Validation(
            "cannot open a thread with yourself".to_string(),
        ));
    }
    let (lo, hi) = ordered_pair(a, b);
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(b":");
    hasher.update(hi.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
