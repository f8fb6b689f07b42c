use axum::http::HeaderMap;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// Guard for mutation endpoints. Callers are trusted internal workflows
/// (cron trigger, bill-entry UI backend, payment capture); user-level auth
/// lives in front of this service.
pub fn require_internal_key(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = state.config.internal_api_key.as_deref() else {
        if state.config.is_production() {
            return Err(AppError::Unauthorized(
                "INTERNAL_API_KEY is not configured.".to_string(),
            ));
        }
        return Ok(());
    };

    let provided = headers
        .get(INTERNAL_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    if provided.is_empty() {
        return Err(AppError::Unauthorized(format!(
            "Missing {INTERNAL_KEY_HEADER} header."
        )));
    }
    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(AppError::Unauthorized("Invalid internal API key.".to_string()));
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn compares_keys() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secret1"));
    }
}
