//! Input validation for RPC parameters.
//!
//! Everything arriving over the wire is caller-controlled; these checks
//! run before any parameter reaches the loader, the scheduler, or the
//! filesystem.

use std::path::{Path, PathBuf};

use base64::Engine;
use thiserror::Error;

/// Maximum model id length.
const MAX_MODEL_ID_LEN: usize = 512;
/// Maximum decoded image payload.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("model_id is required")]
    MissingModelId,

    #[error("model_id too long ({0} chars, max {MAX_MODEL_ID_LEN})")]
    ModelIdTooLong(usize),

    #[error("model_id contains invalid characters or path traversal")]
    InvalidModelId,

    #[error("local_path contains path traversal or home expansion")]
    PathTraversal,

    #[error("local_path does not resolve under a trusted model directory")]
    UntrustedPath,

    #[error("local_path does not exist: {0}")]
    PathMissing(String),

    #[error("no trusted model directories are configured")]
    NoTrustedRoots,

    #[error("max_tokens {requested} exceeds limit {limit}")]
    MaxTokensExceeded { requested: usize, limit: usize },

    #[error("max_tokens must be positive")]
    MaxTokensZero,

    #[error("temperature {requested} exceeds limit {limit}")]
    TemperatureExceeded { requested: f32, limit: f32 },

    #[error("temperature must be a finite non-negative number")]
    TemperatureInvalid,

    #[error("image payload is empty")]
    EmptyImage,

    #[error("image payload too large ({size} bytes, max {MAX_IMAGE_BYTES})")]
    ImageTooLarge { size: usize },

    #[error("image payload is not valid base64: {0}")]
    InvalidBase64(String),
}

/// Model ids are limited to a safe charset and may never contain `..`.
pub fn validate_model_id(model_id: &str) -> Result<(), ValidateError> {
    if model_id.is_empty() {
        return Err(ValidateError::MissingModelId);
    }
    if model_id.len() > MAX_MODEL_ID_LEN {
        return Err(ValidateError::ModelIdTooLong(model_id.len()));
    }
    let charset_ok = model_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '@' | ':'));
    if !charset_ok || model_id.contains("..") {
        return Err(ValidateError::InvalidModelId);
    }
    Ok(())
}

/// Resolve a caller-supplied path under the trusted roots.
///
/// `..` and `~` are rejected before resolution; symlinks are resolved by
/// canonicalization and the result re-checked against each canonicalized
/// root.
pub fn resolve_trusted_path(path: &Path, trusted_roots: &[PathBuf]) -> Result<PathBuf, ValidateError> {
    if trusted_roots.is_empty() {
        return Err(ValidateError::NoTrustedRoots);
    }
    let raw = path.to_string_lossy();
    if raw.contains("..") || raw.starts_with('~') {
        return Err(ValidateError::PathTraversal);
    }

    let resolved = path
        .canonicalize()
        .map_err(|_| ValidateError::PathMissing(raw.to_string()))?;

    for root in trusted_roots {
        let Ok(root) = root.canonicalize() else {
            continue;
        };
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }
    Err(ValidateError::UntrustedPath)
}

/// Clamp-check a requested token budget against the configured ceiling.
pub fn validate_max_tokens(requested: usize, limit: usize) -> Result<(), ValidateError> {
    if requested == 0 {
        return Err(ValidateError::MaxTokensZero);
    }
    if requested > limit {
        return Err(ValidateError::MaxTokensExceeded { requested, limit });
    }
    Ok(())
}

/// Temperatures must be finite, non-negative, and under the ceiling.
pub fn validate_temperature(requested: f32, limit: f32) -> Result<(), ValidateError> {
    if !requested.is_finite() || requested < 0.0 {
        return Err(ValidateError::TemperatureInvalid);
    }
    if requested > limit {
        return Err(ValidateError::TemperatureExceeded { requested, limit });
    }
    Ok(())
}

/// Decode and bound-check a base64 image payload.
pub fn validate_base64_image(data: &str) -> Result<Vec<u8>, ValidateError> {
    // Bound the encoded form first so a hostile payload is rejected
    // before allocation: base64 inflates by 4/3.
    let max_encoded = MAX_IMAGE_BYTES / 3 * 4 + 8;
    if data.len() > max_encoded {
        return Err(ValidateError::ImageTooLarge { size: data.len() / 4 * 3 });
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ValidateError::InvalidBase64(e.to_string()))?;

    if decoded.is_empty() {
        return Err(ValidateError::EmptyImage);
    }
    if decoded.len() > MAX_IMAGE_BYTES {
        return Err(ValidateError::ImageTooLarge { size: decoded.len() });
    }
    Ok(decoded)
}
