use std::collections::HashMap;

use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("invalid env var key: {0}")]
    InvalidEnvKey(String),
    #[error("env var value too long: {0} chars (max {MAX_ENV_VALUE_LEN})")]
    EnvValueTooLong(usize),
    #[error("input rejected: {0}")]
    InputRejected(String),
}

// ---------------------------------------------------------------------------
// Env var hygiene
// ---------------------------------------------------------------------------

/// Maximum env-var value length in characters.
pub const MAX_ENV_VALUE_LEN: usize = 4096;

/// Maximum env vars per project.
pub const MAX_ENV_VARS_PER_PROJECT: u64 = 50;

/// Prefix reserved for platform-internal variables. User-supplied keys
/// carrying it are dropped before hand-off to workers; the worker filters
/// again before container launch.
pub const RESERVED_ENV_PREFIX: &str = "PLATFORM_";

/// Validate an env-var key against `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_env_key(key: &str) -> Result<(), SecurityError> {
    let mut chars = key.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SecurityError::InvalidEnvKey(key.to_string()));
    }
    Ok(())
}

/// Validate an env-var value's length.
pub fn validate_env_value(value: &str) -> Result<(), SecurityError> {
    if value.chars().count() > MAX_ENV_VALUE_LEN {
        return Err(SecurityError::EnvValueTooLong(value.chars().count()));
    }
    Ok(())
}

/// Remove reserved-prefix keys from a user-supplied env map, logging each
/// drop. Returns the names that were removed.
pub fn strip_reserved_env(vars: &mut HashMap<String, String>) -> Vec<String> {
    let dropped: Vec<String> = vars
        .keys()
        .filter(|k| k.starts_with(RESERVED_ENV_PREFIX))
        .cloned()
        .collect();
    for key in &dropped {
        vars.remove(key);
        warn!(key = %key, "dropped reserved-prefix env var from request");
    }
    dropped
}

// ---------------------------------------------------------------------------
// InputSanitizer
// ---------------------------------------------------------------------------

/// Rejects control characters and over-long free-text fields (names, slugs,
/// titles) before they reach the store.
#[derive(Debug, Clone)]
pub struct InputSanitizer {
    pub max_length: usize,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self { max_length: 512 }
    }
}

impl InputSanitizer {
    pub fn sanitize(&self, input: &str) -> Result<(), SecurityError> {
        if input.trim().is_empty() {
            return Err(SecurityError::InputRejected("empty value".into()));
        }
        if input.chars().count() > self.max_length {
            return Err(SecurityError::InputRejected(format!(
                "value exceeds {} chars",
                self.max_length
            )));
        }
        if input.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            return Err(SecurityError::InputRejected(
                "control characters not allowed".into(),
            ));
        }
        Ok(())
    }
}

/// Validate a slug: lowercase alphanumerics and hyphens, no edge hyphens.
pub fn validate_slug(slug: &str) -> Result<(), SecurityError> {
    let ok = !slug.is_empty()
        && slug.len() <= 63
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-');
    if !ok {
        return Err(SecurityError::InputRejected(format!("invalid slug `{slug}`")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
