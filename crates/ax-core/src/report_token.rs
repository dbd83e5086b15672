//! Short-lived signed tokens gating static report assets.
//!
//! A token is `base64url(payload) + "." + base64url(hmac)` where the payload
//! is the JSON `{orgId, taskId, exp}` and the MAC is HMAC-SHA256 over the
//! encoded payload. Tokens expire five minutes after issue and are bound to
//! exactly one `(org, task)` pair.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use chrono::Utc;
use ring::hmac;
use serde::{Deserialize, Serialize};

/// Token lifetime in seconds.
pub const REPORT_TOKEN_TTL_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token not valid for this report")]
    WrongScope,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    org_id: String,
    task_id: String,
    exp: i64,
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Stateless HMAC signer/verifier for report tokens.
#[derive(Clone)]
pub struct ReportTokenService {
    key: hmac::Key,
}

impl ReportTokenService {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Issue a token for `(org_id, task_id)` expiring in five minutes.
    pub fn generate(&self, org_id: &str, task_id: &str) -> String {
        let payload = TokenPayload {
            org_id: org_id.to_string(),
            task_id: task_id.to_string(),
            exp: Utc::now().timestamp() + REPORT_TOKEN_TTL_SECS,
        };
        let encoded =
            B64URL.encode(serde_json::to_vec(&payload).expect("payload serializes"));
        let sig = hmac::sign(&self.key, encoded.as_bytes());
        format!("{}.{}", encoded, B64URL.encode(sig.as_ref()))
    }

    /// Verify a token against the requested `(org_id, task_id)`.
    ///
    /// Signature comparison happens before payload decoding so malformed
    /// payloads cannot be distinguished from forged ones by timing.
    pub fn verify(&self, token: &str, org_id: &str, task_id: &str) -> Result<(), TokenError> {
        let (encoded, sig_part) = token.split_once('.').ok_or(TokenError::Malformed)?;
        if encoded.is_empty() || sig_part.is_empty() || sig_part.contains('.') {
            return Err(TokenError::Malformed);
        }
        let sig = B64URL.decode(sig_part).map_err(|_| TokenError::Malformed)?;

        // ring::hmac::verify is constant-time over the MAC bytes.
        hmac::verify(&self.key, encoded.as_bytes(), &sig)
            .map_err(|_| TokenError::BadSignature)?;

        let raw = B64URL.decode(encoded).map_err(|_| TokenError::Malformed)?;
        let payload: TokenPayload =
            serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;

        if payload.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        if payload.org_id != org_id || payload.task_id != task_id {
            return Err(TokenError::WrongScope);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
