//! Identity gate.
//!
//! Resolves every inbound request to a [`Principal`] (bearer JWT or API
//! key), marks worker callbacks authenticated by the shared secret, and
//! lets the explicit allow-list through untouched. Handlers downstream read
//! the principal from request extensions and apply role checks.

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::digest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;
use uuid::Uuid;

use ax_core::types::{Principal, User, UserRole};

use crate::api_error::ApiError;
use crate::http_api::state::ApiState;

// ---------------------------------------------------------------------------
// JWT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    #[serde(rename = "orgId")]
    pub org_id: String,
    pub role: UserRole,
    pub exp: i64,
}

/// Process-wide JWT signing/verification keys.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl AuthKeys {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    /// Issue a token for a user.
    pub fn issue(&self, user: &User) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user.id.clone(),
            org_id: user.org_id.clone(),
            role: user.role,
            exp: chrono::Utc::now().timestamp() + self.ttl_secs as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("jwt encode: {e}")))
    }

    /// Verify signature and expiry; return the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))
    }
}

impl From<&Claims> for Principal {
    fn from(claims: &Claims) -> Self {
        Principal {
            user_id: claims.sub.clone(),
            org_id: claims.org_id.clone(),
            role: claims.role,
        }
    }
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// Generate fresh API key material. Shown to the caller exactly once.
pub fn generate_api_key() -> String {
    format!(
        "agx_{}{}",
        Uuid::new_v4().as_simple(),
        Uuid::new_v4().as_simple()
    )
}

/// Hex SHA-256 of the key material — the only form that is stored.
pub fn hash_api_key(key: &str) -> String {
    let hashed = digest::digest(&digest::SHA256, key.as_bytes());
    hashed
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Role checks
// ---------------------------------------------------------------------------

/// 403 unless the principal's role is in `allowed`.
pub fn require_role(principal: &Principal, allowed: &[UserRole]) -> Result<(), ApiError> {
    if principal.has_role(allowed) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Insufficient permissions".into()))
    }
}

pub fn admin_only(principal: &Principal) -> Result<(), ApiError> {
    require_role(principal, &[UserRole::Admin])
}

pub fn developer_or_admin(principal: &Principal) -> Result<(), ApiError> {
    require_role(principal, &[UserRole::Admin, UserRole::Developer])
}

// ---------------------------------------------------------------------------
// Worker marker
// ---------------------------------------------------------------------------

/// Request extension set when the worker shared secret matched.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCaller;

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Paths that bypass the identity gate entirely.
fn is_public(path: &str) -> bool {
    matches!(
        path,
        "/health" | "/api/status" | "/config/defaults" | "/api/auth/signup"
            | "/api/auth/login" | "/api/plans"
    ) || path.starts_with("/reports/")
        || path == "/socket"
}

fn is_worker_callback(path: &str) -> bool {
    path == "/executions/update" || path == "/executions/log"
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// The identity gate middleware.
///
/// Resolution order: allow-list → worker shared secret → `x-api-key` →
/// bearer JWT. Successful resolution inserts a [`Principal`] (or
/// [`WorkerCaller`]) extension; anything else is a 401.
pub async fn identity_gate(
    State(state): State<Arc<ApiState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();

    if is_public(&path) {
        return next.run(req).await;
    }

    if is_worker_callback(&path) {
        let presented = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
            .unwrap_or("");
        let expected = state.config.auth.worker_secret.as_str();
        let matches = !expected.is_empty()
            && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()));
        if matches {
            req.extensions_mut().insert(WorkerCaller);
            return next.run(req).await;
        }
        if state.config.auth.worker_callback_transition {
            warn!(path, "accepting unauthenticated worker callback (transition window)");
            req.extensions_mut().insert(WorkerCaller);
            return next.run(req).await;
        }
        return ApiError::Unauthorized("Invalid worker credentials".into()).into_response();
    }

    // API key first, then bearer JWT.
    if let Some(presented) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    {
        match authenticate_api_key(&state, &presented).await {
            Ok(principal) => {
                req.extensions_mut().insert(principal);
                return next.run(req).await;
            }
            Err(err) => return err.into_response(),
        }
    }

    if path.starts_with("/api/ingest/") {
        // Reporters authenticate with API keys only.
        return ApiError::Unauthorized("API key required".into()).into_response();
    }

    match bearer_token(req.headers()) {
        Some(token) => match state.auth_keys.verify(token) {
            Ok(claims) => {
                req.extensions_mut().insert(Principal::from(&claims));
                next.run(req).await
            }
            Err(err) => err.into_response(),
        },
        None => ApiError::Unauthorized("Authentication required".into()).into_response(),
    }
}

/// Look up an API key record by the hash of the presented material and
/// re-verify constant-time. Best-effort `last_used_at` stamp.
async fn authenticate_api_key(
    state: &ApiState,
    presented: &str,
) -> Result<Principal, ApiError> {
    let computed = hash_api_key(presented);
    let record = state
        .store
        .find_api_key_by_hash(&computed)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::Unauthorized("Invalid API key".into()))?;

    if !bool::from(record.key_hash.as_bytes().ct_eq(computed.as_bytes())) {
        return Err(ApiError::Unauthorized("Invalid API key".into()));
    }

    if let Err(err) = state.store.touch_api_key(&record.id).await {
        warn!(error = %err, "failed to stamp api key usage");
    }

    let user = state
        .store
        .get_user(&record.org_id, &record.user_id)
        .await
        .map_err(|_| ApiError::Unauthorized("Invalid API key".into()))?;

    Ok(Principal {
        user_id: user.id,
        org_id: record.org_id,
        role: user.role,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: UserRole) -> User {
        User::new("org-a", "a@x.io", "A", "hash", role)
    }

    #[test]
    fn jwt_round_trip() {
        let keys = AuthKeys::new(b"test-secret", 3600);
        let token = keys.issue(&user(UserRole::Developer)).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.org_id, "org-a");
        assert_eq!(claims.role, UserRole::Developer);
    }

    #[test]
    fn jwt_wrong_secret_rejected() {
        let keys = AuthKeys::new(b"test-secret", 3600);
        let token = keys.issue(&user(UserRole::Admin)).unwrap();
        let other = AuthKeys::new(b"other-secret", 3600);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn jwt_garbage_rejected() {
        let keys = AuthKeys::new(b"test-secret", 3600);
        assert!(keys.verify("not.a.jwt").is_err());
        assert!(keys.verify("").is_err());
    }

    #[test]
    fn api_key_hash_is_stable_hex() {
        let key = generate_api_key();
        assert!(key.starts_with("agx_"));
        let h1 = hash_api_key(&key);
        let h2 = hash_api_key(&key);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_api_key("agx_other"));
    }

    #[test]
    fn role_checks() {
        let admin = Principal {
            user_id: "u".into(),
            org_id: "o".into(),
            role: UserRole::Admin,
        };
        let viewer = Principal {
            role: UserRole::Viewer,
            ..admin.clone()
        };
        assert!(admin_only(&admin).is_ok());
        assert!(admin_only(&viewer).is_err());
        assert!(developer_or_admin(&admin).is_ok());
        assert!(developer_or_admin(&viewer).is_err());
    }

    #[test]
    fn public_allow_list() {
        assert!(is_public("/health"));
        assert!(is_public("/api/auth/login"));
        assert!(is_public("/reports/org-a/t1/index.html"));
        assert!(!is_public("/api/executions"));
        assert!(!is_public("/api/ingest/setup"));
        assert!(is_worker_callback("/executions/update"));
        assert!(!is_worker_callback("/api/executions"));
    }
}
