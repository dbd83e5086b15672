// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// Domain-oriented handler modules wired together by the Axum router below.
// Middleware order (outermost first): CORS → security headers → identity
// gate → rate control → request id → metrics → handler.

mod auth_routes;
mod cycles;
mod env_vars;
mod executions;
mod ingest;
mod misc;
mod projects;
mod reports;
mod schedules;
pub mod state;
pub mod types;
mod worker;

pub use state::ApiState;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::cors::CorsLayer;

use ax_cache::rate::RateTier;
use ax_core::types::Principal;
use ax_telemetry::middleware::{metrics_middleware, request_id_middleware};

use crate::api_error::ApiError;
use crate::auth::{identity_gate, WorkerCaller};
use crate::websocket;

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// The authenticated principal, placed in extensions by the identity gate.
pub struct CurrentUser(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))
    }
}

/// Marker extractor for worker-callback endpoints.
pub struct WorkerAuth;

impl<S: Send + Sync> FromRequestParts<S> for WorkerAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<WorkerCaller>()
            .map(|_| WorkerAuth)
            .ok_or_else(|| ApiError::Unauthorized("Invalid worker credentials".into()))
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Clamp pagination to sane bounds.
pub(crate) fn pagination(query: &types::ListQuery) -> (u32, u32) {
    let limit = query.limit.unwrap_or(50).min(200);
    let offset = query.offset.unwrap_or(0);
    (limit, offset)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Security headers on every response; HSTS only in production.
async fn security_headers_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let production = state.config.server.production;
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        axum::http::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "X-Frame-Options",
        axum::http::HeaderValue::from_static("DENY"),
    );
    headers.insert(
        "X-XSS-Protection",
        axum::http::HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "Referrer-Policy",
        axum::http::HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if production {
        headers.insert(
            "Strict-Transport-Security",
            axum::http::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        );
    }
    response
}

/// General-tier rate control, keyed by the authenticated org.
///
/// Ingest endpoints run their own lifecycle/event tiers in the handlers;
/// unauthenticated (public) requests are not counted here.
async fn rate_limit_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path().starts_with("/api/ingest/") {
        return next.run(request).await;
    }
    if let Some(principal) = request.extensions().get::<Principal>() {
        if let Err(denied) = state.rate.check(RateTier::General, &principal.org_id).await {
            return ApiError::RateLimited(denied.message.to_string()).into_response();
        }
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the full API router with all REST and WebSocket routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let production = state.config.server.production;
    let allowed_origins = state.config.cors.allowed_origins.clone();

    Router::new()
        // Public surface
        .route("/health", get(misc::health))
        .route("/api/status", get(misc::status))
        .route("/config/defaults", get(misc::config_defaults))
        .route("/api/plans", get(auth_routes::list_plans))
        // Auth
        .route("/api/auth/signup", post(auth_routes::signup))
        .route("/api/auth/login", post(auth_routes::login))
        .route("/api/auth/me", get(auth_routes::me))
        .route("/api/users/{id}/role", patch(auth_routes::change_role))
        .route("/api/api-keys", post(auth_routes::create_api_key))
        // Dispatch + executions
        .route(
            "/api/execution-request",
            post(executions::execution_request),
        )
        .route("/api/executions", get(executions::list_executions))
        .route("/api/executions/{task_id}", get(executions::get_execution))
        .route(
            "/api/executions/{task_id}",
            delete(executions::delete_execution),
        )
        .route("/api/metrics/{image}", get(executions::image_metrics))
        .route("/api/analytics/kpis", get(executions::kpis))
        // Projects + env vars
        .route("/api/projects", get(projects::list_projects))
        .route("/api/projects", post(projects::create_project))
        .route("/api/projects/{id}", put(projects::update_project))
        .route("/api/projects/{id}", delete(projects::delete_project))
        .route("/api/projects/{id}/env", get(env_vars::list_env_vars))
        .route("/api/projects/{id}/env", post(env_vars::create_env_var))
        .route(
            "/api/projects/{id}/env/{var_id}",
            put(env_vars::update_env_var),
        )
        .route(
            "/api/projects/{id}/env/{var_id}",
            delete(env_vars::delete_env_var),
        )
        // Test cycles
        .route("/api/test-cycles", get(cycles::list_cycles))
        .route("/api/test-cycles", post(cycles::create_cycle))
        .route("/api/test-cycles/{id}", get(cycles::get_cycle))
        .route(
            "/api/test-cycles/{id}/items/{item_id}",
            put(cycles::update_cycle_item),
        )
        // Schedules
        .route("/api/schedules", get(schedules::list_schedules))
        .route("/api/schedules", post(schedules::create_schedule))
        .route("/api/schedules/{id}", delete(schedules::delete_schedule))
        // External-CI ingest
        .route("/api/ingest/setup", post(ingest::setup))
        .route("/api/ingest/event", post(ingest::event))
        .route("/api/ingest/teardown", post(ingest::teardown))
        // Worker callbacks
        .route("/executions/update", post(worker::update_execution))
        .route("/executions/log", post(worker::append_log))
        // Static reports
        .route(
            "/reports/{org_id}/{task_id}/{*path}",
            get(reports::serve_report),
        )
        // Realtime
        .route("/socket", get(websocket::socket_handler))
        // Middleware (innermost listed first)
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            identity_gate,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            security_headers_middleware,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    move |origin: &axum::http::HeaderValue,
                          _parts: &axum::http::request::Parts| {
                        let Ok(origin_str) = origin.to_str() else {
                            return false;
                        };
                        if !production
                            && (origin_str.starts_with("http://localhost")
                                || origin_str.starts_with("http://127.0.0.1")
                                || origin_str.starts_with("https://localhost")
                                || origin_str.starts_with("https://127.0.0.1"))
                        {
                            return true;
                        }
                        allowed_origins.iter().any(|allowed| origin_str == allowed)
                    },
                ))
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::PATCH,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                    axum::http::HeaderName::from_static("x-api-key"),
                ])
                .allow_credentials(true),
        )
        .with_state(state)
}
