//! HTTP surface of the daemon.

pub mod error;
pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::DeploymentMode;
use crate::context::AppContext;

/// Base64 photos run to several megabytes.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let mut app = Router::new()
        .route(
            "/detect_face",
            post(handlers::detect_face).fallback(handlers::method_not_allowed),
        )
        .route(
            "/verify_faces",
            post(handlers::verify_faces).fallback(handlers::method_not_allowed),
        )
        .route(
            "/debug_detect",
            post(handlers::debug_detect).fallback(handlers::method_not_allowed),
        )
        .route("/health", get(handlers::health))
        .route("/health_check", get(handlers::health))
        .route("/models_info", get(handlers::models_info))
        .route("/model_card", get(handlers::model_card));

    if ctx.config.deployment == DeploymentMode::Serverless {
        app = app.route(
            "/sync_models",
            get(handlers::sync_models).post(handlers::sync_models),
        );
    }

    app.fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&ctx.config.cors_origins))
        .with_state(ctx)
}

/// Any origin when `origins` is empty, otherwise exactly the listed ones.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
