use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use facelink_core::preprocess;
use facelink_core::{
    compare, ConfidenceLevel, DetectionAttempt, DetectionBackend, DetectionFailure, Embedding,
    Strictness, MATCH_THRESHOLD,
};
use facelink_store::assets::{bytes_to_mb, IMAGES_PREFIX};
use facelink_store::{ModelAssetInfo, StoredIn, SyncReport};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::ApiError;
use crate::config::{DeploymentMode, StorageKind};
use crate::context::AppContext;

const SERVICE_NAME: &str = "facelinkd";

type Ctx = State<Arc<AppContext>>;

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub embedding1: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding2: Option<Vec<f32>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum DetectResponse {
    Found {
        success: bool,
        embedding: Embedding,
        face_detected: bool,
        faces_count: usize,
        detector_backend: DetectionBackend,
        enforce_detection: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stored_image: Option<String>,
    },
    NotFound {
        success: bool,
        error: String,
        face_detected: bool,
    },
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub is_match: bool,
    pub cosine_similarity: f64,
    pub euclidean_distance: f64,
    pub confidence: f64,
    pub threshold_used: f64,
    pub confidence_level: ConfidenceLevel,
}

#[derive(Debug, Serialize)]
struct BackendAttempts {
    backend: DetectionBackend,
    results: Vec<DetectionAttempt>,
}

/// Decode and normalize a base64 image off the async runtime.
async fn load_image(payload: Option<String>) -> Result<RgbImage, ApiError> {
    let payload = payload
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("No image provided".into()))?;

    let image = tokio::task::spawn_blocking(move || {
        preprocess::decode_base64_image(&payload).and_then(preprocess::preprocess)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("preprocessing task failed: {e}")))??;
    Ok(image)
}

pub async fn detect_face(
    State(ctx): Ctx,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<DetectResponse>, ApiError> {
    let Json(req) = payload?;
    let image = load_image(req.image).await?;
    tracing::debug!(width = image.width(), height = image.height(), "image preprocessed");

    // Serverless deployments archive every submitted photo before detection
    let stored_image = match ctx.config.deployment {
        DeploymentMode::Serverless => {
            let blob_id = ctx.assets.store_image(&image).await.map_err(|e| {
                ApiError::Internal(format!("Failed to upload image to storage: {e}"))
            })?;
            Some(blob_id)
        }
        DeploymentMode::Standalone => None,
    };

    let representer = ctx.representer().await?;
    match ctx.controller.detect_and_embed(representer.as_ref(), &image).await {
        Ok(detection) => Ok(Json(DetectResponse::Found {
            success: true,
            embedding: detection.embedding,
            face_detected: true,
            faces_count: detection.faces_count,
            detector_backend: detection.backend,
            enforce_detection: detection.strictness == Strictness::Strict,
            stored_image,
        })),
        Err(failure @ DetectionFailure::NoFace { .. }) => Ok(Json(DetectResponse::NotFound {
            success: false,
            error: failure.to_string(),
            face_detected: false,
        })),
        Err(other) => Err(other.into()),
    }
}

pub async fn verify_faces(
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(req) = payload?;
    let (e1, e2) = match (req.embedding1, req.embedding2) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => (a, b),
        _ => return Err(ApiError::BadRequest("Both embeddings required".into())),
    };
    tracing::debug!(len1 = e1.len(), len2 = e2.len(), "comparing embeddings");

    let c = compare(&e1, &e2)?;
    tracing::info!(
        cosine = c.cosine_similarity,
        distance = c.euclidean_distance,
        is_match = c.is_match,
        "verification complete"
    );

    Ok(Json(VerifyResponse {
        success: true,
        is_match: c.is_match,
        cosine_similarity: c.cosine_similarity,
        euclidean_distance: c.euclidean_distance,
        confidence: c.cosine_similarity,
        threshold_used: MATCH_THRESHOLD,
        confidence_level: c.confidence_level,
    }))
}

/// Run every backend in both modes and report each outcome.
pub async fn debug_detect(
    State(ctx): Ctx,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let image = load_image(req.image).await?;
    let representer = ctx.representer().await?;
    let attempts = ctx.controller.probe(representer.as_ref(), &image).await?;

    let mut grouped: Vec<BackendAttempts> = Vec::new();
    for attempt in attempts {
        match grouped.last_mut() {
            Some(g) if g.backend == attempt.backend => g.results.push(attempt),
            _ => grouped.push(BackendAttempts {
                backend: attempt.backend,
                results: vec![attempt],
            }),
        }
    }

    Ok(Json(json!({
        "success": true,
        "debug_info": {
            "image_shape": [image.height(), image.width(), 3],
            "attempts": grouped,
        }
    })))
}

pub async fn health(State(ctx): Ctx) -> Json<Value> {
    let cfg = &ctx.config;
    let loaded = ctx.engine_initialized();
    let model_info = if loaded {
        format!("{} model initialized and ready", cfg.model_name)
    } else {
        "embedding engine initialization deferred".to_string()
    };
    let weights_dir = ctx.assets.weights_dir();
    let models_source = ctx.assets.bundled_dir();
    let bucket = match cfg.storage {
        StorageKind::Gcs => Some(cfg.storage_bucket.as_str()),
        StorageKind::Fs => None,
    };

    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "deployment": cfg.deployment.as_str(),
        "engine": cfg.engine.as_str(),
        "model": cfg.model_name,
        "model_loaded": loaded,
        "model_info": model_info,
        "models_source_directory": models_source,
        "models_source_exists": models_source.is_some_and(|d| d.is_dir()),
        "weights_directory": weights_dir,
        "weights_directory_exists": weights_dir.is_dir(),
        "images_storage_path": IMAGES_PREFIX,
        "images_storage_location": ctx.assets.images_location(),
        "storage_bucket": bucket,
        "detection_backends": ctx.controller.backends(),
        "verification_threshold": MATCH_THRESHOLD,
        "lazy_loading": true,
        "uptime_seconds": (chrono::Utc::now() - ctx.started_at).num_seconds(),
    }))
}

pub async fn models_info(State(ctx): Ctx) -> Result<Json<Value>, ApiError> {
    let models: Vec<ModelAssetInfo> = ctx.assets.list_models().await?;
    let local: Vec<&ModelAssetInfo> = models
        .iter()
        .filter(|m| matches!(m.location, StoredIn::Local | StoredIn::Both))
        .collect();
    let local_bytes: u64 = local.iter().map(|m| m.size_bytes).sum();
    let weights_dir = ctx.assets.weights_dir();
    let models_source = ctx.assets.bundled_dir();

    Ok(Json(json!({
        "success": true,
        "service": SERVICE_NAME,
        "model": ctx.config.model_name,
        "weights_path": weights_dir,
        "models_source_directory": models_source,
        "directories_exist": {
            "weights": weights_dir.is_dir(),
            "models_source": models_source.is_some_and(|d| d.is_dir()),
        },
        "downloaded_models": local.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        "models": models,
        "total_models_size_mb": bytes_to_mb(local_bytes),
        "storage": {
            "location": ctx.assets.store().location(),
            "images_path": IMAGES_PREFIX,
            "policy": ctx.assets.policy(),
        },
        "detection_backends": ctx.controller.backends(),
        "verification_threshold": MATCH_THRESHOLD,
    })))
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: SyncReport,
}

/// Push locally cached weights that durable storage lacks.
pub async fn sync_models(State(ctx): Ctx) -> Result<Json<SyncResponse>, ApiError> {
    let report = ctx.assets.publish_local_changes().await?;
    tracing::info!(
        uploaded = report.uploaded.len(),
        already_present = report.already_present.len(),
        failed = report.failed.len(),
        "model sync finished"
    );
    Ok(Json(SyncResponse {
        success: report.failed.is_empty(),
        report,
    }))
}

pub async fn model_card(State(ctx): Ctx) -> Json<Value> {
    let bands: BTreeMap<&str, &str> = ConfidenceLevel::bands()
        .into_iter()
        .map(|(level, range)| (level.as_str(), range))
        .collect();
    Json(json!({
        "model_name": ctx.config.model_name,
        "embedding_dimensions": 512,
        "metric": "cosine",
        "optimal_threshold": MATCH_THRESHOLD,
        "confidence_levels": bands,
        "recommended_detection_backends": [DetectionBackend::RetinaFace, DetectionBackend::Mtcnn],
    }))
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

pub async fn not_found(uri: axum::http::Uri) -> ApiError {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}
