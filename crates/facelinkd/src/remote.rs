//! Client for an external DeepFace-compatible `represent` service.

use async_trait::async_trait;
use base64::Engine as _;
use facelink_core::{
    DetectionBackend, Embedding, FaceRepresentation, FacialArea, RepresentError, Representer,
    Strictness,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct RepresentBody<'a> {
    img: String,
    model_name: &'a str,
    detector_backend: &'a str,
    enforce_detection: bool,
}

#[derive(Deserialize)]
struct RepresentResponse {
    #[serde(default)]
    results: Vec<RemoteFace>,
}

#[derive(Deserialize)]
struct RemoteFace {
    embedding: Vec<f32>,
    #[serde(default)]
    facial_area: Option<FacialArea>,
    #[serde(default)]
    face_confidence: Option<f32>,
}

#[derive(Deserialize)]
struct RemoteError {
    error: String,
}

pub struct RemoteRepresenter {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteRepresenter {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/represent", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Representer for RemoteRepresenter {
    async fn represent(
        &self,
        img_path: &Path,
        model_name: &str,
        backend: DetectionBackend,
        strictness: Strictness,
    ) -> Result<Vec<FaceRepresentation>, RepresentError> {
        let bytes = tokio::fs::read(img_path)
            .await
            .map_err(|e| RepresentError::Engine(format!("failed to read {}: {e}", img_path.display())))?;
        let body = RepresentBody {
            img: format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(&bytes)
            ),
            model_name,
            detector_backend: backend.as_str(),
            enforce_detection: strictness.enforce_detection(),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| RepresentError::Engine(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RepresentError::Engine(e.to_string()))?;
        if !status.is_success() {
            return Err(RepresentError::Engine(error_message(status.as_u16(), &text)));
        }
        parse_results(&text)
    }
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<RemoteError>(body) {
        Ok(e) => e.error,
        Err(_) => format!("represent service returned {status}: {}", body.trim()),
    }
}

fn parse_results(body: &str) -> Result<Vec<FaceRepresentation>, RepresentError> {
    let parsed: RepresentResponse = serde_json::from_str(body)
        .map_err(|e| RepresentError::Engine(format!("malformed represent response: {e}")))?;
    Ok(parsed
        .results
        .into_iter()
        .map(|f| FaceRepresentation {
            embedding: Embedding::new(f.embedding),
            facial_area: f.facial_area,
            face_confidence: f.face_confidence.unwrap_or(0.0),
        })
        .collect())
}
