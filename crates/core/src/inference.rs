//! Client for the external face-swap service (ReActor-style JSON API).

use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::asset::{result_name, ImageAsset};
use crate::image_ops::{self, OutputFormat, TransformError};

pub const IMAGE_DATA_URI_PREFIX: &str = "data:image/png;base64,";

const SELECT_SOURCE_IMAGE: i32 = 0;
const SELECT_FACE_MODEL: i32 = 1;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to encode request body: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("failed to reach inference service: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("wrong response [{status}]: {{{reason}}}")]
    Protocol { status: u16, reason: String },
    #[error("malformed inference response: {0}")]
    Decoding(String),
    #[error("failed to post-process result image: {0}")]
    PostProcess(#[from] TransformError),
    #[error("post-processing task failed: {0}")]
    PostProcessTask(#[from] tokio::task::JoinError),
}

/// Tunables forwarded verbatim to the swap service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceParams {
    pub face_restorer: String,
    pub device: String,
    pub mask_face: i32,
    pub gender_source: i32,
    pub gender_target: i32,
    pub face_model: String,
    pub codeformer_weight: f64,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            face_restorer: "CodeFormer".to_string(),
            device: "CUDA".to_string(),
            mask_face: 1,
            gender_source: 1,
            gender_target: 1,
            face_model: "origin.safetensors".to_string(),
            codeformer_weight: 0.5,
        }
    }
}

/// Everything one item needs besides its images.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapSettings {
    pub endpoint: String,
    pub name_prefix: String,
    pub quality: u8,
    pub params: InferenceParams,
}

#[derive(Debug, Serialize)]
struct SwapRequest<'a> {
    target_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_image: Option<String>,
    face_restorer: &'a str,
    gender_source: i32,
    gender_target: i32,
    device: &'a str,
    mask_face: i32,
    select_source: i32,
    face_model: &'a str,
    codeformer_weight: f64,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    image: String,
}

#[derive(Debug, Serialize)]
struct FaceModelRequest<'a> {
    source_images: Vec<String>,
    name: &'a str,
    compute_method: i32,
}

pub fn to_data_uri(bytes: &[u8]) -> String {
    format!("{IMAGE_DATA_URI_PREFIX}{}", BASE64_STANDARD.encode(bytes))
}

/// Accepts bare base64 or a `data:` URI.
fn decode_image_payload(payload: &str) -> Result<Vec<u8>, InferenceError> {
    let encoded = match payload.split_once(',') {
        Some((metadata, data)) if metadata.starts_with("data:") => data,
        _ => payload,
    };
    BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| InferenceError::Decoding(format!("invalid base64 image: {e}")))
}

#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: reqwest::Client,
}

impl InferenceClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for inference service")?;
        Ok(Self { client })
    }

    /// Swap the face in `target`, using `source` when given and the configured
    /// face model otherwise. The result is mirrored back and re-encoded as JPEG.
    pub async fn infer(
        &self,
        target: &ImageAsset,
        source: Option<&ImageAsset>,
        settings: &SwapSettings,
    ) -> Result<ImageAsset, InferenceError> {
        let params = &settings.params;
        let body = serde_json::to_vec(&SwapRequest {
            target_image: to_data_uri(&target.bytes),
            source_image: source.map(|asset| to_data_uri(&asset.bytes)),
            face_restorer: &params.face_restorer,
            gender_source: params.gender_source,
            gender_target: params.gender_target,
            device: &params.device,
            mask_face: params.mask_face,
            select_source: if source.is_some() {
                SELECT_SOURCE_IMAGE
            } else {
                SELECT_FACE_MODEL
            },
            face_model: &params.face_model,
            codeformer_weight: params.codeformer_weight,
        })?;

        debug!(target = %target.name, endpoint = %settings.endpoint, "Posting swap request");
        let payload = self.post_json(&settings.endpoint, body).await?;

        let response: SwapResponse = serde_json::from_slice(&payload)
            .map_err(|e| InferenceError::Decoding(format!("invalid response JSON: {e}")))?;
        let swapped = decode_image_payload(&response.image)?;

        let quality = settings.quality;
        let bytes =
            tokio::task::spawn_blocking(move || image_ops::mirror_and_reencode(&swapped, quality))
                .await??;

        Ok(ImageAsset::new(
            bytes,
            result_name(&settings.name_prefix, OutputFormat::Jpeg.extension()),
        ))
    }

    /// Ask the service to build a reusable face model named `name` from `faces`.
    pub async fn build_face_model(
        &self,
        endpoint: &str,
        faces: &[ImageAsset],
        name: &str,
    ) -> Result<(), InferenceError> {
        let body = serde_json::to_vec(&FaceModelRequest {
            source_images: faces.iter().map(|face| to_data_uri(&face.bytes)).collect(),
            name,
            compute_method: 0,
        })?;

        debug!(faces = faces.len(), name, endpoint, "Posting face model request");
        self.post_json(endpoint, body).await.map(|_| ())
    }

    async fn post_json(&self, endpoint: &str, body: Vec<u8>) -> Result<Vec<u8>, InferenceError> {
        let resp = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(InferenceError::Transport)?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(InferenceError::Protocol {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        resp.bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(InferenceError::Transport)
    }
}
