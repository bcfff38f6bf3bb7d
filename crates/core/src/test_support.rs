//! Fake face-swap service and synthetic images for tests.
//!
//! The fake echoes the target image back unless the target bytes start with
//! one of the markers below, which select a failure mode.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use tokio::net::TcpListener;

use crate::image_ops::{encode, solid, OutputFormat};
use crate::inference::IMAGE_DATA_URI_PREFIX;

pub(crate) const FAIL_MARKER: &[u8] = b"FAIL";
pub(crate) const NOT_JSON_MARKER: &[u8] = b"NOTJSON";
pub(crate) const BAD_BASE64_MARKER: &[u8] = b"BADB64";
pub(crate) const NOT_IMAGE_MARKER: &[u8] = b"NOTIMAGE";

type Requests = Arc<Mutex<Vec<serde_json::Value>>>;

pub(crate) struct FakeReactor {
    pub endpoint: String,
    pub face_model_endpoint: String,
    requests: Requests,
    _server: tokio::task::JoinHandle<()>,
}

impl FakeReactor {
    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.requests.lock().unwrap().clone()
    }
}

pub(crate) async fn spawn_fake_reactor() -> FakeReactor {
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/reactor/image", post(fake_swap))
        .route("/reactor/facemodels", post(fake_face_model))
        .with_state(requests.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake reactor");
    let addr = listener.local_addr().expect("fake reactor address");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    FakeReactor {
        endpoint: format!("http://{addr}/reactor/image"),
        face_model_endpoint: format!("http://{addr}/reactor/facemodels"),
        requests,
        _server: server,
    }
}

/// An endpoint on a port nothing listens on.
pub(crate) async fn unreachable_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind closed port");
    let addr = listener.local_addr().expect("closed port address");
    drop(listener);
    format!("http://{addr}/reactor/image")
}

async fn fake_swap(
    State(requests): State<Requests>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    requests.lock().unwrap().push(body.clone());

    let target = body["target_image"].as_str().unwrap_or_default();
    let encoded = target.strip_prefix(IMAGE_DATA_URI_PREFIX).unwrap_or(target);
    let bytes = BASE64_STANDARD.decode(encoded).unwrap_or_default();

    if bytes.starts_with(FAIL_MARKER) {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    } else if bytes.starts_with(NOT_JSON_MARKER) {
        (StatusCode::OK, "this is not json").into_response()
    } else if bytes.starts_with(BAD_BASE64_MARKER) {
        Json(serde_json::json!({ "image": "%%% not base64 %%%" })).into_response()
    } else if bytes.starts_with(NOT_IMAGE_MARKER) {
        Json(serde_json::json!({ "image": BASE64_STANDARD.encode(b"plain text") }))
            .into_response()
    } else {
        Json(serde_json::json!({ "image": BASE64_STANDARD.encode(&bytes) })).into_response()
    }
}

async fn fake_face_model(
    State(requests): State<Requests>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    requests.lock().unwrap().push(body);
    StatusCode::OK
}

/// PNG whose left half is red and right half is blue.
pub(crate) fn split_color_png(width: u32, height: u32) -> Vec<u8> {
    let mut image = solid(width, height, [255, 0, 0, 255]);
    for x in width / 2..width {
        for y in 0..height {
            image.put_pixel(x, y, image::Rgba([0, 0, 255, 255]));
        }
    }
    encode(&image, OutputFormat::Png, 100).expect("encode test png")
}
