use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::camera::{Camera, CameraStatus};
use crate::detect::SharedReport;
use crate::error::CaptureError;
use crate::mjpeg;
use crate::session::Flow;
use crate::stats::{DetectionCounters, DetectionStats};

/// Encoded parts buffered between the capture thread and the response body
const STREAM_CHANNEL_DEPTH: usize = 2;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Camera</title>
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body { font-family: Arial, sans-serif; margin: 0; padding: 20px; background: #f0f0f0; text-align: center; }
        .buttons { margin: 12px 0; }
        button { padding: 8px 16px; margin: 0 4px; }
        img { max-width: 100%; border-radius: 6px; background: #000; }
        #faces { font-family: monospace; color: #555; }
    </style>
</head>
<body>
    <h1>Camera</h1>
    <div class="buttons">
        <button onclick="location.reload()">Refresh</button>
        <button onclick="window.open('/capture')">Capture Image</button>
    </div>
    <img id="stream" src="/stream" />
    <p id="faces"></p>
    <script>
        async function poll() {
            try {
                const res = await fetch('/api/detections');
                if (res.status === 200) {
                    const report = await res.json();
                    document.getElementById('faces').textContent =
                        report.faces.length + ' face(s) @ ' + report.width + 'x' + report.height;
                }
            } catch (e) {}
            setTimeout(poll, 1000);
        }
        poll();
    </script>
</body>
</html>
"#;

/// Web server state
#[derive(Clone)]
pub struct AppState {
    camera: Arc<Camera>,
    detection: Arc<DetectionCounters>,
    latest: SharedReport,
}

impl AppState {
    pub fn new(camera: Arc<Camera>, detection: Arc<DetectionCounters>, latest: SharedReport) -> Self {
        Self {
            camera,
            detection,
            latest,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/stream", get(stream_handler))
        .route("/capture", get(capture_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/detections", get(detections_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web server on an already bound listener
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Start the web server
pub async fn run_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting web server on http://{}", listener.local_addr()?);
    serve(listener, state).await
}

fn error_response(err: &CaptureError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain")],
        err.reason(),
    )
        .into_response()
}

/// Index page handler
async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// MJPEG stream handler
///
/// The capture loop runs on a blocking thread and pushes multipart chunks
/// into a bounded channel. Once the client goes away the body drops the
/// receiver, the next send fails and the loop stops.
async fn stream_handler(State(state): State<AppState>) -> Response {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_DEPTH);
    let camera = Arc::clone(&state.camera);

    tokio::task::spawn_blocking(move || {
        let mut ready_tx = Some(ready_tx);
        let result = camera.stream_jpeg(
            |_| {
                if let Some(ready) = ready_tx.take() {
                    let _ = ready.send(Ok(()));
                }
            },
            |jpeg| match tx.blocking_send(mjpeg::part(jpeg)) {
                Ok(()) => Flow::Continue,
                Err(_) => {
                    debug!("Stream client disconnected");
                    Flow::Stop
                }
            },
        );
        if let Err(e) = result {
            match ready_tx.take() {
                Some(ready) => {
                    let _ = ready.send(Err(e));
                }
                None => debug!(error = %e, "Stream ended by camera error"),
            }
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Stream start failed: {}", e);
            return error_response(&e);
        }
        Err(_) => {
            error!("Stream worker exited before starting");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Camera error").into_response();
        }
    }

    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });

    (
        [
            (header::CONTENT_TYPE, mjpeg::STREAM_CONTENT_TYPE),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

/// Single JPEG capture handler
async fn capture_handler(State(state): State<AppState>) -> Response {
    let camera = Arc::clone(&state.camera);
    match tokio::task::spawn_blocking(move || camera.capture_jpeg()).await {
        Ok(Ok(jpeg)) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CONTENT_DISPOSITION, "inline; filename=capture.jpg"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            jpeg,
        )
            .into_response(),
        Ok(Err(e)) => {
            error!("Capture failed: {}", e);
            error_response(&e)
        }
        Err(e) => {
            error!("Capture worker failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Camera error").into_response()
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    camera: CameraStatus,
    detection: DetectionStats,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        camera: state.camera.status(),
        detection: state.detection.snapshot(),
    })
}

/// Latest detection report, 204 until the detector produced one
async fn detections_handler(State(state): State<AppState>) -> Response {
    let latest = state.latest.read().clone();
    match latest {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
