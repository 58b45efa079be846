//! HTTP surface against a server bound to an ephemeral port

use facecam::detect::{DetectionSink, LatestReportSink};
use facecam::device::{Pattern, SimConfig, SimHandle, SimulatedDevice};
use facecam::mjpeg;
use facecam::web::{self, AppState};
use facecam::{
    Camera, CameraGate, CameraSettings, DetectionCounters, DetectionReport, PixelFormat,
    StreamFormat,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

struct TestServer {
    base: String,
    camera: Arc<Camera>,
    handle: SimHandle,
    latest: LatestReportSink,
}

impl TestServer {
    async fn start(fault: impl FnOnce(&mut facecam::device::FaultPlan)) -> Self {
        let device = SimulatedDevice::new(SimConfig {
            initial_format: StreamFormat::new(160, 120, PixelFormat::Raw10),
            pattern: Pattern::Bars,
            frame_interval: Duration::from_millis(5),
            ..SimConfig::default()
        });
        let handle = device.handle();
        handle.inject(fault);

        let settings = CameraSettings {
            lock_timeout: Duration::from_millis(100),
            ..CameraSettings::default()
        };
        let camera = Arc::new(Camera::new(CameraGate::new(Box::new(device)), settings));
        let latest = LatestReportSink::new();
        let state = AppState::new(
            Arc::clone(&camera),
            Arc::new(DetectionCounters::default()),
            latest.shared(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(web::serve(listener, state));

        Self {
            base,
            camera,
            handle,
            latest,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn wait_released(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.camera.gate().is_held() {
            assert!(Instant::now() < deadline, "camera never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_and_index() {
    let server = TestServer::start(|_| {}).await;

    let health: Value = serde_json::from_str(
        &reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap(),
    )
    .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));

    let resp = reqwest::get(server.url("/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    let html = resp.text().await.unwrap();
    assert!(html.contains("src=\"/stream\""));
    assert!(html.contains("/capture"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capture_returns_jpeg() {
    let server = TestServer::start(|_| {}).await;

    let resp = reqwest::get(server.url("/capture")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    assert_eq!(
        resp.headers()["content-disposition"],
        "inline; filename=capture.jpg"
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    assert!(!server.camera.gate().is_held());
    assert_eq!(server.handle.counters().maps, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capture_busy() {
    let server = TestServer::start(|_| {}).await;
    let held = server.camera.gate().acquire(Duration::ZERO).unwrap();

    let resp = reqwest::get(server.url("/capture")).await.unwrap();
    assert_eq!(resp.status(), 500);
    assert_eq!(resp.text().await.unwrap(), "Camera busy");
    drop(held);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_frames_and_disconnect() {
    let server = TestServer::start(|_| {}).await;

    let mut resp = reqwest::get(server.url("/stream")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], mjpeg::STREAM_CONTENT_TYPE);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");

    let mut received = Vec::new();
    while received.len() < 8 * 1024 {
        match resp.chunk().await.unwrap() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => panic!("stream ended early"),
        }
    }
    let head = format!(
        "\r\n--{}\r\nContent-Type: image/jpeg\r\nContent-Length: ",
        mjpeg::BOUNDARY
    );
    assert!(received.starts_with(head.as_bytes()));
    let header_end = received
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap();
    assert_eq!(&received[header_end + 4..header_end + 6], &[0xFF, 0xD8]);
    assert!(server.camera.gate().is_held());

    drop(resp);
    server.wait_released().await;
    let counters = server.handle.counters();
    assert_eq!(counters.maps, 3);
    assert_eq!(counters.unmaps, 3);
    assert!(!counters.streaming);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_buffer_failure_is_500() {
    let server = TestServer::start(|f| f.fail_map_at = Some(2)).await;

    let resp = reqwest::get(server.url("/stream")).await.unwrap();
    assert_eq!(resp.status(), 500);
    assert_eq!(resp.text().await.unwrap(), "Unable to alloc buffers");
    assert!(!server.camera.gate().is_held());
    assert_eq!(server.handle.counters().unmaps, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detections_and_status() {
    let mut server = TestServer::start(|_| {}).await;

    let resp = reqwest::get(server.url("/api/detections")).await.unwrap();
    assert_eq!(resp.status(), 204);

    server.latest.publish(&DetectionReport {
        ts: 42,
        width: 160,
        height: 120,
        faces: Vec::new(),
    });
    let resp = reqwest::get(server.url("/api/detections")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(report["ts"], 42);
    assert_eq!(report["faces"].as_array().map(Vec::len), Some(0));

    reqwest::get(server.url("/capture")).await.unwrap();
    let status: Value = serde_json::from_str(
        &reqwest::get(server.url("/api/status")).await.unwrap().text().await.unwrap(),
    )
    .unwrap();
    assert_eq!(status["camera"]["device"], "sim0");
    assert_eq!(status["camera"]["busy"], false);
    assert_eq!(status["camera"]["format"], "RGBP");
    assert_eq!(status["camera"]["width"], 160);
    assert_eq!(status["detection"]["running"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_survives_bad_frames() {
    let server = TestServer::start(|f| f.short_frames = 2).await;

    let mut resp = reqwest::get(server.url("/stream")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let mut received = Vec::new();
    while received.len() < 8 * 1024 {
        match resp.chunk().await.unwrap() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => panic!("stream ended early"),
        }
    }
    let head = format!("\r\n--{}\r\n", mjpeg::BOUNDARY);
    assert!(received.starts_with(head.as_bytes()));

    drop(resp);
    server.wait_released().await;

    let status: Value = serde_json::from_str(
        &reqwest::get(server.url("/api/status")).await.unwrap().text().await.unwrap(),
    )
    .unwrap();
    let last = &status["camera"]["last_stream"];
    assert_eq!(last["frames_dropped"], 2);
    assert!(last["frames_sent"].as_u64().unwrap() > 0);
    assert_eq!(server.handle.counters().unmaps, 3);
}
