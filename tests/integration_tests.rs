use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use detect_server::{
    endpoints::{app, live_stream, AppState},
    nn::{Detection, Detector},
    sensors::CameraSettings,
};
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tower::ServiceExt;

const BOUNDARY: &str = "test-boundary";
const CHUNK_PREFIX: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Detector stub counting invocations and reporting one fixed box.
struct CountingDetector {
    calls: AtomicUsize,
}

impl CountingDetector {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl Detector for CountingDetector {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Detection {
            bbox: [0.25, 0.25, 0.75, 0.75],
            class_id: 0,
            confidence: 0.9,
        }])
    }
}

fn test_state(dir: &tempfile::TempDir, frames: Option<watch::Receiver<Option<Arc<RgbImage>>>>) -> Arc<AppState> {
    let upload_dir = dir.path().join("uploads");
    let result_path = dir.path().join("static/result.jpg");
    std::fs::create_dir_all(&upload_dir).unwrap();
    std::fs::create_dir_all(result_path.parent().unwrap()).unwrap();

    Arc::new(AppState {
        detector: Arc::new(CountingDetector::new()),
        upload_dir,
        result_path,
        camera: CameraSettings {
            device: "/dev/video0".into(),
            resolution: Some((64, 48)),
            fps: Some(30),
        },
        frames,
    })
}

/// Build a `multipart/form-data` body with a single file field.
fn multipart_body(field_name: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(field_name: &str, filename: &str, content: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(field_name, filename, content)))
        .unwrap()
}

fn small_jpeg() -> Vec<u8> {
    let image = RgbImage::from_pixel(16, 16, Rgb([12, 128, 240]));
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, 90)
        .encode(image.as_raw(), 16, 16, image::ColorType::Rgb8)
        .unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn upload_without_image_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(test_state(&dir, None));

    let response = app
        .oneshot(upload_request("attachment", "notes.txt", b"not an image"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"No file uploaded");
}

#[tokio::test]
async fn upload_returns_annotated_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, None);
    let app = app(Arc::clone(&state));

    let response = app
        .oneshot(upload_request("image", "scene.jpg", &small_jpeg()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/jpeg"
    );

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(!body.is_empty());
    image::load_from_memory(&body).expect("response body must decode as an image");

    // The annotated result is also persisted at the fixed path
    let persisted = std::fs::read(&state.result_path).unwrap();
    assert_eq!(&persisted[..], &body[..]);

    // Exactly one upload landed in the upload dir
    assert_eq!(std::fs::read_dir(&state.upload_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn upload_with_undecodable_image_is_a_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(test_state(&dir, None));

    let response = app
        .oneshot(upload_request("image", "broken.jpg", b"\xff\xd8 truncated"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn video_endpoint_serves_multipart_content_type() {
    let dir = tempfile::tempdir().unwrap();
    let (_tx, rx) = watch::channel(None);
    let app = app(test_state(&dir, Some(rx)));

    let response = app
        .oneshot(Request::builder().uri("/video").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "multipart/x-mixed-replace; boundary=frame"
    );
}

#[tokio::test]
async fn live_stream_chunks_are_boundary_framed_jpegs() {
    let (tx, rx) = watch::channel(None);
    let mut stream = Box::pin(live_stream(rx));

    for i in 0..5_u8 {
        let value = i * 40;
        tx.send(Some(Arc::new(RgbImage::from_pixel(
            32,
            24,
            Rgb([value, value, value]),
        ))))
        .unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("a published frame must produce a chunk")
            .unwrap()
            .unwrap();

        assert!(chunk.starts_with(CHUNK_PREFIX));
        assert!(chunk.ends_with(b"\r\n"));

        let payload = &chunk[CHUNK_PREFIX.len()..chunk.len() - 2];
        let decoded = image::load_from_memory(payload).expect("chunk payload must be a JPEG");
        assert_eq!(decoded.to_rgb8().dimensions(), (32, 24));
    }

    // Five published frames produce five chunks and not one more
    let pending = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn live_stream_coalesces_burst_publishes() {
    let (tx, rx) = watch::channel(None);
    let mut stream = Box::pin(live_stream(rx));

    for value in [10_u8, 20, 30] {
        tx.send(Some(Arc::new(RgbImage::from_pixel(
            8,
            8,
            Rgb([value, value, value]),
        ))))
        .unwrap();
    }

    // A slow client sees at most one chunk per poll, carrying the newest frame
    let chunk = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let payload = &chunk[CHUNK_PREFIX.len()..chunk.len() - 2];
    let decoded = image::load_from_memory(payload).unwrap().to_rgb8();
    // Lossy encoding may shift the value slightly; it must clearly be the
    // last frame (30) and not an earlier one (10 or 20)
    assert!((decoded.get_pixel(0, 0)[0] as i16 - 30).abs() <= 5);

    let pending = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn index_and_healthcheck_respond() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, None);

    let response = app(Arc::clone(&state))
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(std::str::from_utf8(&body).unwrap().contains("/video"));

    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/healthcheck")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
