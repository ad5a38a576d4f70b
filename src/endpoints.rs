//! Endpoints of HTTP server.
//!
use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context};
use axum::{
    body::StreamBody,
    extract::Multipart,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Router,
};
use bytes::Bytes;
use chrono::Local;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::{
    nn::Detector,
    pipeline::FrameReceiver,
    render::{as_jpeg_stream_item, draw_detections, encode_jpeg},
    sensors::{self, CameraSettings},
};

/// Shared state handed to all handlers.
pub struct AppState {
    pub detector: Arc<dyn Detector>,
    pub upload_dir: PathBuf,
    pub result_path: PathBuf,
    pub camera: CameraSettings,
    /// Latest frame of the live pipeline; `None` in per-request mode, where
    /// `/video` opens the camera itself.
    pub frames: Option<FrameReceiver>,
}

/// Build the router with all endpoints.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/upload", post(upload))
        .route("/video", get(video))
        .layer(Extension(state))
}

const INDEX_HTML: &str = r#"
<body>
<div class="container">
    <div class="row">
        <div class="col-lg-8 offset-lg-2">
            <h3 class="mt-5">Object Detection</h3>
            <form action="/upload" method="post" enctype="multipart/form-data">
                <input type="file" name="image">
                <input type="submit" value="Detect">
            </form>
            <h3 class="mt-5">Live Stream</h3>
            <img src="/video" width="100%">
        </div>
    </div>
</div>
</body>
"#;

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Landing page with the upload form and the live feed.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Single-image detection endpoint.
///
/// Saves the uploaded file under a timestamped name, runs the detector on it
/// once, writes the annotated result to the configured path and returns its
/// bytes. Requests without an `image` field are rejected with 400.
pub async fn upload(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut uploaded: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .context("reading multipart field")?
    {
        if field.name() == Some("image") {
            let filename = field.file_name().unwrap_or("upload.jpg").to_owned();
            let data = field.bytes().await.context("reading upload body")?;
            uploaded = Some((filename, data));
            break;
        }
    }

    let Some((filename, data)) = uploaded else {
        return Ok((StatusCode::BAD_REQUEST, "No file uploaded").into_response());
    };

    // Timestamp prefix as the only collision avoidance
    let saved_path = state.upload_dir.join(format!(
        "{}_{}",
        Local::now().format("%Y%m%d%H%M%S"),
        filename
    ));
    tokio::fs::write(&saved_path, &data)
        .await
        .context("saving upload")?;
    log::info!("Saved upload to {}", saved_path.display());

    // Decoding and inference are blocking, keep them off the runtime workers
    let state_ = Arc::clone(&state);
    let annotated = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let image = image::open(&saved_path).context("decoding upload")?.to_rgb8();
        let detections = state_.detector.detect(&image)?;
        encode_jpeg(&draw_detections(image, &detections))
    })
    .await
    .map_err(|err| anyhow!("inference task failed: {err}"))??;

    tokio::fs::write(&state.result_path, &annotated)
        .await
        .context("writing result image")?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], annotated).into_response())
}

/// Live annotated video endpoint.
///
/// The response is a `multipart/x-mixed-replace` stream that stays open until
/// the client disconnects.
pub async fn video(Extension(state): Extension<Arc<AppState>>) -> Response {
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    match &state.frames {
        Some(frames) => (headers, StreamBody::new(live_stream(frames.clone()))).into_response(),
        None => {
            let stream = per_request_stream(Arc::clone(&state));
            (headers, StreamBody::new(stream)).into_response()
        }
    }
}

/// Lazy MJPEG sequence over the shared latest-frame slot.
///
/// The watch channel wakes the stream whenever the detection loop publishes,
/// so no CPU is burned while the pipeline is idle. Frames published faster
/// than the client consumes them are coalesced, never duplicated.
pub fn live_stream(
    mut frames: FrameReceiver,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        loop {
            let frame = frames.borrow_and_update().clone();
            if let Some(frame) = frame {
                match encode_jpeg(&frame) {
                    Ok(jpeg) => yield Ok::<_, std::io::Error>(as_jpeg_stream_item(&jpeg)),
                    Err(err) => log::error!("JPEG encoding failed: {err:#}"),
                }
            }
            if frames.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Per-request pipeline: the camera is opened for this response alone and
/// every frame runs through the detector before being encoded.
fn per_request_stream(state: Arc<AppState>) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel::<Bytes>(1);

    std::thread::spawn(move || {
        let capture_fn = match sensors::get_capture_fn(&state.camera) {
            Ok(capture_fn) => capture_fn,
            Err(err) => {
                log::error!("Failed to open camera: {err:#}");
                return;
            }
        };

        loop {
            let Some(frame) = capture_fn() else {
                break;
            };
            let annotated = match state.detector.detect(&frame) {
                Ok(detections) => draw_detections(frame, &detections),
                Err(err) => {
                    log::error!("Inference failed: {err:#}");
                    break;
                }
            };
            let Ok(jpeg) = encode_jpeg(&annotated) else {
                continue;
            };

            // Fails once the client is gone and the receiver was dropped
            if tx.blocking_send(as_jpeg_stream_item(&jpeg)).is_err() {
                break;
            }
        }

        log::info!("Camera released");
    });

    ReceiverStream::new(rx).map(Ok::<_, std::io::Error>)
}

/// Plain-text 500 wrapper; handler failures surface unstyled.
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
