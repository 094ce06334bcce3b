//! HTTP listeners that serve each stream kind as multipart MJPEG.
//!
//! One request is one streaming session: the session starts when the
//! GET arrives and stops when the client drops the response body.

use crate::mjpeg;
use crate::service::{RollcallService, ServiceError};
use crate::session::SessionKind;
use crate::stream::FrameStream;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
struct StreamState {
    kind: SessionKind,
    service: Arc<RollcallService>,
}

pub fn stream_path(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Recognition => "/recognition/stream",
        SessionKind::EnrollmentPreview => "/enrollment/stream",
    }
}

/// Routes for one stream kind. Anything but `GET` on the stream path is
/// refused before the camera is touched.
pub fn router(kind: SessionKind, service: Arc<RollcallService>) -> Router {
    Router::new()
        .route(stream_path(kind), get(stream_frames))
        .with_state(StreamState { kind, service })
}

/// Serve `kind` on `listener` until the listener fails.
pub async fn serve(listener: TcpListener, kind: SessionKind, service: Arc<RollcallService>) -> std::io::Result<()> {
    tracing::info!(
        kind = %kind,
        addr = %listener.local_addr()?,
        path = stream_path(kind),
        "stream listener ready"
    );
    axum::serve(listener, router(kind, service)).await
}

async fn stream_frames(State(StreamState { kind, service }): State<StreamState>) -> Response {
    let started = match tokio::task::spawn_blocking(move || service.start(kind)).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(kind = %kind, error = %e, "stream start task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match started {
        Ok(stream) => {
            tracing::info!(kind = %kind, "stream client connected");
            multipart_response(kind, stream)
        }
        Err(e) => {
            tracing::info!(kind = %kind, error = %e, "stream refused");
            e.into_response()
        }
    }
}

fn multipart_response(kind: SessionKind, stream: FrameStream) -> Response {
    // The body owns the stream, so a client hanging up stops the session.
    let units = futures::stream::unfold(stream, move |mut stream| async move {
        match stream.next_unit().await {
            Some(unit) => Some((Ok::<_, Infallible>(unit), stream)),
            None => {
                match stream.take_error() {
                    Some(e) => tracing::error!(kind = %kind, error = %e, "stream ended with error"),
                    None => tracing::info!(kind = %kind, "stream ended"),
                }
                None
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, mjpeg::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(units),
    )
        .into_response()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::AlreadyRunning(_) => StatusCode::CONFLICT,
            ServiceError::DeviceBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("{self}\n")).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Overlay;
    use crate::pipeline::{FramePipeline, PipelineSlot};
    use crate::service::{ServiceParts, ServiceSettings};
    use crate::session::{SessionPhase, SessionSettings};
    use crate::testing::{manual_clock, RecordingSink, ScriptedAnalyzer, ScriptedSource, SourceMonitor};
    use axum::http::{Method, Request};
    use futures::StreamExt;
    use rollcall_core::{EmbeddingRepository, EmbeddingStore, KnownIdentity, L2Matcher, StoreError};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    struct Empty;

    impl EmbeddingRepository for Empty {
        fn list_active_encodings(&self) -> Result<Vec<KnownIdentity>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn service() -> (Arc<RollcallService>, SourceMonitor) {
        let source = ScriptedSource::healthy();
        let camera = source.monitor();
        let clock = manual_clock();
        let service = Arc::new(RollcallService::new(ServiceParts {
            slot: PipelineSlot::new(FramePipeline::new(
                Box::new(source),
                Box::new(ScriptedAnalyzer::empty()),
                1,
            )),
            store: Arc::new(EmbeddingStore::new(Arc::new(Empty))),
            matcher: Arc::new(L2Matcher),
            sink: RecordingSink::new(clock.clone()),
            clock,
            overlay: Arc::new(Overlay::boxes_only()),
            settings: ServiceSettings {
                threshold: 20.0,
                cooldown_minutes: 5,
                auto_mark: true,
                session: SessionSettings {
                    frame_interval: Duration::from_millis(5),
                    ..SessionSettings::default()
                },
            },
        }));
        (service, camera)
    }

    async fn request(app: &Router, method: Method, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn get_stream(app: &Router, kind: SessionKind) -> Response {
        request(app, Method::GET, stream_path(kind)).await
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    async fn wait_idle(service: &RollcallService, kind: SessionKind) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while service.phase(kind) != SessionPhase::Idle {
            assert!(tokio::time::Instant::now() < deadline, "session still active");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_streams_multipart_frames() {
        let (service, _camera) = service();
        let app = router(SessionKind::Recognition, service);

        let response = get_stream(&app, SessionKind::Recognition).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], mjpeg::CONTENT_TYPE);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache, no-store");

        let mut body = response.into_body().into_data_stream();
        let unit = body.next().await.unwrap().unwrap();
        assert!(unit.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(unit.ends_with(b"\r\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_other_methods_do_not_start_camera() {
        let (service, camera) = service();
        let app = router(SessionKind::Recognition, Arc::clone(&service));

        for method in [Method::DELETE, Method::POST, Method::PUT] {
            let response = request(&app, method, stream_path(SessionKind::Recognition)).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        }
        assert_eq!(camera.starts(), 0);
        assert_eq!(service.phase(SessionKind::Recognition), SessionPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_path_is_not_found() {
        let (service, camera) = service();
        let app = router(SessionKind::Recognition, service);

        for uri in ["/favicon.ico", "/", stream_path(SessionKind::EnrollmentPreview)] {
            let response = request(&app, Method::GET, uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        assert_eq!(camera.starts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_client_gets_conflict() {
        let (service, _camera) = service();
        let app = router(SessionKind::EnrollmentPreview, service);

        let first = get_stream(&app, SessionKind::EnrollmentPreview).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = get_stream(&app, SessionKind::EnrollmentPreview).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(body_text(second).await, "preview stream already running\n");
        drop(first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_preview_unavailable_while_recognition_holds_camera() {
        let (service, _camera) = service();
        let recognition = router(SessionKind::Recognition, Arc::clone(&service));
        let preview = router(SessionKind::EnrollmentPreview, Arc::clone(&service));

        let running = get_stream(&recognition, SessionKind::Recognition).await;
        assert_eq!(running.status(), StatusCode::OK);

        let refused = get_stream(&preview, SessionKind::EnrollmentPreview).await;
        assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(refused).await, "camera held by the recognition session\n");
        assert_eq!(service.phase(SessionKind::Recognition), SessionPhase::Running);
        drop(running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_body_releases_camera() {
        let (service, camera) = service();
        let app = router(SessionKind::Recognition, Arc::clone(&service));

        let response = get_stream(&app, SessionKind::Recognition).await;
        let mut body = response.into_body().into_data_stream();
        body.next().await.unwrap().unwrap();
        assert!(camera.is_started());
        drop(body);

        wait_idle(&service, SessionKind::Recognition).await;
        assert!(!camera.is_started());

        let again = get_stream(&app, SessionKind::Recognition).await;
        assert_eq!(again.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_over_tcp() {
        let (service, _camera) = service();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, SessionKind::Recognition, Arc::clone(&service)));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /recognition/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        while !String::from_utf8_lossy(&data).contains("--frame\r\n") {
            let read = client.read(&mut chunk).await.unwrap();
            assert!(read > 0, "connection closed early");
            data.extend_from_slice(&chunk[..read]);
        }
        let text = String::from_utf8_lossy(&data).to_ascii_lowercase();
        assert!(text.starts_with("http/1.1 200 ok\r\n"));
        assert!(text.contains("content-type: multipart/x-mixed-replace; boundary=frame\r\n"));

        drop(client);
        wait_idle(&service, SessionKind::Recognition).await;
    }
}
