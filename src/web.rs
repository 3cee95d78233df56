//! HTTP surface: `/video.mjpg`, `/info`, `/health`

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, PRAGMA, USER_AGENT},
        HeaderValue, Request, StatusCode,
    },
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn, Span};

use crate::camera::CameraDriver;
use crate::config::Config;
use crate::diagnostics;
use crate::streaming::{CaptureMonitor, CaptureState, FrameDistributor, Subscription, STREAM_CONTENT_TYPE};

/// Web server state
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    distributor: Arc<FrameDistributor>,
    driver: Arc<dyn CameraDriver>,
    capture: Option<CaptureMonitor>,
    viewers: Arc<ViewerSlots>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        distributor: Arc<FrameDistributor>,
        driver: Arc<dyn CameraDriver>,
        capture: Option<CaptureMonitor>,
    ) -> Self {
        Self {
            config,
            distributor,
            driver,
            capture,
            viewers: Arc::new(ViewerSlots::default()),
        }
    }
}

/// Build the application router with request-id and request logging layers.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/video.mjpg", get(stream_handler))
        .route("/health", get(health_handler));

    if state.config.server.enable_info {
        app = app.route("/info", get(info_handler));
    }

    app.fallback(not_found).with_state(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(TimestampRequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(request_span as fn(&Request<Body>) -> Span)
                    .on_request(())
                    .on_response(log_response as fn(&Response<Body>, Duration, &Span)),
            )
            // Innermost: Cors needs a body type with Default
            .layer(CorsLayer::permissive()),
    )
}

/// Request ids are the current Unix time in nanoseconds, bumped when two
/// requests land on the same tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampRequestId;

static LAST_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

impl MakeRequestId for TimestampRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let previous = LAST_REQUEST_ID
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let id = now.max(previous + 1);

        HeaderValue::from_str(&id.to_string()).ok().map(RequestId::new)
    }
}

fn header_str<'a>(request: &'a Request<Body>, name: &str) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

fn request_span(request: &Request<Body>) -> Span {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    info_span!(
        "request",
        request_id = %header_str(request, "x-request-id"),
        method = %request.method(),
        path = %request.uri().path(),
        remote_addr = %remote_addr,
        user_agent = %header_str(request, USER_AGENT.as_str()),
    )
}

fn log_response(response: &Response<Body>, latency: Duration, _span: &Span) {
    info!(
        status = response.status().as_u16(),
        latency_ms = latency.as_millis() as u64,
        "Request handled"
    );
}

/// Admission counter for `max-viewers`. Reserving is a single atomic
/// step, so concurrent connects cannot overshoot the limit.
#[derive(Debug, Default)]
struct ViewerSlots {
    active: AtomicUsize,
}

impl ViewerSlots {
    /// Take a slot unless `max` are already held. Zero means unlimited.
    fn try_reserve(&self, max: usize) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// One connected `/video.mjpg` viewer. Deregisters on drop, which is
/// when hyper discards the response body after a disconnect.
struct Viewer {
    distributor: Arc<FrameDistributor>,
    slots: Arc<ViewerSlots>,
    subscription: Option<Subscription>,
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.distributor.unsubscribe(subscription);
        }
        self.slots.release();
    }
}

async fn stream_handler(State(state): State<AppState>) -> Response {
    if state.distributor.is_closed() {
        warn!("Stream requested but capture has stopped");
        return (StatusCode::SERVICE_UNAVAILABLE, "camera stream unavailable\n").into_response();
    }

    let max_viewers = state.config.server.max_viewers;
    if !state.viewers.try_reserve(max_viewers) {
        warn!(max_viewers, "Viewer limit reached, rejecting stream");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many viewers\n").into_response();
    }

    let subscription = state.distributor.subscribe();
    info!(
        subscriber = subscription.id(),
        subscribers = state.distributor.subscriber_count(),
        "Viewer connected"
    );

    let viewer = Viewer {
        distributor: Arc::clone(&state.distributor),
        slots: Arc::clone(&state.viewers),
        subscription: Some(subscription),
    };

    // Header and payload go out as separate chunks, shared with every viewer
    let frames = stream::unfold(viewer, |mut viewer| async move {
        let frame = viewer.subscription.as_mut()?.recv().await?;
        Some((stream::iter(frame.parts().map(Ok::<_, Infallible>)), viewer))
    })
    .flatten();

    (
        [
            (CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (PRAGMA, "no-cache"),
            (CONNECTION, "close"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn info_handler(State(state): State<AppState>) -> Response {
    let path = state.config.camera.device_path.clone();

    match diagnostics::query_formats(Arc::clone(&state.driver), path.clone()).await {
        Ok(formats) => Html(diagnostics::render_info_html(&path, &formats)).into_response(),
        Err(e) => {
            error!(device = %path, error = %e, "Camera diagnostics failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Camera Error: {:#}", e),
            )
                .into_response()
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    capture_state: Option<CaptureState>,
    subscribers: usize,
    frames_sent: u64,
    frames_captured: u64,
    timeouts: u64,
    faults: u64,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let distribution = state.distributor.stats();
    let capture_state = state.capture.as_ref().map(CaptureMonitor::state);
    let capture = state
        .capture
        .as_ref()
        .map(CaptureMonitor::stats)
        .unwrap_or_default();

    let status = match capture_state {
        Some(CaptureState::Faulted) | Some(CaptureState::Closed) | None => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        capture_state,
        subscribers: distribution.subscribers,
        frames_sent: distribution.frames_sent,
        frames_captured: capture.frames_captured,
        timeouts: capture.timeouts,
        faults: capture.faults,
    })
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found\n")
}
