// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, DefaultBodyLimit, MatchedPath, Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine as _;
use opentelemetry::{global, KeyValue};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};
use time::format_description::well_known::Rfc3339;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, warn};

use detkit_api::{
    BandwidthReport, DetectRequest, ErrorResponse, FrameMetricReport, HealthResponse,
    IceCandidateRequest, ModeResponse, OfferRequest, OfferResponse, SuccessResponse,
};
use detkit_core::types::{now_ms, DetectionResult, Frame, FrameMetricRecord};
use detkit_engine::PipelineError;

use crate::config::{Config, CorsConfig};
use crate::gateway::{CandidateOutcome, GatewayError};
use crate::state::AppState;
use crate::transport::{TransportConnector, UnavailableConnector};
use crate::websocket;

static HTTP_METRICS: OnceLock<(
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Histogram<f64>,
)> = OnceLock::new();

/// RFC3339 rendering of a wall-clock time.
pub fn system_time_to_rfc3339(time: SystemTime) -> String {
    time::OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Matches an `Origin` against one allowlist entry.
///
/// Supports `*` (anything), `scheme://host:*` (any numeric port) and exact origins.
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix_without_port) = pattern.strip_suffix(":*") {
        let Some(port_str) =
            origin.strip_prefix(prefix_without_port).and_then(|rest| rest.strip_prefix(':'))
        else {
            return false;
        };
        return !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit());
    }

    origin == pattern
}

pub(crate) fn origin_allowed(config: &CorsConfig, origin: &str) -> bool {
    config.allowed_origins.iter().any(|p| origin_matches_pattern(origin, p))
}

/// Rejects mutating `/api/` requests whose `Origin` is not allowlisted.
///
/// Not authentication: requests without an `Origin` (curl, native clients) pass.
async fn origin_guard_middleware(
    State(app_state): State<Arc<AppState>>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    use axum::http::Method;

    let path = req.uri().path();
    let method = req.method();
    let is_mutating = matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE);

    if path.starts_with("/api/") && is_mutating {
        if let Some(origin) = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
            if !origin_allowed(&app_state.config.server.cors, origin) {
                warn!(%origin, %method, %path, "Rejected request: Origin not allowed");
                return AppError::Forbidden(
                    "Origin not allowed (configure [server.cors].allowed_origins)".to_string(),
                )
                .into_response();
            }
        }
    }

    next.run(req).await
}

fn create_cors_layer(config: &CorsConfig) -> CorsLayer {
    use axum::http::{HeaderValue, Method};

    if config.allowed_origins.iter().any(|o| o == "*") {
        info!("CORS configured to allow all origins (permissive mode)");
        return CorsLayer::permissive();
    }
    if config.allowed_origins.is_empty() {
        info!("CORS configured with no allowed origins (most restrictive)");
        return CorsLayer::new();
    }

    let patterns = config.clone();
    info!(allowed_origins = ?patterns.allowed_origins, "CORS configured with origin allowlist");

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        origin.to_str().is_ok_and(|origin| origin_allowed(&patterns, origin))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}

async fn health_handler(State(app_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        mode: app_state.mode,
        timestamp: system_time_to_rfc3339(SystemTime::now()),
        clients: app_state.gateway.client_count(),
    })
}

async fn mode_handler(State(app_state): State<Arc<AppState>>) -> Json<ModeResponse> {
    Json(ModeResponse { mode: app_state.mode })
}

async fn metrics_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.metrics.snapshot())
}

async fn recent_metrics_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.metrics.recent_stats())
}

/// Timings reported by a client that ran detection itself.
async fn frame_metric_handler(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Json<FrameMetricReport>, JsonRejection>,
) -> Result<Json<SuccessResponse>, AppError> {
    let Json(report) = payload?;
    app_state.metrics.record(report.into_record(now_ms()));
    Ok(Json(SuccessResponse::OK))
}

async fn bandwidth_handler(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Json<BandwidthReport>, JsonRejection>,
) -> Result<Json<SuccessResponse>, AppError> {
    let Json(report) = payload?;
    let valid = |kbps: f64| kbps.is_finite() && kbps >= 0.0;
    if !valid(report.uplink_kbps) || !valid(report.downlink_kbps) {
        return Err(AppError::BadRequest(
            "bandwidth must be a finite, non-negative kbps value".to_string(),
        ));
    }
    app_state.metrics.record_bandwidth(report.uplink_kbps, report.downlink_kbps);
    Ok(Json(SuccessResponse::OK))
}

async fn reset_metrics_handler(State(app_state): State<Arc<AppState>>) -> Json<SuccessResponse> {
    app_state.metrics.reset();
    info!("Metrics run reset");
    Json(SuccessResponse::OK)
}

/// Single-frame detection for clients that cannot run the model themselves.
async fn detect_handler(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Json<DetectRequest>, JsonRejection>,
) -> Result<Json<DetectionResult>, AppError> {
    let Json(request) = payload?;
    let pixels = base64::engine::general_purpose::STANDARD
        .decode(request.data.as_bytes())
        .map_err(|e| AppError::BadRequest(format!("data is not valid base64: {e}")))?;

    let frame = Frame::new(
        pixels,
        request.width,
        request.height,
        request.capture_ts.unwrap_or_else(now_ms),
        request.frame_id,
    );
    let expected_len = frame.width as usize * frame.height as usize * 3;
    if expected_len == 0 || frame.pixels.len() != expected_len {
        app_state.metrics.record_dropped();
        return Err(AppError::BadRequest(format!(
            "expected {} bytes of RGB data for {}x{}, got {}",
            expected_len,
            frame.width,
            frame.height,
            frame.pixels.len()
        )));
    }

    let result = app_state.pipeline.detect(frame).await.inspect_err(|_| {
        app_state.metrics.record_dropped();
    })?;
    app_state.metrics.record(FrameMetricRecord::from_result(&result, now_ms()));
    Ok(Json(result))
}

async fn offer_handler(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> Result<Json<OfferResponse>, AppError> {
    let Json(request) = payload?;
    let answer = app_state.gateway.handle_offer(&request.client_id, &request.offer).await?;
    Ok(Json(OfferResponse { answer }))
}

async fn ice_candidate_handler(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Json<IceCandidateRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, AppError> {
    let Json(request) = payload?;
    match app_state.gateway.handle_candidate(&request.client_id, request.candidate).await {
        Ok(CandidateOutcome::Queued | CandidateOutcome::Applied)
        | Err(GatewayError::UnknownClient(_)) => Ok(Json(SuccessResponse::OK)),
        Err(e) => Err(e.into()),
    }
}

async fn remove_client_handler(
    State(app_state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Json<SuccessResponse> {
    app_state.gateway.remove_client(&client_id).await;
    Json(SuccessResponse::OK)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    // Browsers always send Origin on upgrades; reuse the CORS allowlist.
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !origin_allowed(&app_state.config.server.cors, origin) {
            warn!(%origin, "Rejected WebSocket connection: Origin not allowed");
            return AppError::Forbidden("WebSocket Origin not allowed".to_string()).into_response();
        }
    }

    ws.on_upgrade(move |socket| websocket::handle_websocket(socket, app_state))
}

async fn not_found_handler(uri: axum::http::Uri) -> AppError {
    debug!(path = %uri.path(), "No route");
    AppError::NotFound(format!("No route for {}", uri.path()))
}

async fn metrics_middleware(req: axum::http::Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.extensions().get::<MatchedPath>().map_or_else(
        || "unmatched".to_owned(),
        |matched_path| matched_path.as_str().to_owned(),
    );

    let response = next.run(req).await;

    let (counter, histogram) = HTTP_METRICS
        .get_or_init(|| {
            let meter = global::meter("dkit_server");
            (
                meter.u64_counter("http.server.requests").build(),
                meter.f64_histogram("http.server.duration").with_unit("s").build(),
            )
        })
        .clone();

    let labels = [
        KeyValue::new("http.method", method.to_string()),
        KeyValue::new("http.route", path),
        KeyValue::new("http.status_code", response.status().as_u16().to_string()),
    ];
    counter.add(1, &labels);
    histogram.record(start.elapsed().as_secs_f64(), &labels);

    response
}

/// The media transport compiled into this build: webrtc-rs with the `webrtc` feature.
#[cfg(feature = "webrtc")]
pub fn default_connector() -> Arc<dyn TransportConnector> {
    match crate::rtc::RtcConnector::new() {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            warn!(error = %e, "WebRTC transport unavailable, peer offers will be rejected");
            Arc::new(UnavailableConnector)
        },
    }
}

/// The media transport compiled into this build. Without the `webrtc` feature every
/// offer is rejected.
#[cfg(not(feature = "webrtc"))]
pub fn default_connector() -> Arc<dyn TransportConnector> {
    Arc::new(UnavailableConnector)
}

/// Creates the application with [`default_connector`].
pub fn create_app(config: Config) -> (Router, Arc<AppState>) {
    create_app_with(config, default_connector())
}

/// Creates the Axum application with all routes and middleware, negotiating peer
/// sessions through `connector`.
pub fn create_app_with(
    config: Config,
    connector: Arc<dyn TransportConnector>,
) -> (Router, Arc<AppState>) {
    let app_state = Arc::new(AppState::new(config, connector));
    let max_body_size = app_state.config.server.max_body_size;

    let router = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/mode", get(mode_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/metrics/recent", get(recent_metrics_handler))
        .route("/api/metrics/frame", post(frame_metric_handler))
        .route("/api/metrics/bandwidth", post(bandwidth_handler))
        .route("/api/metrics/reset", post(reset_metrics_handler))
        .route("/api/detect", post(detect_handler))
        .route("/api/webrtc/offer", post(offer_handler))
        .route("/api/webrtc/ice-candidate", post(ice_candidate_handler))
        .route("/api/webrtc/clients/{id}", delete(remove_client_handler))
        .route("/ws", get(websocket_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(max_body_size));

    let cors_layer = create_cors_layer(&app_state.config.server.cors);

    let router = router
        .with_state(Arc::clone(&app_state))
        .layer(middleware::from_fn_with_state(Arc::clone(&app_state), origin_guard_middleware))
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let route = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map_or_else(|| request.uri().path(), |matched| matched.as_str());
                    tracing::info_span!("http_request", http_method = %request.method(), http_route = %route)
                })
                // Per-request logs stay out of INFO; failures surface at WARN.
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            header::HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(cors_layer);

    (router, app_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received CTRL-C signal, initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM signal, initiating graceful shutdown"),
    }
}

/// Serves the API until SIGINT/SIGTERM, then closes every peer session.
///
/// # Errors
///
/// Returns an error if the address cannot be parsed or bound.
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let (app, app_state) = create_app(config.clone());
    let addr: SocketAddr = config.server.address.parse()?;

    if config.telemetry.enable {
        crate::telemetry::start_detection_metrics(
            Arc::clone(&app_state.metrics),
            Duration::from_secs(5),
        );
    }

    info!(address = %addr, mode = %app_state.mode, "Starting HTTP API server");

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let app_state = Arc::clone(&app_state);
        async move {
            shutdown_signal().await;
            app_state.gateway.shutdown().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    axum_server::bind(addr).handle(handle).serve(app.into_make_service()).await.map_err(|e| {
        error!(error = %e, "API server error");
        e.into()
    })
}

/// Failures surfaced to HTTP clients as `{ "error": "..." }`.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    /// Peer negotiation failed; the session keeps its prior state.
    Negotiation(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            Self::Forbidden(e) => (StatusCode::FORBIDDEN, e),
            Self::NotFound(e) => (StatusCode::NOT_FOUND, e),
            Self::Negotiation(e) | Self::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::UnknownClient(id) => Self::NotFound(format!("unknown client: {id}")),
            other => Self::Negotiation(other.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Preprocessing(_) => Self::BadRequest(e.to_string()),
            PipelineError::Aborted(_) => Self::Internal(e.to_string()),
        }
    }
}
