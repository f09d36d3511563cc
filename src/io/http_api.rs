//! HTTP JSON transport for the engine operations
//!
//! Routes:
//! - `POST /entries` - manual entry `{subject_id, latitude?, longitude?, method?}`
//! - `POST /exits` - manual exit, same body
//! - `POST /pings` - location ping `{subject_id, latitude, longitude}`
//! - `POST /entries/bulk` - `{subject_ids, method?}`
//! - `GET /occupancy`, `GET /inside`, `GET /stats/today`
//! - `GET /overstays?minutes=N` (defaults to the configured limit)
//! - `GET /metrics` (Prometheus text), `GET /health`
//!
//! Errors are `{"error": code, "message": text}` with 400 for invalid input,
//! 404 for unknown subjects, 409 for business rejections and 500 for store
//! failures.

use crate::domain::error::AccessError;
use crate::domain::types::{AccessMethod, Coordinate, SubjectId};
use crate::io::prometheus::{format_prometheus_metrics, CONTENT_TYPE as PROMETHEUS_CONTENT_TYPE};
use crate::services::engine::AccessEngine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Shared state for request handlers
pub struct ApiState {
    pub engine: Arc<AccessEngine>,
    pub site_id: String,
    /// Used by `/overstays` when no `minutes` query is given
    pub overstay_limit: chrono::Duration,
}

/// Transport-independent response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ApiResponse {
    fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, content_type: JSON_CONTENT_TYPE, body },
            Err(e) => Self::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_failed",
                &e.to_string(),
            ),
        }
    }

    fn error(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            content_type: JSON_CONTENT_TYPE,
            body: json!({ "error": code, "message": message }).to_string(),
        }
    }

    fn text(content_type: &'static str, body: String) -> Self {
        Self { status: StatusCode::OK, content_type, body }
    }
}

impl From<&AccessError> for ApiResponse {
    fn from(error: &AccessError) -> Self {
        ApiResponse::error(status_for(error), error.code(), &error.to_string())
    }
}

/// HTTP status for an engine error
pub fn status_for(error: &AccessError) -> StatusCode {
    match error {
        AccessError::SubjectNotFound(_) => StatusCode::NOT_FOUND,
        AccessError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        e if e.is_rejection() => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

#[derive(Debug, Deserialize)]
struct AccessRequest {
    subject_id: SubjectId,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PingRequest {
    subject_id: SubjectId,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    subject_ids: Vec<SubjectId>,
    #[serde(default)]
    method: Option<String>,
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiResponse> {
    serde_json::from_slice(body)
        .map_err(|e| ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string()))
}

/// Access method from the request, `Manual` when absent
fn parse_method(method: Option<&str>) -> Result<AccessMethod, ApiResponse> {
    match method {
        None => Ok(AccessMethod::Manual),
        Some(m) => m
            .parse()
            .map_err(|e: String| ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_request", &e)),
    }
}

/// `minutes` query parameter, if present
fn parse_minutes(query: Option<&str>) -> Result<Option<i64>, ApiResponse> {
    let Some(query) = query else { return Ok(None) };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("minutes=") {
            return match value.parse::<i64>() {
                Ok(minutes) if minutes >= 0 => Ok(Some(minutes)),
                _ => Err(ApiResponse::error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "minutes must be a non-negative integer",
                )),
            };
        }
    }
    Ok(None)
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, AccessError>) -> ApiResponse {
    match result {
        Ok(value) => ApiResponse::json(status, &value),
        Err(e) => ApiResponse::from(&e),
    }
}

/// Route one request to the engine
pub fn dispatch(
    state: &ApiState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    let result = match (method, path) {
        (&Method::POST, "/entries") => post_entry(state, body),
        (&Method::POST, "/exits") => post_exit(state, body),
        (&Method::POST, "/pings") => post_ping(state, body),
        (&Method::POST, "/entries/bulk") => post_bulk(state, body),
        (&Method::GET, "/occupancy") => {
            Ok(respond(StatusCode::OK, state.engine.current_occupancy()))
        }
        (&Method::GET, "/inside") => Ok(respond(StatusCode::OK, state.engine.subjects_inside())),
        (&Method::GET, "/stats/today") => Ok(respond(StatusCode::OK, state.engine.daily_stats())),
        (&Method::GET, "/overstays") => parse_minutes(query).map(|minutes| {
            let limit = minutes.map(chrono::Duration::minutes).unwrap_or(state.overstay_limit);
            respond(StatusCode::OK, state.engine.overstays(limit))
        }),
        (&Method::GET, "/metrics") => {
            let summary = state.engine.metrics().snapshot();
            Ok(ApiResponse::text(
                PROMETHEUS_CONTENT_TYPE,
                format_prometheus_metrics(&summary, &state.site_id),
            ))
        }
        (&Method::GET, "/health") => Ok(ApiResponse::text("text/plain", "ok".to_string())),
        _ => Err(ApiResponse::error(StatusCode::NOT_FOUND, "not_found", path)),
    };
    result.unwrap_or_else(|response| response)
}

fn post_entry(state: &ApiState, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let req: AccessRequest = parse_body(body)?;
    let method = parse_method(req.method.as_deref())?;
    let coordinate =
        Coordinate::from_parts(req.latitude, req.longitude).map_err(|e| ApiResponse::from(&e))?;
    Ok(respond(
        StatusCode::CREATED,
        state.engine.register_entry(&req.subject_id, coordinate, method),
    ))
}

fn post_exit(state: &ApiState, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let req: AccessRequest = parse_body(body)?;
    let method = parse_method(req.method.as_deref())?;
    let coordinate =
        Coordinate::from_parts(req.latitude, req.longitude).map_err(|e| ApiResponse::from(&e))?;
    Ok(respond(StatusCode::OK, state.engine.register_exit(&req.subject_id, coordinate, method)))
}

fn post_ping(state: &ApiState, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let req: PingRequest = parse_body(body)?;
    let coordinate =
        Coordinate::new(req.latitude, req.longitude).map_err(|e| ApiResponse::from(&e))?;
    Ok(respond(StatusCode::OK, state.engine.auto_ping(&req.subject_id, coordinate)))
}

fn post_bulk(state: &ApiState, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let req: BulkRequest = parse_body(body)?;
    let method = parse_method(req.method.as_deref())?;
    let report = state.engine.bulk_register_entry(&req.subject_ids, method);
    Ok(ApiResponse::json(StatusCode::OK, &report))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let response = match req.into_body().collect().await {
        Ok(collected) => {
            dispatch(&state, &method, &path, query.as_deref(), &collected.to_bytes())
        }
        Err(e) => ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string()),
    };
    debug!(method = %method, path = %path, status = %response.status.as_u16(), "http_request");

    Ok(Response::builder()
        .status(response.status)
        .header("Content-Type", response.content_type)
        .body(Full::new(Bytes::from(response.body)))
        .expect("response with static headers should not fail"))
}

/// Start the HTTP API server
pub async fn start_http_server(
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %state.site_id, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::StoreError;
    use crate::domain::types::{CapacityPolicy, Geofence, GeofenceId};
    use crate::infra::clock::{offset_from_minutes, SystemClock};
    use crate::infra::config::OccupancyScope;
    use crate::infra::directory::{Roster, StaticSite};
    use crate::infra::metrics::Metrics;
    use crate::infra::store::MemoryAccessStore;

    fn state(policy: CapacityPolicy) -> ApiState {
        let center = Coordinate::new(10.0, -70.0).unwrap();
        let site = StaticSite::new(
            vec![Geofence::new(GeofenceId(1), "main", center, 100.0).unwrap()],
            policy,
        )
        .unwrap();
        let engine = AccessEngine::new(
            Arc::new(MemoryAccessStore::new()),
            Arc::new(SystemClock),
            Arc::new(site),
            Arc::new(Roster::new(["S-1", "S-2", "S-3"])),
            OccupancyScope::AllTime,
            offset_from_minutes(0),
            Arc::new(Metrics::new()),
        );
        ApiState {
            engine: Arc::new(engine),
            site_id: "campus".to_string(),
            overstay_limit: chrono::Duration::minutes(720),
        }
    }

    fn post(state: &ApiState, path: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = dispatch(state, &Method::POST, path, None, body.as_bytes());
        (response.status, serde_json::from_str(&response.body).unwrap())
    }

    fn get(state: &ApiState, path: &str, query: Option<&str>) -> (StatusCode, serde_json::Value) {
        let response = dispatch(state, &Method::GET, path, query, b"");
        (response.status, serde_json::from_str(&response.body).unwrap())
    }

    #[test]
    fn test_entry_then_exit() {
        let state = state(CapacityPolicy::default());

        let (status, body) = post(&state, "/entries", r#"{"subject_id": "S-1"}"#);
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["subject"], "S-1");
        assert_eq!(body["method"], "manual");
        assert_eq!(body["occupancy"]["count"], 1);

        let (status, body) = post(&state, "/exits", r#"{"subject_id": "S-1"}"#);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["occupancy"]["count"], 0);
    }

    #[test]
    fn test_error_status_mapping() {
        let state = state(CapacityPolicy::new(1, 1, "lleno").unwrap());
        post(&state, "/entries", r#"{"subject_id": "S-1"}"#);

        let (status, body) = post(&state, "/entries", r#"{"subject_id": "S-1"}"#);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_open");

        let (status, body) = post(&state, "/entries", r#"{"subject_id": "S-2"}"#);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "capacity_exceeded");

        let (status, body) = post(&state, "/exits", r#"{"subject_id": "S-3"}"#);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "no_open_record");

        let (status, body) = post(&state, "/entries", r#"{"subject_id": "ghost"}"#);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "subject_not_found");

        let (status, body) =
            post(&state, "/exits", r#"{"subject_id": "S-1", "latitude": 91.0, "longitude": 0.0}"#);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_coordinates");
    }

    #[test]
    fn test_store_failure_maps_to_500() {
        let err = AccessError::Store(StoreError::Unavailable("down".to_string()));
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_malformed_body() {
        let state = state(CapacityPolicy::default());
        let (status, body) = post(&state, "/entries", "{");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _) = post(&state, "/entries", r#"{"subject_id": "S-1", "method": "teleport"}"#);
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_ping_route() {
        let state = state(CapacityPolicy::default());

        let (status, body) =
            post(&state, "/pings", r#"{"subject_id": "S-1", "latitude": 10.0001, "longitude": -70.0}"#);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "ENTRY");
        assert_eq!(body["state"], "INSIDE");

        let (_, body) =
            post(&state, "/pings", r#"{"subject_id": "S-1", "latitude": 10.0001, "longitude": -70.0}"#);
        assert_eq!(body["action"], "NONE");

        let (status, _) =
            post(&state, "/pings", r#"{"subject_id": "S-1", "latitude": 10.0, "longitude": 200.0}"#);
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_bulk_and_queries() {
        let state = state(CapacityPolicy::default());

        let (status, body) = post(
            &state,
            "/entries/bulk",
            r#"{"subject_ids": ["S-1", "S-2", "ghost"], "method": "qr"}"#,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registered_count"], 2);
        assert_eq!(body["errors"][0]["code"], "subject_not_found");

        let (_, body) = get(&state, "/occupancy", None);
        assert_eq!(body["count"], 2);
        assert_eq!(body["level"], "NORMAL");

        let (_, body) = get(&state, "/inside", None);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["method"], "device_scan");

        let (_, body) = get(&state, "/stats/today", None);
        assert_eq!(body["inside_now"], 2);

        let (status, _) = get(&state, "/overstays", Some("minutes=0"));
        assert_eq!(status, StatusCode::OK);
        let (_, body) = get(&state, "/overstays", None);
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = get(&state, "/overstays", Some("minutes=abc"));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_metrics_and_health() {
        let state = state(CapacityPolicy::default());
        post(&state, "/entries", r#"{"subject_id": "S-1"}"#);

        let response = dispatch(&state, &Method::GET, "/metrics", None, b"");
        assert_eq!(response.content_type, PROMETHEUS_CONTENT_TYPE);
        assert!(response.body.contains("access_entries_total{site=\"campus\",method=\"manual\"} 1"));

        let response = dispatch(&state, &Method::GET, "/health", None, b"");
        assert_eq!(response.body, "ok");

        let response = dispatch(&state, &Method::DELETE, "/entries", None, b"");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_metrics_scrape_leaves_report_window() {
        let state = state(CapacityPolicy::default());
        state.engine.metrics().record_ping_processed(250);

        dispatch(&state, &Method::GET, "/metrics", None, b"");
        dispatch(&state, &Method::GET, "/metrics", None, b"");

        let summary = state.engine.metrics().report();
        assert_eq!(summary.max_ping_latency_us, 250);
        assert_eq!(summary.lat_buckets.iter().sum::<u64>(), 1);
    }
}
