//! Read-only admin and monitoring endpoints.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), a broker PING on the shared connection
//!   and on every registered queue's connection
//! - Prometheus metrics (`/metrics`)
//! - Queue inspection under `/admin/queues`, behind HTTP Basic auth

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::config::AdminSettings;
use crate::connection::Connection;
use crate::error::QueueError;
use crate::job::JobRecord;
use crate::metrics;
use crate::registry::{QueueInspector, QueueRegistry};
use crate::state::JobState;

/// Realm sent in `WWW-Authenticate` challenges.
pub const AUTH_REALM: &str = "Job Queues";

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Shared state for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<QueueRegistry>,
    /// Shared connection used for readiness checks
    pub producer: Connection,
    pub settings: Arc<AdminSettings>,
    pub app_name: String,
    pub app_version: String,
}

impl AdminState {
    pub fn new(
        registry: QueueRegistry,
        producer: Connection,
        settings: AdminSettings,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            producer,
            settings: Arc::new(settings),
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    let admin = Router::new()
        .route("/admin/queues", get(list_queues_handler))
        .route("/admin/queues/{queue}", get(queue_handler))
        .route("/admin/queues/{queue}/jobs", get(list_jobs_handler))
        .route("/admin/queues/{queue}/jobs/{id}", get(job_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            basic_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rejects `/admin` requests without the configured Basic credentials.
///
/// With no credentials configured every request is rejected.
pub async fn basic_auth_middleware(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.credentials.as_ref() else {
        debug!("Admin credentials not configured, rejecting request");
        return unauthorized();
    };

    let Some(Authorization(basic)) = request.headers().typed_get::<Authorization<Basic>>() else {
        debug!("Missing or malformed Basic credentials");
        return unauthorized();
    };

    if !credentials_match(
        (basic.username(), basic.password()),
        (&expected.username, &expected.password),
    ) {
        debug!(username = %basic.username(), "Invalid admin credentials");
        return unauthorized();
    }

    next.run(request).await
}

/// Both parts are always compared, each in constant time.
fn credentials_match(given: (&str, &str), expected: (&str, &str)) -> bool {
    let user = given.0.as_bytes().ct_eq(expected.0.as_bytes());
    let password = given.1.as_bytes().ct_eq(expected.1.as_bytes());
    (user & password).into()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{AUTH_REALM}\""),
        )],
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

fn broker_failure(e: QueueError) -> (StatusCode, Json<Value>) {
    error!(error = %e, "Admin request failed");
    let status = if e.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn queue_not_found(name: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "queue not found", "queue": name })),
    )
}

fn find_queue<'a>(
    state: &'a AdminState,
    name: &str,
) -> Result<&'a Arc<dyn QueueInspector>, (StatusCode, Json<Value>)> {
    state.registry.get(name).ok_or_else(|| queue_not_found(name))
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Always OK while the process is serving.
pub async fn health_handler(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// OK when the shared connection and every registered queue answer PING.
pub async fn ready_handler(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let mut ready = true;
    let broker = match state.producer.broker().ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            ready = false;
            format!("error: {e}")
        }
    };

    let mut queues = serde_json::Map::new();
    for queue in state.registry.iter() {
        let check = match queue.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                ready = false;
                format!("error: {e}")
            }
        };
        queues.insert(queue.name().to_string(), Value::String(check));
    }

    let checks = json!({ "broker": broker, "queues": queues });
    if ready {
        Ok((
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": checks })),
        ))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "checks": checks })),
        ))
    }
}

/// Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(rendered) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            rendered,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

/// `GET /admin/queues`
pub async fn list_queues_handler(
    State(state): State<AdminState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut queues = Vec::with_capacity(state.registry.len());
    for queue in state.registry.iter() {
        let counts = queue.counts().await.map_err(broker_failure)?;
        queues.push(json!({ "name": queue.name(), "counts": counts }));
    }
    Ok(Json(json!({ "queues": queues })))
}

/// `GET /admin/queues/{queue}`
pub async fn queue_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let queue = find_queue(&state, &name)?;
    let counts = queue.counts().await.map_err(broker_failure)?;
    Ok(Json(json!({
        "name": queue.name(),
        "counts": counts,
        "total": counts.total(),
    })))
}

/// Query parameters for the job list. `end` is inclusive.
#[derive(Debug, Deserialize)]
pub struct JobListParams {
    /// Defaults to `waiting`
    pub state: Option<String>,
    #[serde(default)]
    pub start: usize,
    pub end: Option<usize>,
}

/// `GET /admin/queues/{queue}/jobs?state=failed&start=0&end=19`
///
/// At most 100 jobs per page.
pub async fn list_jobs_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(params): Query<JobListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let queue = find_queue(&state, &name)?;

    let job_state = match params.state.as_deref() {
        None => JobState::Waiting,
        Some(raw) => JobState::from_str(raw).map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("unknown state '{raw}'"),
                    "states": JobState::all().map(|s| s.to_string()).collect::<Vec<_>>(),
                })),
            )
        })?,
    };

    let start = params.start;
    let end = params
        .end
        .unwrap_or(start.saturating_add(DEFAULT_PAGE_SIZE - 1))
        .min(start.saturating_add(MAX_PAGE_SIZE - 1));

    let jobs = queue
        .jobs(job_state, start, end)
        .await
        .map_err(broker_failure)?;

    Ok(Json(json!({
        "queue": queue.name(),
        "state": job_state,
        "start": start,
        "end": end,
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

/// `GET /admin/queues/{queue}/jobs/{id}`
pub async fn job_handler(
    State(state): State<AdminState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<JobRecord>, (StatusCode, Json<Value>)> {
    let queue = find_queue(&state, &name)?;
    match queue.job(&id).await.map_err(broker_failure)? {
        Some(job) => Ok(Json(job)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job not found", "queue": name, "id": id })),
        )),
    }
}
