use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use segmentation_core::{report_rows, AuditEntry, Period, SegmentError, Slug, UserId};
use segmentation_store_sqlite::SegmentStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct ServiceState {
    store: SegmentStore,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct SuccessResponse {
    success: String,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct SegmentsResponse {
    segments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentRequest {
    slug: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateRequest {
    #[serde(default, rename = "segments-to-add")]
    segments_to_add: Vec<String>,
    #[serde(default, rename = "segments-to-remove")]
    segments_to_remove: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Copy)]
enum FailureKind {
    Validation,
    Domain,
    Storage,
    Timeout,
}

#[derive(Debug, Default)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    validation_error_total: AtomicU64,
    domain_error_total: AtomicU64,
    storage_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    validation_error_total: u64,
    domain_error_total: u64,
    storage_error_total: u64,
}

impl ServiceTelemetry {
    fn record_failure(&self, kind: FailureKind) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        match kind {
            FailureKind::Validation => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            FailureKind::Domain => {
                self.domain_error_total.fetch_add(1, Ordering::Relaxed);
            }
            FailureKind::Storage => {
                self.storage_error_total.fetch_add(1, Ordering::Relaxed);
            }
            FailureKind::Timeout => {
                self.timeout_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            domain_error_total: self.domain_error_total.load(Ordering::Relaxed),
            storage_error_total: self.storage_error_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "segmentation-service")]
#[command(about = "HTTP service for user segment membership")]
struct Args {
    #[arg(long, default_value = "./segmentation.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 10_000)]
    operation_timeout_ms: u64,
}

impl ServiceState {
    fn reject(&self, kind: FailureKind, status: StatusCode, message: String) -> ServiceFailure {
        self.telemetry.record_failure(kind);
        warn!("request failed: {message}");
        ServiceFailure { status, message }
    }

    fn invalid_body(&self, _rejection: &JsonRejection) -> ServiceFailure {
        self.reject(
            FailureKind::Validation,
            StatusCode::BAD_REQUEST,
            SegmentError::MissingParameters.to_string(),
        )
    }

    fn validation_failure(&self, err: &SegmentError) -> ServiceFailure {
        self.reject(
            FailureKind::Validation,
            StatusCode::BAD_REQUEST,
            err.to_string(),
        )
    }

    fn internal(&self, message: String) -> ServiceFailure {
        self.reject(
            FailureKind::Storage,
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
        )
    }

    fn classify_storage(&self, err: &anyhow::Error) -> ServiceFailure {
        match err.downcast_ref::<SegmentError>() {
            Some(domain @ SegmentError::SegmentNotFound) => self.reject(
                FailureKind::Domain,
                StatusCode::NOT_FOUND,
                domain.to_string(),
            ),
            Some(domain @ SegmentError::SegmentAlreadyExists) => self.reject(
                FailureKind::Domain,
                StatusCode::BAD_REQUEST,
                domain.to_string(),
            ),
            Some(validation) => self.reject(
                FailureKind::Validation,
                StatusCode::BAD_REQUEST,
                validation.to_string(),
            ),
            None => self.reject(
                FailureKind::Storage,
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            ),
        }
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(SegmentStore) -> Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let handle = tokio::task::spawn_blocking(move || op(store));

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.reject(
                    FailureKind::Timeout,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.reject(
                FailureKind::Storage,
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => Err(self.classify_storage(&err)),
        }
    }
}

fn parse_slug_list(state: &ServiceState, raw: &[String]) -> Result<Vec<Slug>, ServiceFailure> {
    let mut slugs = Vec::with_capacity(raw.len());
    for value in raw {
        slugs.push(Slug::parse(value).map_err(|err| state.validation_failure(&err))?);
    }
    Ok(slugs)
}

fn app(state: ServiceState) -> Router {
    let api = Router::new()
        .route("/createSegment", post(create_segment))
        .route("/deleteSegment", delete(delete_segment))
        .route("/updateUserSegments/:user_id", post(update_segments))
        .route("/getUserSegments/:user_id", get(get_segments))
        .route("/getReport/:period", get(report))
        .route("/getUserReport/:period/:user_id", get(user_report));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let store = SegmentStore::new(&args.db);
    store.migrate()?;
    info!(db = %args.db.display(), "database ready");

    let state = ServiceState {
        store,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(addr = %args.bind, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to install shutdown handler: {err}");
    }
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn create_segment(
    State(state): State<ServiceState>,
    payload: Result<Json<SegmentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection))?;
    let slug = Slug::parse(&request.slug).map_err(|err| state.validation_failure(&err))?;

    let created = slug.clone();
    state
        .run_blocking("create_segment", move |store| {
            store.create_segment(&slug).map(|_| ())
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse {
            success: format!("segment with slug '{created}' created"),
        }),
    ))
}

async fn delete_segment(
    State(state): State<ServiceState>,
    payload: Result<Json<SegmentRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection))?;
    let slug = Slug::parse(&request.slug).map_err(|err| state.validation_failure(&err))?;

    let deleted = slug.clone();
    state
        .run_blocking("delete_segment", move |store| store.delete_segment(&slug))
        .await?;

    Ok(Json(SuccessResponse {
        success: format!("segment with slug '{deleted}' deleted"),
    }))
}

async fn update_segments(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    payload: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ServiceFailure> {
    let user = UserId::parse(&user_id).map_err(|err| state.validation_failure(&err))?;
    let Json(request) = payload.map_err(|rejection| state.invalid_body(&rejection))?;
    let to_add = parse_slug_list(&state, &request.segments_to_add)?;
    let to_remove = parse_slug_list(&state, &request.segments_to_remove)?;

    state
        .run_blocking("update_user_segments", move |store| {
            store.update_user_segments(user, &to_add, &to_remove)
        })
        .await?;

    Ok(Json(SuccessResponse {
        success: format!("segment information for user with userID = {user} updated"),
    }))
}

async fn get_segments(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<SegmentsResponse>, ServiceFailure> {
    let user = UserId::parse(&user_id).map_err(|err| state.validation_failure(&err))?;

    let slugs = state
        .run_blocking("get_user_segments", move |store| store.user_segments(user))
        .await?;

    Ok(Json(SegmentsResponse {
        segments: slugs.iter().map(ToString::to_string).collect(),
    }))
}

async fn report(
    State(state): State<ServiceState>,
    Path(period): Path<String>,
) -> Result<Response, ServiceFailure> {
    let period = Period::parse(&period).map_err(|err| state.validation_failure(&err))?;

    let entries = state
        .run_blocking("get_report", move |store| store.audit_entries(period, None))
        .await?;

    csv_response(&state, &entries, "data.csv")
}

async fn user_report(
    State(state): State<ServiceState>,
    Path((period, user_id)): Path<(String, String)>,
) -> Result<Response, ServiceFailure> {
    let period = Period::parse(&period).map_err(|err| state.validation_failure(&err))?;
    let user = UserId::parse(&user_id).map_err(|err| state.validation_failure(&err))?;

    let entries = state
        .run_blocking("get_user_report", move |store| {
            store.audit_entries(period, Some(user))
        })
        .await?;

    csv_response(&state, &entries, "userdata.csv")
}

fn csv_response(
    state: &ServiceState,
    entries: &[AuditEntry],
    filename: &str,
) -> Result<Response, ServiceFailure> {
    let rows = report_rows(entries)
        .map_err(|err| state.internal(format!("failed to render report rows: {err}")))?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in &rows {
        writer
            .write_record([&row.user_id, &row.slug, &row.action, &row.timestamp])
            .map_err(|err| state.internal(format!("failed to write report row: {err}")))?;
    }
    let body = writer
        .into_inner()
        .map_err(|err| state.internal(format!("failed to finish report: {err}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment;filename={filename}"),
            ),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use segmentation_core::now_utc;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("segmentation-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state() -> ServiceState {
        let store = SegmentStore::new(unique_temp_db_path());
        if let Err(err) = store.migrate() {
            panic!("failed to migrate test database: {err:#}");
        }
        ServiceState {
            store,
            operation_timeout: Duration::from_millis(2500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn current_period() -> String {
        let now = now_utc();
        format!("{:04}-{:02}", now.year(), u8::from(now.month()))
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let mut builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                builder.body(Body::from(value.to_string()))
            }
            None => builder.body(Body::empty()),
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    const USER: &str = "6c8f83f6-32a8-4b1f-9a5e-2f0cf3a9d2a1";

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state());

        let response = send(&router, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["status"], serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn create_segment_returns_created() {
        let router = app(test_state());

        let response = send(
            &router,
            "POST",
            "/api/v1/createSegment",
            Some(serde_json::json!({"slug": "TEST1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let value = response_json(response).await;
        assert_eq!(
            value["success"],
            serde_json::json!("segment with slug 'TEST1' created")
        );
    }

    #[tokio::test]
    async fn duplicate_segment_returns_bad_request() {
        let router = app(test_state());
        let body = serde_json::json!({"slug": "TEST1"});

        let _ = send(&router, "POST", "/api/v1/createSegment", Some(body.clone())).await;
        let response = send(&router, "POST", "/api/v1/createSegment", Some(body)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(
            value["error"],
            serde_json::json!("segment with this slug already exists")
        );
    }

    #[tokio::test]
    async fn malformed_slug_is_rejected_before_storage() {
        let router = app(test_state());

        let response = send(
            &router,
            "POST",
            "/api/v1/createSegment",
            Some(serde_json::json!({"slug": "# %TEST"})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(
            value["error"],
            serde_json::json!("invalid format of parameter 'slug'")
        );
    }

    #[tokio::test]
    async fn missing_body_is_rejected() {
        let router = app(test_state());

        let response = send(&router, "POST", "/api/v1/createSegment", None).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(
            value["error"],
            serde_json::json!("missing required parameters")
        );
    }

    #[tokio::test]
    async fn deleting_unknown_segment_returns_not_found() {
        let router = app(test_state());

        let response = send(
            &router,
            "DELETE",
            "/api/v1/deleteSegment",
            Some(serde_json::json!({"slug": "GHOST"})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(value["error"], serde_json::json!("segment not found"));
    }

    #[tokio::test]
    async fn update_and_list_flow() {
        let router = app(test_state());
        for slug in ["TEST1", "TEST2"] {
            let response = send(
                &router,
                "POST",
                "/api/v1/createSegment",
                Some(serde_json::json!({"slug": slug})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = send(
            &router,
            "POST",
            &format!("/api/v1/updateUserSegments/{USER}"),
            Some(serde_json::json!({
                "segments-to-add": ["TEST1", "TEST2"],
                "segments-to-remove": []
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &router,
            "GET",
            &format!("/api/v1/getUserSegments/{USER}"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["segments"], serde_json::json!(["TEST1", "TEST2"]));
    }

    #[tokio::test]
    async fn update_with_unknown_segment_is_atomic() {
        let router = app(test_state());
        let response = send(
            &router,
            "POST",
            "/api/v1/createSegment",
            Some(serde_json::json!({"slug": "TEST1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(
            &router,
            "POST",
            &format!("/api/v1/updateUserSegments/{USER}"),
            Some(serde_json::json!({
                "segments-to-add": ["TEST1"],
                "segments-to-remove": ["GHOST"]
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &router,
            "GET",
            &format!("/api/v1/getUserSegments/{USER}"),
            None,
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(value["segments"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn malformed_user_id_is_rejected() {
        let router = app(test_state());

        let response = send(
            &router,
            "GET",
            "/api/v1/getUserSegments/not-a-uuid",
            None,
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(
            value["error"],
            serde_json::json!("invalid format of parameter 'userID'")
        );
    }

    #[tokio::test]
    async fn malformed_period_is_rejected() {
        let router = app(test_state());

        let response = send(&router, "GET", "/api/v1/getReport/2023-8", None).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(
            value["error"],
            serde_json::json!("invalid format of parameter 'period'")
        );
    }

    #[tokio::test]
    async fn report_streams_csv_rows() {
        let router = app(test_state());
        for slug in ["TEST1", "TEST2"] {
            let _ = send(
                &router,
                "POST",
                "/api/v1/createSegment",
                Some(serde_json::json!({"slug": slug})),
            )
            .await;
        }
        let _ = send(
            &router,
            "POST",
            &format!("/api/v1/updateUserSegments/{USER}"),
            Some(serde_json::json!({
                "segments-to-add": ["TEST1", "TEST2"],
                "segments-to-remove": []
            })),
        )
        .await;
        let _ = send(
            &router,
            "POST",
            &format!("/api/v1/updateUserSegments/{USER}"),
            Some(serde_json::json!({
                "segments-to-add": [],
                "segments-to-remove": ["TEST1", "TEST2"]
            })),
        )
        .await;

        let response = send(
            &router,
            "GET",
            &format!("/api/v1/getReport/{}", current_period()),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/csv")
        );
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .and_then(|value| value.to_str().ok()),
            Some("attachment;filename=data.csv")
        );

        let body = response_text(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines.iter().filter(|line| line.contains(",add,")).count(), 2);
        assert_eq!(
            lines.iter().filter(|line| line.contains(",remove,")).count(),
            2
        );
        assert!(lines.iter().all(|line| line.starts_with(USER)));
    }

    #[tokio::test]
    async fn user_report_filters_to_one_user() {
        let router = app(test_state());
        let other = uuid::Uuid::new_v4();
        let _ = send(
            &router,
            "POST",
            "/api/v1/createSegment",
            Some(serde_json::json!({"slug": "TEST1"})),
        )
        .await;
        for user in [USER.to_string(), other.to_string()] {
            let _ = send(
                &router,
                "POST",
                &format!("/api/v1/updateUserSegments/{user}"),
                Some(serde_json::json!({
                    "segments-to-add": ["TEST1"],
                    "segments-to-remove": []
                })),
            )
            .await;
        }

        let response = send(
            &router,
            "GET",
            &format!("/api/v1/getUserReport/{}/{USER}", current_period()),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .and_then(|value| value.to_str().ok()),
            Some("attachment;filename=userdata.csv")
        );

        let body = response_text(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(USER));
    }
}
