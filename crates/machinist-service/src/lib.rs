//! HTTP adapter for Machinist.
//!
//! Requests are deserialized and validated here, then handed to
//! [`MachineService`] on a blocking thread with its own `SQLite` connection.
//! Every failure is rendered as `{ status, timestamp, message }`.
//!
//! Reads are abandoned once the operation timeout elapses. Writes are always
//! awaited to completion; their connection gives up on a held lock after the
//! same timeout, so a 503 from a write means nothing was stored.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use machinist_core::{now_utc, CreateMachineRequest, MachineDto, MachineError, MachineService};
use machinist_store_sqlite::{is_busy, SqliteMachineStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

pub const MACHINE_PATH: &str = "/machine";

const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    db: PathBuf,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ServiceFailure {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    internal_error_total: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ErrorResponse {
            status: self.status.as_u16(),
            timestamp: now_utc(),
            message: self.message,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceFailure {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    fn from_machine_error(err: &MachineError) -> Self {
        match err {
            MachineError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "machine_not_found", err.to_string())
            }
            MachineError::Validation(message) => {
                Self::new(StatusCode::BAD_REQUEST, "validation_error", message.clone())
            }
            MachineError::Store(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                INTERNAL_ERROR_MESSAGE,
            ),
        }
    }
}

impl ServiceState {
    #[must_use]
    pub fn new(db: PathBuf, operation_timeout: Duration) -> Self {
        Self { db, operation_timeout, telemetry: Arc::new(ServiceTelemetry::default()) }
    }

    /// Opens the configured database and applies the schema.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn migrate(&self) -> anyhow::Result<()> {
        SqliteMachineStore::open(&self.db)?.migrate()
    }

    /// Counts and logs a failure raised before the store was reached.
    fn reject(&self, failure: ServiceFailure) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.record(&failure, false);
        failure
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.reject(ServiceFailure::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            rejection.body_text(),
        ))
    }

    fn invalid_input(&self, err: &MachineError) -> ServiceFailure {
        self.reject(ServiceFailure::from_machine_error(err))
    }

    fn record(&self, failure: &ServiceFailure, timeout: bool) {
        self.telemetry.record_failure(failure.code, timeout);
        if failure.status.is_server_error() {
            error!(code = failure.code, status = failure.status.as_u16(), "{}", failure.message);
        } else {
            warn!(code = failure.code, status = failure.status.as_u16(), "{}", failure.message);
        }
    }

    fn timed_out(&self, operation_label: &str) -> ServiceFailure {
        ServiceFailure::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "timeout",
            format!("{operation_label} timed out after {} ms", self.operation_timeout.as_millis()),
        )
    }

    fn operation_failure(&self, operation_label: &str, err: &MachineError) -> ServiceFailure {
        match err {
            MachineError::Store(source) if is_busy(&**source) => self.timed_out(operation_label),
            MachineError::Store(source) => {
                error!(
                    operation = operation_label,
                    error = %error_chain(&**source),
                    "store failure"
                );
                ServiceFailure::from_machine_error(err)
            }
            MachineError::NotFound(_) | MachineError::Validation(_) => {
                ServiceFailure::from_machine_error(err)
            }
        }
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        access: Access,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut MachineService<SqliteMachineStore>) -> Result<T, MachineError>
            + Send
            + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db = self.db.clone();
        let busy_timeout = self.operation_timeout;
        let handle = tokio::task::spawn_blocking(move || {
            let store = SqliteMachineStore::open_with_busy_timeout(&db, busy_timeout)?;
            let mut service = MachineService::new(store);
            op(&mut service)
        });

        let join_result = match access {
            Access::Read => tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                let failure = self.timed_out(operation_label);
                self.record(&failure, true);
                failure
            })?,
            Access::Write => handle.await,
        };

        let op_result = join_result.map_err(|err| {
            error!(operation = operation_label, error = %err, "blocking task failed");
            let failure = ServiceFailure::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                INTERNAL_ERROR_MESSAGE,
            );
            self.record(&failure, false);
            failure
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = self.operation_failure(operation_label, &err);
                self.record(&failure, failure.code == "timeout");
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "machine_not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |err| err.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

fn machine_location(id: &str) -> String {
    format!("{MACHINE_PATH}/{id}")
}

pub fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/machine/all", get(list_machines))
        .route("/machine", post(create_machine).put(update_machine))
        .route("/machine/", post(create_machine).put(update_machine))
        .route("/machine/:id", get(get_machine).delete(delete_machine))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse { status: "ok", timeout_ms, telemetry: state.telemetry.snapshot() })
}

async fn list_machines(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<MachineDto>>, ServiceFailure> {
    let machines =
        state.run_blocking("get_all", Access::Read, |service| service.get_all()).await?;
    Ok(Json(machines))
}

async fn get_machine(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<MachineDto>, ServiceFailure> {
    let machine = state
        .run_blocking("get_by_id", Access::Read, move |service| service.get_by_id(&id))
        .await?;
    Ok(Json(machine))
}

async fn create_machine(
    State(state): State<ServiceState>,
    payload: Result<Json<CreateMachineRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    request.validate_for_create().map_err(|err| state.invalid_input(&err))?;

    let created = state
        .run_blocking("create", Access::Write, move |service| service.create(request))
        .await?;
    let location = machine_location(created.id.as_deref().unwrap_or_default());
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]))
}

async fn update_machine(
    State(state): State<ServiceState>,
    payload: Result<Json<MachineDto>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceFailure> {
    let Json(dto) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    dto.validate_for_update().map_err(|err| state.invalid_input(&err))?;

    let location = machine_location(dto.id.as_deref().unwrap_or_default());
    state.run_blocking("update", Access::Write, move |service| service.update(dto)).await?;
    Ok((StatusCode::OK, [(header::LOCATION, location)]))
}

async fn delete_machine(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServiceFailure> {
    state
        .run_blocking("delete_by_id", Access::Write, move |service| service.delete_by_id(&id))
        .await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use machinist_core::MachineStore;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("machinist-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn remove_db_files(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = db_path.as_os_str().to_owned();
            path.push(suffix);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => panic!("failed to remove {}: {err}", PathBuf::from(path).display()),
            }
        }
    }

    fn test_state(db: PathBuf, timeout_ms: u64) -> ServiceState {
        let state = ServiceState::new(db, Duration::from_millis(timeout_ms));
        if let Err(err) = state.migrate() {
            panic!("failed to migrate test database: {err:#}");
        }
        state
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let mut builder = Request::builder().uri(uri).method(method);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!(
                "response body is not JSON: {err}; body={}",
                String::from_utf8_lossy(&bytes)
            ),
        }
    }

    async fn error_body(response: Response) -> ErrorResponse {
        let value = response_json(response).await;
        match serde_json::from_value(value) {
            Ok(body) => body,
            Err(err) => panic!("error body has unexpected shape: {err}"),
        }
    }

    fn location(response: &Response) -> String {
        match response.headers().get(header::LOCATION).map(|value| value.to_str()) {
            Some(Ok(value)) => value.to_string(),
            other => panic!("missing or invalid Location header: {other:?}"),
        }
    }

    async fn create(router: &Router, name: &str) -> String {
        let response = send(
            router,
            "POST",
            "/machine/",
            Some(serde_json::json!({
                "name": name,
                "description": "test description",
                "yearOfProduction": 2012
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = location(&response);
        match location.strip_prefix("/machine/") {
            Some(id) => id.to_string(),
            None => panic!("unexpected Location header: {location}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = send(&router, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["timeoutMs"], 2500);
        assert_eq!(value["telemetry"]["requestsTotal"], 0);

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn create_returns_location_and_machine_is_readable() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let id = create(&router, "test machine").await;

        let response = send(&router, "GET", &format!("/machine/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["id"], id.as_str());
        assert_eq!(value["name"], "test machine");
        assert_eq!(value["description"], "test description");
        assert_eq!(value["yearOfProduction"], 2012);
        assert!(value["createdAt"].is_string());
        assert_eq!(value["createdAt"], value["updatedAt"]);
        assert!(value.get("deleted").is_none());

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn create_without_trailing_slash_is_accepted() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = send(
            &router,
            "POST",
            "/machine",
            Some(serde_json::json!({ "name": "slashless machine" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(location(&response).starts_with("/machine/"));

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn unknown_machine_is_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = send(&router, "GET", "/machine/nonexistent", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = error_body(response).await;
        assert_eq!(body.status, 404);
        assert_eq!(body.message, "Machine with id [nonexistent] does not exist!");

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn out_of_range_year_is_rejected() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = send(
            &router,
            "POST",
            "/machine/",
            Some(serde_json::json!({
                "name": "test machine",
                "description": "test description",
                "yearOfProduction": 3003
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = error_body(response).await;
        assert_eq!(body.status, 400);
        assert!(body.message.contains("must be less than or equal to 2020"), "{}", body.message);

        let listed = response_json(send(&router, "GET", "/machine/all", None).await).await;
        assert_eq!(listed, serde_json::json!([]));

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn missing_name_is_rejected() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response =
            send(&router, "POST", "/machine/", Some(serde_json::json!({ "description": "nameless" })))
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_body(response).await.message, "name: must not be null");

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let request = Request::builder()
            .uri("/machine/")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{\"name\": "))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_body(response).await.status, 400);

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn list_returns_most_recently_touched_first() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let first = create(&router, "testMachine1").await;
        let second = create(&router, "testMachine2").await;

        let listed = response_json(send(&router, "GET", "/machine/all", None).await).await;
        let ids: Vec<&str> = match listed.as_array() {
            Some(items) => items.iter().filter_map(|item| item["id"].as_str()).collect(),
            None => panic!("expected array, got {listed}"),
        };
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);

        let response = send(
            &router,
            "PUT",
            "/machine/",
            Some(serde_json::json!({ "id": first, "name": "testMachine1 renamed" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let listed = response_json(send(&router, "GET", "/machine/all", None).await).await;
        assert_eq!(listed[0]["id"], first.as_str());
        assert_eq!(listed[1]["id"], second.as_str());

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn update_overwrites_fields_and_returns_location() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));
        let id = create(&router, "test machine").await;
        let before = response_json(send(&router, "GET", &format!("/machine/{id}"), None).await).await;

        let response = send(
            &router,
            "PUT",
            "/machine/",
            Some(serde_json::json!({
                "id": id,
                "name": "test machine with new name",
                "description": null,
                "yearOfProduction": 2010,
                "createdAt": "1999-01-01T00:00:00Z"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(location(&response), format!("/machine/{id}"));

        let after = response_json(send(&router, "GET", &format!("/machine/{id}"), None).await).await;
        assert_eq!(after["name"], "test machine with new name");
        assert_eq!(after["description"], serde_json::Value::Null);
        assert_eq!(after["yearOfProduction"], 2010);
        assert_eq!(after["createdAt"], before["createdAt"]);
        assert_ne!(after["updatedAt"], before["updatedAt"]);

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn update_of_unknown_machine_is_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = send(
            &router,
            "PUT",
            "/machine/",
            Some(serde_json::json!({ "id": "testId", "name": "test machine" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_body(response).await.message, "Machine with id [testId] does not exist!");

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn update_without_id_is_rejected() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response =
            send(&router, "PUT", "/machine/", Some(serde_json::json!({ "name": "test machine" })))
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_body(response).await.message, "id: must not be null");

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn delete_hides_machine_but_keeps_row() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));
        let id = create(&router, "test machine").await;

        let response = send(&router, "DELETE", &format!("/machine/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, "GET", &format!("/machine/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&router, "DELETE", &format!("/machine/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let store = match SqliteMachineStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to reopen store: {err:#}"),
        };
        match store.find_by_id(&id) {
            Ok(Some(machine)) => assert!(machine.deleted),
            other => panic!("expected soft-deleted row, got {other:?}"),
        }
        drop(store);

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn slow_read_times_out_with_service_unavailable() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), 1);

        let result = state
            .run_blocking("unit_timeout_operation", Access::Read, |_service| {
                std::thread::sleep(Duration::from_millis(25));
                Ok(())
            })
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(err.code, "timeout");
                assert!(err.message.contains("timed out"), "{}", err.message);
            }
        }

        // the abandoned task still holds a connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn slow_write_is_awaited_past_the_timeout() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), 1);

        let result = state
            .run_blocking("unit_slow_write", Access::Write, |service| {
                std::thread::sleep(Duration::from_millis(25));
                service.create(CreateMachineRequest {
                    name: Some("patient machine".to_string()),
                    ..CreateMachineRequest::default()
                })
            })
            .await;

        match result {
            Ok(created) => assert_eq!(created.name.as_deref(), Some("patient machine")),
            Err(err) => panic!("slow write must report its real outcome, got {err:?}"),
        }

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn locked_database_create_is_unavailable_and_stores_nothing() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 100));

        let holder = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open lock holder: {err}"),
        };
        if let Err(err) = holder.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to take write lock: {err}");
        }

        let response =
            send(&router, "POST", "/machine/", Some(serde_json::json!({ "name": "test machine" })))
                .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = error_body(response).await;
        assert_eq!(body.status, 503);
        assert!(body.message.contains("timed out"), "{}", body.message);

        if let Err(err) = holder.execute_batch("ROLLBACK;") {
            panic!("failed to release write lock: {err}");
        }
        drop(holder);

        let listed = response_json(send(&router, "GET", "/machine/all", None).await).await;
        assert_eq!(listed, serde_json::json!([]));

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn locked_database_delete_is_unavailable_and_keeps_machine() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 100));
        let id = create(&router, "test machine").await;

        let holder = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open lock holder: {err}"),
        };
        if let Err(err) = holder.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to take write lock: {err}");
        }

        let response = send(&router, "DELETE", &format!("/machine/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        if let Err(err) = holder.execute_batch("ROLLBACK;") {
            panic!("failed to release write lock: {err}");
        }
        drop(holder);

        let response = send(&router, "GET", &format!("/machine/{id}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        remove_db_files(&db_path);
    }

    #[tokio::test]
    async fn unreachable_database_is_an_internal_error() {
        let db_path = std::env::temp_dir()
            .join(format!("machinist-missing-parent-{}/db.sqlite3", ulid::Ulid::new()));
        let router = app(ServiceState::new(db_path, Duration::from_millis(2500)));

        let response = send(&router, "GET", "/machine/all", None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = error_body(response).await;
        assert_eq!(body.status, 500);
        assert_eq!(body.message, "internal server error");
        assert!(!body.message.contains("machinist-missing-parent"));
    }

    #[tokio::test]
    async fn telemetry_counters_track_outcomes() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), 2500);
        let router = app(state.clone());

        create(&router, "test machine").await;
        send(&router, "GET", "/machine/nonexistent", None).await;
        send(&router, "POST", "/machine/", Some(serde_json::json!({ "name": "abc" }))).await;

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 2);
        assert_eq!(snapshot.not_found_total, 1);
        assert_eq!(snapshot.validation_error_total, 1);

        remove_db_files(&db_path);
    }
}
