//! Axum JSON surface: read the queue, trigger a rebuild or a lease release.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use palq_core::Table;
use palq_sync::{Operation, QueueEngine, RunOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "palq-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueueEngine>,
}

impl AppState {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueQuery {
    pub limit: Option<usize>,
    /// `true` keeps only claimed rows, `false` only unclaimed ones.
    pub claimed: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub total: usize,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Completed,
    Busy,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResponse {
    pub operation: Operation,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/queue", get(queue_handler))
        .route("/reconcile", post(reconcile_handler))
        .route("/release", post(release_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<QueueEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving queue API");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn queue_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Response {
    match state.engine.read_queue().await {
        Ok(table) => {
            let claimed_col = state.engine.config().output_columns.claimed.clone();
            Json(queue_view(table.unwrap_or_default(), &claimed_col, &query)).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

fn queue_view(table: Table, claimed_col: &str, query: &QueueQuery) -> QueueView {
    let claimed_idx = table.column(claimed_col);
    let rows = (0..table.rows.len())
        .filter(|&row| match (query.claimed, claimed_idx) {
            (Some(wanted), Some(col)) => table.cell(row, col).as_bool() == wanted,
            _ => true,
        })
        .map(|row| {
            table
                .header
                .iter()
                .enumerate()
                .map(|(col, name)| {
                    let value = serde_json::to_value(table.cell(row, col)).unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect::<Map<_, _>>()
        })
        .collect::<Vec<_>>();
    let total = rows.len();
    let rows = rows
        .into_iter()
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    QueueView { total, rows }
}

async fn reconcile_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state
        .engine
        .reconcile()
        .await
        .map(|o| match o {
            RunOutcome::Completed(summary) => RunOutcome::Completed(summary.tasks_written),
            RunOutcome::Busy => RunOutcome::Busy,
        });
    operation_response(Operation::Reconcile, outcome)
}

async fn release_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state
        .engine
        .release_stale_leases()
        .await
        .map(|o| match o {
            RunOutcome::Completed(summary) => RunOutcome::Completed(summary.released),
            RunOutcome::Busy => RunOutcome::Busy,
        });
    operation_response(Operation::ReleaseLeases, outcome)
}

fn operation_response(
    operation: Operation,
    outcome: anyhow::Result<RunOutcome<usize>>,
) -> Response {
    let (code, status, count, error) = match outcome {
        Ok(RunOutcome::Completed(count)) => {
            (StatusCode::OK, OperationStatus::Completed, Some(count), None)
        }
        Ok(RunOutcome::Busy) => (StatusCode::CONFLICT, OperationStatus::Busy, None, None),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            OperationStatus::Failed,
            None,
            Some(format!("{err:#}")),
        ),
    };
    (
        code,
        Json(OperationResponse {
            operation,
            status,
            count,
            error,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use palq_core::{Cell, ReconcileConfig};
    use palq_storage::{DocumentLock, MemoryLock, MemoryStore};
    use tower::ServiceExt;

    fn source() -> Table {
        Table::new(
            vec!["ID".into(), "LOCATION".into(), "DUE_DATETIME".into()],
            vec![
                vec![
                    Cell::text("A1"),
                    Cell::text("LINE-1"),
                    Cell::DateTime(Utc::now() + chrono::Duration::hours(2)),
                ],
                vec![Cell::text("A2"), Cell::text("LINE-2"), Cell::Empty],
            ],
        )
    }

    fn test_app(lock: MemoryLock) -> Router {
        let store = MemoryStore::from_tables([("source_export", source())]);
        let config = ReconcileConfig {
            lock_wait_secs: 0,
            ..ReconcileConfig::default()
        };
        let engine = QueueEngine::new(Arc::new(store), Arc::new(lock), config).unwrap();
        app(AppState::new(Arc::new(engine)))
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let resp = test_app(MemoryLock::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn reconcile_then_read_queue() {
        let app = test_app(MemoryLock::new());
        let resp = app.clone().oneshot(post("/reconcile")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["operation"], "reconcile");
        assert_eq!(body["count"], 2);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/queue?limit=1&claimed=false")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["rows"].as_array().unwrap().len(), 1);
        assert_eq!(body["rows"][0]["ID"], "A2");
        assert_eq!(body["rows"][0]["ORIGIN"], "Line 2");
        assert_eq!(body["rows"][0]["CLAIMED"], false);
    }

    #[tokio::test]
    async fn empty_queue_reads_as_zero_rows() {
        let resp = test_app(MemoryLock::new())
            .oneshot(Request::builder().uri("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["total"], 0);
    }

    #[tokio::test]
    async fn busy_lock_maps_to_conflict() {
        let lock = MemoryLock::new();
        let _held = lock
            .try_acquire(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("lock free");
        let resp = test_app(lock).oneshot(post("/release")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "busy");
        assert_eq!(body["operation"], "release_leases");
    }
}
