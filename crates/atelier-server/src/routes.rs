//! Control-plane HTTP routes.

use crate::core::Core;
use crate::ws;
use atelier_observability::{export_metrics, HealthStatus};
use atelier_types::{CoreError, ExecuteAction, OrgId, RunId, RunState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/api/agent/execute", post(execute))
        .route("/api/agent/runs/:id", get(get_run))
        .route("/api/agent/runs/:id/messages", get(get_messages))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(core)
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub action: ExecuteAction,
    pub org_id: OrgId,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub run_id: Option<RunId>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
        CoreError::InsufficientCredits { .. }
        | CoreError::PerCallLimit(_)
        | CoreError::RunBudget(_) => StatusCode::PAYMENT_REQUIRED,
        CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::PlanRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        // Programming errors and backend trouble.
        CoreError::InvalidTransition { .. }
        | CoreError::StoreConflict(_)
        | CoreError::StoreFailure(_)
        | CoreError::TransientProvider(_)
        | CoreError::SandboxUnhealthy(_)
        | CoreError::ToolError(_)
        | CoreError::Cancelled
        | CoreError::DeadlineExceeded => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: CoreError) -> Response {
    let body = ErrorBody {
        error: err.to_string(),
        code: err.code().to_string(),
        retry_after_secs: err.retry_after().map(|d| d.as_secs()),
    };
    (status_for(&err), Json(body)).into_response()
}

async fn execute(
    State(core): State<Arc<Core>>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    // Unknown runs are a 404, not a validation failure.
    if let Some(run_id) = request.run_id {
        match core.orchestrator.get_run(run_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(ErrorBody {
                        error: format!("run {run_id} not found"),
                        code: "not_found".to_string(),
                        retry_after_secs: None,
                    }),
                )
                    .into_response()
            }
            Err(err) => return error_response(err),
        }
    }

    match core
        .orchestrator
        .execute(request.action, request.org_id, request.prompt, request.run_id)
        .await
    {
        Ok(outcome) => {
            if matches!(request.action, ExecuteAction::Create | ExecuteAction::Retry) {
                core.metrics.runs.runs_created.inc();
            }
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct RunView {
    id: RunId,
    state: RunState,
    state_version: u64,
    completed_phase: Option<usize>,
    cost_usd: String,
    error: Option<atelier_types::RunError>,
    result: Option<String>,
}

async fn get_run(State(core): State<Arc<Core>>, Path(id): Path<RunId>) -> Response {
    match core.orchestrator.get_run(id).await {
        Ok(Some(run)) => (
            StatusCode::OK,
            Json(RunView {
                id: run.id,
                state: run.state,
                state_version: run.state_version,
                completed_phase: run.completed_phase,
                cost_usd: run.cost_usd,
                error: run.last_error,
                result: run.result,
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("run {id} not found"),
                code: "not_found".to_string(),
                retry_after_secs: None,
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_messages(State(core): State<Arc<Core>>, Path(id): Path<RunId>) -> Response {
    match core.orchestrator.get_run(id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("run {id} not found"),
                    code: "not_found".to_string(),
                    retry_after_secs: None,
                }),
            )
                .into_response()
        }
        Err(err) => return error_response(err),
    }
    match core.orchestrator.messages(id).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn liveness(State(core): State<Arc<Core>>) -> Response {
    let status = core.health.liveness();
    (StatusCode::OK, Json(serde_json::json!({ "status": status }))).into_response()
}

async fn readiness(State(core): State<Arc<Core>>) -> Response {
    let status = core.health.readiness().await;
    let code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(serde_json::json!({ "status": status }))).into_response()
}

async fn health(State(core): State<Arc<Core>>) -> Response {
    let report = core.health.report().await;
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

async fn metrics(State(core): State<Arc<Core>>) -> Response {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        export_metrics(&core.metrics.registry),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use atelier_ledger::TransactionType;
    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    async fn test_core() -> Arc<Core> {
        Arc::new(Core::build(ServerConfig::default()).await.unwrap())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn execute_create_returns_run() {
        let core = test_core().await;
        let org = atelier_types::OrgId::generate();
        core.ledger
            .add_credits(org, dec!(5.00), TransactionType::Purchase, "seed", "c1")
            .await
            .unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/agent/execute")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "action": "create",
                    "org_id": org,
                    "prompt": "summarize this"
                })
                .to_string(),
            ))
            .unwrap();

        let response = router(core).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "created");
        assert!(body["run_id"].is_string());
    }

    #[tokio::test]
    async fn execute_without_credit_is_402() {
        let core = test_core().await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/agent/execute")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "action": "create",
                    "org_id": atelier_types::OrgId::generate(),
                    "prompt": "summarize this"
                })
                .to_string(),
            ))
            .unwrap();

        let response = router(core).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "insufficient_credits");
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let core = test_core().await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/agent/execute")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "action": "stop",
                    "org_id": atelier_types::OrgId::generate(),
                    "run_id": uuid::Uuid::new_v4()
                })
                .to_string(),
            ))
            .unwrap();

        let response = router(core).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_action_is_400() {
        let core = test_core().await;
        // start without run_id
        let request = Request::builder()
            .method("POST")
            .uri("/api/agent/execute")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "action": "start",
                    "org_id": atelier_types::OrgId::generate()
                })
                .to_string(),
            ))
            .unwrap();

        let response = router(core).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_accessor_returns_state_and_progress() {
        let core = test_core().await;
        let org = atelier_types::OrgId::generate();
        core.ledger
            .add_credits(org, dec!(5.00), TransactionType::Purchase, "seed", "c1")
            .await
            .unwrap();
        let outcome = core
            .orchestrator
            .execute(ExecuteAction::Create, org, Some("task".into()), None)
            .await
            .unwrap();

        let request = Request::builder()
            .uri(format!("/api/agent/runs/{}", outcome.run_id))
            .body(Body::empty())
            .unwrap();
        let response = router(core).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "created");
        assert_eq!(body["state_version"], 0);
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let core = test_core().await;

        let response = router(core.clone())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(core.clone())
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(core.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["components"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn metrics_exposition_renders() {
        let core = test_core().await;
        core.metrics.runs.runs_created.inc();

        let response = router(core)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("atelier_runs_created_total 1"));
    }
}
