use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use repair_guard::{
    ApprovedPlan, CheckId, Criticality, DiagnosticReport, RepairPlan, RepairResult,
    create_repair_plan,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use steward_store::ConsentId;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::controller::{Controller, ControllerError, ControllerState, SystemState};
use crate::diagnostics::DiagnosisOptions;
use crate::executor::RepairExecutor;
use crate::orchestrator::Orchestrator;
use crate::providers::{AiProvider, ProviderSelector};

struct AppState {
    controller: Mutex<Controller>,
    executor: Arc<RepairExecutor>,
    selector: Arc<ProviderSelector>,
    pending_plan: Mutex<Option<RepairPlan>>,
    last_report: Mutex<Option<DiagnosticReport>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::AlreadyDecided(_) => Self::conflict("already_decided", err.to_string()),
            ControllerError::InvalidTransition { .. } => {
                Self::conflict("invalid_transition", err.to_string())
            }
            ControllerError::Persistence(_) => Self::internal("persistence_failed", err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    state: ControllerState,
    system: SystemState,
    last_report: DiagnosticReport,
}

#[derive(Debug, Default, Deserialize)]
struct DiagnosisRequest {
    #[serde(default)]
    skip: Vec<CheckId>,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    plan_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ConsentView {
    id: ConsentId,
    prompt: &'static str,
    granted: bool,
    decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ConsentUpdate {
    granted: bool,
}

#[derive(Debug, Serialize)]
struct ConfigureView {
    selected: Option<AiProvider>,
}

pub fn parse_addr(value: &str) -> Result<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid socket address '{value}'"))
}

pub async fn bind(bind_addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))
}

pub async fn serve(
    orchestrator: &Orchestrator,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let mut controller = orchestrator.controller();
    controller
        .boot()
        .await
        .context("failed to load consent state")?;
    serve_on_listener(
        listener,
        controller,
        Arc::clone(orchestrator.executor()),
        Arc::clone(orchestrator.selector()),
        shutdown,
    )
    .await
}

async fn serve_on_listener(
    listener: TcpListener,
    controller: Controller,
    executor: Arc<RepairExecutor>,
    selector: Arc<ProviderSelector>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    let state = AppState {
        controller: Mutex::new(controller),
        executor,
        selector,
        pending_plan: Mutex::new(None),
        last_report: Mutex::new(None),
    };
    info!("steward status API listening on http://{}", addr);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/diagnosis", post(run_diagnosis))
        .route("/api/repair/plan", post(propose_plan))
        .route("/api/repair/execute", post(execute_plan))
        .route("/api/consent", get(list_consent))
        .route("/api/consent/{id}", put(update_consent))
        .route("/api/providers", get(list_providers))
        .route("/api/providers/configure", post(configure_provider))
        .with_state(Arc::new(state));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("status API server failed")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    let controller = state.controller.lock().await;
    Json(StatusView {
        state: controller.state().await,
        system: controller.system_state().await,
        last_report: state
            .last_report
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| state.executor.engine().placeholder_report()),
    })
}

async fn run_diagnosis(
    State(state): State<Arc<AppState>>,
    body: Option<Json<DiagnosisRequest>>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    if let Some(id) = request
        .skip
        .iter()
        .find(|id| id.criticality() == Criticality::Critical)
    {
        return Err(ApiError::bad_request(
            "critical_check",
            format!("check '{}' is critical and cannot be skipped", id.as_str()),
        ));
    }
    let report = state
        .executor
        .engine()
        .run_diagnosis(&DiagnosisOptions::skipping(request.skip))
        .await;
    *state.last_report.lock().await = Some(report.clone());
    Ok(Json(report))
}

/// Diagnoses afresh and proposes a plan. The response previews which
/// actions current consent would allow; nothing runs until execute.
async fn propose_plan(State(state): State<Arc<AppState>>) -> Result<Json<ApprovedPlan>, ApiError> {
    let report = state
        .executor
        .engine()
        .run_diagnosis(&DiagnosisOptions::default())
        .await;
    *state.last_report.lock().await = Some(report.clone());
    let plan = create_repair_plan(report);
    let consent = state.controller.lock().await.refresh_consent()?;
    *state.pending_plan.lock().await = Some(plan.clone());
    Ok(Json(plan.approve(&consent)))
}

async fn execute_plan(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<RepairResult>, ApiError> {
    let plan = {
        let mut pending = state.pending_plan.lock().await;
        match pending.as_ref().map(RepairPlan::id) {
            Some(id) if id == request.plan_id => pending.take(),
            Some(_) => {
                return Err(ApiError::conflict(
                    "plan_mismatch",
                    "only the most recently proposed plan can be executed",
                ));
            }
            None => None,
        }
    };
    let Some(plan) = plan else {
        return Err(ApiError::conflict(
            "no_pending_plan",
            "propose a repair plan before executing it",
        ));
    };
    let consent = state.controller.lock().await.refresh_consent()?;
    let result = state.executor.execute_repair_plan(plan.approve(&consent)).await;
    *state.last_report.lock().await = Some(result.verification().clone());
    Ok(Json(result))
}

async fn list_consent(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConsentView>>, ApiError> {
    let consent = state.controller.lock().await.refresh_consent()?;
    Ok(Json(
        ConsentId::ALL
            .into_iter()
            .map(|id| {
                let decision = consent.decision(id);
                ConsentView {
                    id,
                    prompt: id.prompt(),
                    granted: decision.is_some_and(|d| d.granted),
                    decided_at: decision.map(|d| d.decided_at),
                }
            })
            .collect(),
    ))
}

async fn update_consent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ConsentUpdate>,
) -> Result<StatusCode, ApiError> {
    let consent_id = ConsentId::parse(&id)
        .ok_or_else(|| ApiError::not_found("unknown_consent", format!("unknown consent '{id}'")))?;
    state
        .controller
        .lock()
        .await
        .set_consent(consent_id, update.granted)
        .map_err(|e| {
            warn!("consent update failed: {}", e);
            ApiError::from(e)
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<AiProvider>> {
    Json(state.selector.probe_all().await)
}

async fn configure_provider(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigureView>, ApiError> {
    let selected = state
        .selector
        .self_configure()
        .await
        .map_err(|e| ApiError::internal("persistence_failed", e.to_string()))?;
    Ok(Json(ConfigureView { selected }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::testing::{down, fake_engine, ready};
    use crate::executor::testing::ScriptedRemediator;
    use serde_json::Value as JsonValue;
    use steward_store::{ConsentState, SettingsStore};
    use tokio::sync::oneshot;

    struct Harness {
        _dir: tempfile::TempDir,
        store: SettingsStore,
        base: String,
        stop: oneshot::Sender<()>,
    }

    async fn start(inference_up: bool) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::new(Some(dir.path().to_path_buf())).unwrap();
        let mut consent = ConsentState::default();
        consent.record(ConsentId::AutoStartServices, true);
        store.save_consent(&consent).unwrap();
        store.mark_first_run_complete().unwrap();

        let inference = if inference_up { ready() } else { down() };
        let (engine, _) = fake_engine([inference, ready(), ready(), ready(), ready()]);
        let executor = Arc::new(RepairExecutor::new(
            Arc::clone(&engine),
            Arc::new(ScriptedRemediator::default()),
            std::time::Duration::from_secs(1),
        ));
        let selector = Arc::new(ProviderSelector::with_catalog(
            store.clone(),
            std::time::Duration::from_millis(200),
            Vec::new(),
        ));
        let mut controller = Controller::new(store.clone(), engine);
        controller.boot().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = serve_on_listener(listener, controller, executor, selector, async {
                let _ = rx.await;
            })
            .await;
        });
        Harness {
            _dir: dir,
            store,
            base: format!("http://{addr}"),
            stop: tx,
        }
    }

    async fn post_json(url: String, body: JsonValue) -> reqwest::Response {
        reqwest::Client::new().post(url).json(&body).send().await.unwrap()
    }

    #[tokio::test]
    async fn occupied_address_fails_to_bind() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = bind(addr).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"), "{err:#}");
    }

    #[tokio::test]
    async fn status_reflects_fresh_diagnosis() {
        let h = start(true).await;
        let health = reqwest::get(format!("{}/healthz", h.base)).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let report: JsonValue = post_json(format!("{}/api/diagnosis", h.base), json!({}))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(report["issues_found"], false);

        let status: JsonValue = reqwest::get(format!("{}/api/status", h.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["state"]["state"], "configured");
        assert_eq!(status["state"]["mode"], "FULL");
        assert_eq!(status["system"]["mode"], "FULL");
        assert_eq!(status["last_report"]["summary"], "all 5 checks passed");
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn critical_checks_cannot_be_skipped_over_http() {
        let h = start(true).await;
        let resp = post_json(
            format!("{}/api/diagnosis", h.base),
            json!({"skip": ["backend"]}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: JsonValue = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "critical_check");

        let resp = post_json(
            format!("{}/api/diagnosis", h.base),
            json!({"skip": ["cloud_keys"]}),
        )
        .await;
        let body: JsonValue = resp.json().await.unwrap();
        assert_eq!(body["checks"].as_array().map(Vec::len), Some(4));
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn only_the_latest_plan_executes_once() {
        let h = start(false).await;
        let plan: JsonValue = post_json(format!("{}/api/repair/plan", h.base), json!({}))
            .await
            .json()
            .await
            .unwrap();
        let plan_id = plan["plan"]["id"].as_str().unwrap().to_string();
        assert_eq!(plan["plan"]["estimated_risk"], "low");
        assert_eq!(plan["gates"][0]["gate"], "approved");

        let wrong = post_json(
            format!("{}/api/repair/execute", h.base),
            json!({"plan_id": Uuid::new_v4()}),
        )
        .await;
        assert_eq!(wrong.status(), StatusCode::CONFLICT);

        let result: JsonValue = post_json(
            format!("{}/api/repair/execute", h.base),
            json!({"plan_id": plan_id}),
        )
        .await
        .json()
        .await
        .unwrap();
        assert_eq!(result["actions_taken"][0]["kind"], "start_inference");
        assert_eq!(result["actions_taken"][0]["success"], true);
        assert_eq!(result["success"], false);
        assert!(result["verification"]["checks"].is_array());

        let again = post_json(
            format!("{}/api/repair/execute", h.base),
            json!({"plan_id": plan_id}),
        )
        .await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn consent_revoked_after_boot_blocks_execution() {
        let h = start(false).await;
        let mut revoked = h.store.load_consent().unwrap();
        revoked.record(ConsentId::AutoStartServices, false);
        h.store.save_consent(&revoked).unwrap();

        let plan: JsonValue = post_json(format!("{}/api/repair/plan", h.base), json!({}))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(plan["gates"][0]["gate"], "withheld");
        let plan_id = plan["plan"]["id"].as_str().unwrap().to_string();

        let result: JsonValue = post_json(
            format!("{}/api/repair/execute", h.base),
            json!({"plan_id": plan_id}),
        )
        .await
        .json()
        .await
        .unwrap();
        assert_eq!(result["actions_taken"][0]["kind"], "start_inference");
        assert_eq!(result["actions_taken"][0]["skipped"], true);
        assert_eq!(result["actions_taken"][0]["success"], false);
        assert_eq!(result["success"], false);

        let listed: JsonValue = reqwest::get(format!("{}/api/consent", h.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed[0]["granted"], false);
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn consent_updates_are_persisted() {
        let h = start(true).await;
        let client = reqwest::Client::new();
        let resp = client
            .put(format!("{}/api/consent/settings_reset", h.base))
            .json(&json!({"granted": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(h.store.load_consent().unwrap().granted(ConsentId::SettingsReset));

        let unknown = client
            .put(format!("{}/api/consent/telemetry", h.base))
            .json(&json!({"granted": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let listed: JsonValue = reqwest::get(format!("{}/api/consent", h.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed[1]["id"], "settings_reset");
        assert_eq!(listed[1]["granted"], true);
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn provider_configuration_clears_when_nothing_is_available() {
        let h = start(true).await;
        let providers: JsonValue = reqwest::get(format!("{}/api/providers", h.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(providers, json!([]));

        let configured: JsonValue =
            post_json(format!("{}/api/providers/configure", h.base), json!({}))
                .await
                .json()
                .await
                .unwrap();
        assert_eq!(configured["selected"], JsonValue::Null);
        assert!(!h.store.load().unwrap().ai.self_configured);
        let _ = h.stop.send(());
    }
}
