use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use repair_guard::{ActionGate, ActionRecord, ApprovedPlan, RemediationKind, RepairAction, RepairResult};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::diagnostics::{DiagnosisOptions, DiagnosticEngine};

/// Performs one kind of remediation against the live environment.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn remediate(&self, kind: RemediationKind) -> Result<()>;
}

pub struct RepairExecutor {
    engine: Arc<DiagnosticEngine>,
    remediator: Arc<dyn Remediator>,
    action_timeout: Duration,
    // Serializes every repair, explicit or automatic.
    in_flight: Mutex<()>,
}

impl RepairExecutor {
    pub fn new(
        engine: Arc<DiagnosticEngine>,
        remediator: Arc<dyn Remediator>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            remediator,
            action_timeout,
            in_flight: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<DiagnosticEngine> {
        &self.engine
    }

    /// Runs the approved actions one after another, then re-diagnoses. Waits
    /// for any repair already in flight.
    pub async fn execute_repair_plan(&self, plan: ApprovedPlan) -> RepairResult {
        let _guard = self.in_flight.lock().await;
        info!(
            "executing repair plan {} ({} action(s), {} approved)",
            plan.plan().id(),
            plan.plan().actions().len(),
            plan.approved_count()
        );
        let records = self.run_steps(&plan).await;
        let verification = self.engine.run_diagnosis(&DiagnosisOptions::default()).await;
        let result = RepairResult::new(plan.plan().id(), records, verification);
        info!(
            "repair plan {} finished: success={} ({})",
            result.plan_id(),
            result.success(),
            result.verification().summary()
        );
        result
    }

    /// Monitor entry point. Returns `None` instead of waiting when a repair
    /// is already running.
    pub async fn try_run_auto_start(&self, plan: &ApprovedPlan) -> Option<Vec<ActionRecord>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return None;
        };
        Some(self.run_steps(plan).await)
    }

    async fn run_steps(&self, plan: &ApprovedPlan) -> Vec<ActionRecord> {
        let mut records = Vec::with_capacity(plan.plan().actions().len());
        for (action, gate) in plan.steps() {
            let record = match gate {
                ActionGate::Approved => self.run_action(action).await,
                ActionGate::Withheld(consent) => {
                    info!(
                        "skipping '{}': consent {} not granted",
                        action.description,
                        consent.as_str()
                    );
                    ActionRecord::withheld(action, consent)
                }
            };
            records.push(record);
        }
        records
    }

    async fn run_action(&self, action: &RepairAction) -> ActionRecord {
        let started = Instant::now();
        let remediator = Arc::clone(&self.remediator);
        let kind = action.kind;
        let mut task = tokio::spawn(async move { remediator.remediate(kind).await });
        let error = match tokio::time::timeout(self.action_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(format!("{e:#}")),
            Ok(Err(e)) => Some(format!("remediation task failed: {e}")),
            Err(_) => {
                task.abort();
                Some(format!(
                    "timed out after {}s",
                    self.action_timeout.as_secs_f32()
                ))
            }
        };
        if let Some(e) = error.as_deref() {
            warn!("repair action '{}' failed: {}", action.description, e);
        } else {
            info!("repair action '{}' succeeded", action.description);
        }
        ActionRecord {
            action_id: action.id,
            kind,
            description: action.description.clone(),
            success: error.is_none(),
            skipped: false,
            error,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use anyhow::bail;

    use super::*;

    /// Remediator with scripted per-kind results and a call log.
    #[derive(Default)]
    pub struct ScriptedRemediator {
        failing: BTreeMap<RemediationKind, String>,
        delay: Option<Duration>,
        pub calls: StdMutex<Vec<RemediationKind>>,
    }

    impl ScriptedRemediator {
        pub fn failing(mut self, kind: RemediationKind, message: &str) -> Self {
            self.failing.insert(kind, message.to_string());
            self
        }

        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> Vec<RemediationKind> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Remediator for ScriptedRemediator {
        async fn remediate(&self, kind: RemediationKind) -> Result<()> {
            self.calls.lock().unwrap().push(kind);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = self.failing.get(&kind) {
                bail!("{message}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRemediator;
    use super::*;
    use crate::diagnostics::testing::{down, fake_engine, ready};
    use repair_guard::{DiagnosticReport, RepairPlan, create_repair_plan};
    use steward_store::{ConsentId, ConsentState};

    fn all_granted() -> ConsentState {
        let mut consent = ConsentState::default();
        for id in ConsentId::ALL {
            consent.record(id, true);
        }
        consent
    }

    async fn plan_for(engine: &DiagnosticEngine) -> RepairPlan {
        create_repair_plan(engine.run_diagnosis(&DiagnosisOptions::default()).await)
    }

    #[tokio::test]
    async fn partial_success_records_each_action_and_verifies_once() {
        let (engine, probes) = fake_engine([down(), down(), ready(), ready(), ready()]);
        let plan = plan_for(&engine).await;
        assert_eq!(plan.actions().len(), 2);
        let calls_before = probes[0].calls();

        let remediator = Arc::new(
            ScriptedRemediator::default()
                .failing(RemediationKind::StartKnowledgeStore, "docker not installed"),
        );
        let executor = RepairExecutor::new(
            Arc::clone(&engine),
            remediator.clone(),
            Duration::from_secs(1),
        );
        let result = executor.execute_repair_plan(plan.approve(&all_granted())).await;

        let outcomes: Vec<bool> = result.actions_taken().iter().map(|r| r.success).collect();
        assert_eq!(outcomes, [true, false]);
        assert!(
            result.actions_taken()[1]
                .error
                .as_deref()
                .is_some_and(|e| e.contains("docker not installed"))
        );
        assert_eq!(probes[0].calls(), calls_before + 1);
        assert!(!result.success());
        assert_eq!(result.success(), !result.verification().issues_found());
    }

    #[tokio::test]
    async fn verification_runs_after_actions_even_for_empty_plans() {
        let (engine, probes) = fake_engine([ready(), ready(), ready(), ready(), ready()]);
        let plan = plan_for(&engine).await;
        assert!(plan.is_empty());

        let executor = RepairExecutor::new(
            Arc::clone(&engine),
            Arc::new(ScriptedRemediator::default()),
            Duration::from_secs(1),
        );
        let before = probes[0].calls();
        let planned_at = plan.timestamp();
        let result = executor.execute_repair_plan(plan.approve(&ConsentState::default())).await;
        assert!(result.actions_taken().is_empty());
        assert!(result.success());
        assert_eq!(probes[0].calls(), before + 1);
        assert!(result.verification().timestamp() >= planned_at);
    }

    #[tokio::test]
    async fn repair_fixes_environment_and_reports_success() {
        let (engine, probes) = fake_engine([down(), ready(), ready(), ready(), ready()]);
        let plan = plan_for(&engine).await;
        probes[0].set(ready());
        let executor = RepairExecutor::new(
            Arc::clone(&engine),
            Arc::new(ScriptedRemediator::default()),
            Duration::from_secs(1),
        );
        let result = executor.execute_repair_plan(plan.approve(&all_granted())).await;
        assert!(result.success());
        assert!(!result.verification().issues_found());
    }

    #[tokio::test]
    async fn withheld_actions_never_execute() {
        let (engine, _) = fake_engine([down(), ready(), down(), down(), ready()]);
        let plan = plan_for(&engine).await;
        let kinds: Vec<_> = plan.actions().iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            [
                RemediationKind::StartInference,
                RemediationKind::AwaitBackend,
                RemediationKind::ResetSettings,
            ]
        );

        let mut consent = ConsentState::default();
        consent.record(ConsentId::AutoStartServices, false);
        let remediator = Arc::new(ScriptedRemediator::default());
        let executor =
            RepairExecutor::new(Arc::clone(&engine), remediator.clone(), Duration::from_secs(1));
        let result = executor.execute_repair_plan(plan.approve(&consent)).await;

        assert_eq!(remediator.calls(), [RemediationKind::AwaitBackend]);
        let records: Vec<(bool, bool)> = result
            .actions_taken()
            .iter()
            .map(|r| (r.success, r.skipped))
            .collect();
        assert_eq!(records, [(false, true), (true, false), (false, true)]);
    }

    #[tokio::test]
    async fn slow_actions_time_out_as_failures() {
        let (engine, _) = fake_engine([down(), ready(), ready(), ready(), ready()]);
        let plan = plan_for(&engine).await;
        let executor = RepairExecutor::new(
            Arc::clone(&engine),
            Arc::new(ScriptedRemediator::default().delayed(Duration::from_secs(5))),
            Duration::from_millis(50),
        );
        let result = executor.execute_repair_plan(plan.approve(&all_granted())).await;
        let record = &result.actions_taken()[0];
        assert!(!record.success && !record.skipped);
        assert!(record.error.as_deref().is_some_and(|e| e.starts_with("timed out")));
    }

    #[tokio::test]
    async fn auto_start_reports_busy_while_a_repair_runs() {
        let (engine, _) = fake_engine([down(), ready(), ready(), ready(), ready()]);
        let report: DiagnosticReport = engine.run_diagnosis(&DiagnosisOptions::default()).await;
        let executor = Arc::new(RepairExecutor::new(
            Arc::clone(&engine),
            Arc::new(ScriptedRemediator::default().delayed(Duration::from_millis(300))),
            Duration::from_secs(2),
        ));

        let explicit = create_repair_plan(report.clone()).approve(&all_granted());
        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute_repair_plan(explicit).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let auto = RepairPlan::auto_start(report).approve(&all_granted());
        assert!(executor.try_run_auto_start(&auto).await.is_none());

        running.await.unwrap();
        let records = executor.try_run_auto_start(&auto).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
