use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use repair_guard::{ActionRecord, CheckId, CheckStatus, DiagnosticReport, RepairPlan};
use serde::Serialize;
use steward_store::{ConsentId, SettingsStore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosisOptions;
use crate::executor::RepairExecutor;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "records", rename_all = "snake_case")]
pub enum TickOutcome {
    Disabled,
    ConsentWithheld,
    Busy,
    NothingToStart,
    Ran(Vec<ActionRecord>),
}

pub struct HealthMonitor {
    store: SettingsStore,
    executor: Arc<RepairExecutor>,
    auto_recovery_override: Option<bool>,
    last_statuses: BTreeMap<CheckId, CheckStatus>,
}

impl HealthMonitor {
    pub fn new(store: SettingsStore, executor: Arc<RepairExecutor>) -> Self {
        Self {
            store,
            executor,
            auto_recovery_override: None,
            last_statuses: BTreeMap::new(),
        }
    }

    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery_override = Some(enabled);
        self
    }

    /// One pass: diagnose, then auto-start downed services if both the
    /// setting and the consent allow it at this moment.
    pub async fn tick(&mut self) -> TickOutcome {
        let report = self
            .executor
            .engine()
            .run_diagnosis(&DiagnosisOptions::default())
            .await;
        self.log_transitions(&report);

        let auto_recovery = match self.auto_recovery_override {
            Some(enabled) => enabled,
            None => match self.store.load() {
                Ok(settings) => settings.auto_recovery,
                Err(e) => {
                    warn!("monitor could not read settings, auto-recovery off: {}", e);
                    false
                }
            },
        };
        if !auto_recovery {
            return TickOutcome::Disabled;
        }

        let consent = match self.store.load_consent() {
            Ok(consent) => consent,
            Err(e) => {
                warn!("monitor could not read consent, treating as withheld: {}", e);
                return TickOutcome::ConsentWithheld;
            }
        };
        if !consent.granted(ConsentId::AutoStartServices) {
            debug!("auto-start consent not granted; skipping recovery");
            return TickOutcome::ConsentWithheld;
        }

        let plan = RepairPlan::auto_start(report);
        if plan.is_empty() {
            return TickOutcome::NothingToStart;
        }
        let approved = plan.approve(&consent);
        match self.executor.try_run_auto_start(&approved).await {
            Some(records) => {
                info!(
                    "auto-recovery ran {} action(s), {} succeeded",
                    records.len(),
                    records.iter().filter(|r| r.success).count()
                );
                TickOutcome::Ran(records)
            }
            None => {
                debug!("repair in flight; auto-recovery deferred");
                TickOutcome::Busy
            }
        }
    }

    /// Ticks immediately, then every `interval`, until `shutdown` resolves.
    pub async fn run(mut self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!("health monitor started (interval {}s)", interval.as_secs());
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    debug!("monitor tick: {:?}", outcome);
                }
            }
        }
        info!("health monitor stopped");
    }

    fn log_transitions(&mut self, report: &DiagnosticReport) {
        for check in report.checks() {
            let previous = self.last_statuses.insert(check.id, check.status);
            match (previous, check.status) {
                (Some(CheckStatus::Ok), now) if now.is_failing() => {
                    warn!("{} went down: {}", check.name, check.message)
                }
                (Some(before), CheckStatus::Ok) if before.is_failing() => {
                    info!("{} recovered", check.name)
                }
                (None, now) if now.is_failing() => {
                    warn!("{} is not healthy: {}", check.name, check.message)
                }
                _ => {}
            }
        }
    }
}
