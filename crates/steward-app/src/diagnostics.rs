use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use probe_adapter::{Probe, ProbeOutcome};
use repair_guard::{
    CheckId, CheckStatus, Criticality, DiagnosticCheck, DiagnosticReport, ServiceStatus, Services,
};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A registered dependency: which check it feeds and how to probe it.
#[derive(Clone)]
pub struct ServiceDescriptor {
    id: CheckId,
    target: String,
    probe: Arc<dyn Probe>,
}

impl ServiceDescriptor {
    pub fn new(id: CheckId, probe: Arc<dyn Probe>) -> Self {
        Self {
            id,
            target: probe.target(),
            probe,
        }
    }

    pub fn id(&self) -> CheckId {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosisOptions {
    pub skip: Vec<CheckId>,
}

impl DiagnosisOptions {
    pub fn skipping(ids: impl IntoIterator<Item = CheckId>) -> Self {
        Self {
            skip: ids.into_iter().collect(),
        }
    }

    fn includes(&self, id: CheckId) -> bool {
        if !self.skip.contains(&id) {
            return true;
        }
        if id.criticality() == Criticality::Critical {
            debug_assert!(false, "critical check '{}' cannot be skipped", id.as_str());
            warn!("ignoring request to skip critical check {}", id.as_str());
            return true;
        }
        false
    }
}

pub struct DiagnosticEngine {
    descriptors: Vec<ServiceDescriptor>,
    probe_timeout: Duration,
    services: RwLock<Services>,
}

impl DiagnosticEngine {
    pub fn new(descriptors: Vec<ServiceDescriptor>, probe_timeout: Duration) -> Self {
        let mut registered: Vec<ServiceDescriptor> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if registered.iter().any(|d| d.id == descriptor.id) {
                warn!("duplicate registration for check {} ignored", descriptor.id.as_str());
                continue;
            }
            registered.push(descriptor);
        }
        let services = registered
            .iter()
            .map(|d| (d.id, ServiceStatus::default()))
            .collect();
        Self {
            descriptors: registered,
            probe_timeout,
            services: RwLock::new(services),
        }
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    pub async fn services(&self) -> Services {
        self.services.read().await.clone()
    }

    /// Report with every registered check still `pending`.
    pub fn placeholder_report(&self) -> DiagnosticReport {
        DiagnosticReport::new(
            self.descriptors
                .iter()
                .map(|d| DiagnosticCheck::pending(d.id))
                .collect(),
        )
    }

    /// Probes every selected dependency concurrently and folds the outcomes
    /// into a report ordered by registration.
    pub async fn run_diagnosis(&self, options: &DiagnosisOptions) -> DiagnosticReport {
        let selected: Vec<&ServiceDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| options.includes(d.id))
            .collect();

        let mut tasks = JoinSet::new();
        for (index, descriptor) in selected.iter().enumerate() {
            let probe = Arc::clone(&descriptor.probe);
            let timeout = self.probe_timeout;
            tasks.spawn(async move {
                let outcome = tokio::time::timeout(timeout, probe.probe())
                    .await
                    .unwrap_or_else(|_| {
                        ProbeOutcome::unreachable(format!(
                            "no response within {}ms",
                            timeout.as_millis()
                        ))
                    });
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<ProbeOutcome>> = vec![None; selected.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!("probe task failed: {}", e),
            }
        }

        let now = Utc::now();
        let mut checks = Vec::with_capacity(selected.len());
        let mut services = self.services.write().await;
        for (descriptor, outcome) in selected.iter().zip(outcomes) {
            let outcome =
                outcome.unwrap_or_else(|| ProbeOutcome::unreachable("probe aborted unexpectedly"));
            debug!("probe {} -> {:?}", descriptor.id.as_str(), outcome);
            let error = (!outcome.is_ready()).then(|| outcome.detail().to_string());
            services.entry(descriptor.id).or_default().observe(
                outcome.is_reachable(),
                outcome.is_ready(),
                now,
                error,
            );
            checks.push(DiagnosticCheck::new(
                descriptor.id,
                classify(descriptor.id, &outcome),
                outcome.detail(),
            ));
        }
        DiagnosticReport::new(checks)
    }
}

pub fn classify(id: CheckId, outcome: &ProbeOutcome) -> CheckStatus {
    match outcome {
        ProbeOutcome::Ready { .. } => CheckStatus::Ok,
        ProbeOutcome::NotReady { .. } => CheckStatus::Warning,
        ProbeOutcome::Unreachable { .. } => match id.criticality() {
            Criticality::Critical => CheckStatus::Error,
            Criticality::Optional => CheckStatus::Warning,
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Probe whose outcome can be swapped between runs.
    pub struct FakeProbe {
        outcome: Mutex<ProbeOutcome>,
        delay: Duration,
        pub calls: AtomicUsize,
    }

    impl FakeProbe {
        pub fn new(outcome: ProbeOutcome) -> Arc<Self> {
            Self::delayed(outcome, Duration::ZERO)
        }

        pub fn delayed(outcome: ProbeOutcome, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn set(&self, outcome: ProbeOutcome) {
            *self.outcome.lock().unwrap() = outcome;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for FakeProbe {
        fn target(&self) -> String {
            "fake".to_string()
        }

        async fn probe(&self) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.lock().unwrap().clone()
        }
    }

    pub struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        fn target(&self) -> String {
            "panic".to_string()
        }

        async fn probe(&self) -> ProbeOutcome {
            panic!("probe blew up");
        }
    }

    /// One fake probe per check id, in registration order.
    pub fn fake_engine(outcomes: [ProbeOutcome; 5]) -> (Arc<DiagnosticEngine>, Vec<Arc<FakeProbe>>) {
        let probes: Vec<Arc<FakeProbe>> = outcomes.into_iter().map(FakeProbe::new).collect();
        let descriptors = CheckId::ALL
            .into_iter()
            .zip(&probes)
            .map(|(id, p)| ServiceDescriptor::new(id, Arc::clone(p) as Arc<dyn Probe>))
            .collect();
        (
            Arc::new(DiagnosticEngine::new(descriptors, Duration::from_millis(200))),
            probes,
        )
    }

    pub fn ready() -> ProbeOutcome {
        ProbeOutcome::ready("up")
    }

    pub fn down() -> ProbeOutcome {
        ProbeOutcome::unreachable("connection refused")
    }
}
