use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use probe_adapter::{HealthProbe, ModelsProbe, Probe, ProbeOutcome, TcpProbe};
use repair_guard::CheckId;
use steward_store::{Settings, SettingsStore};
use tracing::warn;

use crate::controller::Controller;
use crate::diagnostics::{DiagnosticEngine, ServiceDescriptor};
use crate::executor::{Remediator, RepairExecutor};
use crate::monitor::HealthMonitor;
use crate::providers::{ConfiguredKeysProbe, ProviderSelector};
use crate::remediate::{BACKEND_HEALTH_PATH, KNOWLEDGE_STORE_HEALTH_PATH, ServiceLauncher};

/// Builds one descriptor per known check, in registration order.
/// `backend_override` replaces the stored backend URL for this process only.
pub fn service_registry(
    store: &SettingsStore,
    settings: &Settings,
    backend_override: Option<&str>,
) -> Vec<ServiceDescriptor> {
    let timeout = Duration::from_millis(settings.probe_timeout_ms);
    CheckId::ALL
        .into_iter()
        .map(|id| {
            let probe: Arc<dyn Probe> = match id {
                CheckId::Inference | CheckId::KnowledgeStore | CheckId::Backend => {
                    Arc::new(StoredEndpointProbe {
                        id,
                        store: store.clone(),
                        startup: settings.clone(),
                        backend_override: backend_override.map(str::to_string),
                    })
                }
                CheckId::Internet => Arc::new(TcpProbe::internet(timeout)),
                CheckId::CloudKeys => Arc::new(ConfiguredKeysProbe::new(store.clone(), timeout)),
            };
            ServiceDescriptor::new(id, probe)
        })
        .collect()
}

fn endpoint_probe(id: CheckId, settings: &Settings) -> Box<dyn Probe> {
    let timeout = Duration::from_millis(settings.probe_timeout_ms);
    let endpoints = &settings.endpoints;
    match id {
        CheckId::KnowledgeStore => Box::new(HealthProbe::new(
            &endpoints.knowledge_store_url,
            KNOWLEDGE_STORE_HEALTH_PATH,
            timeout,
        )),
        CheckId::Backend => Box::new(HealthProbe::new(
            &endpoints.backend_url,
            BACKEND_HEALTH_PATH,
            timeout,
        )),
        _ => Box::new(ModelsProbe::new(&endpoints.inference_urls, timeout)),
    }
}

/// Re-reads endpoints from the store on every run, so a settings edit or a
/// reset remediation is picked up by the next diagnosis.
struct StoredEndpointProbe {
    id: CheckId,
    store: SettingsStore,
    startup: Settings,
    backend_override: Option<String>,
}

impl StoredEndpointProbe {
    fn current(&self) -> Settings {
        let mut settings = match self.store.load() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("settings unreadable, probing startup endpoints: {}", e);
                self.startup.clone()
            }
        };
        if let Some(url) = &self.backend_override {
            settings.endpoints.backend_url = url.clone();
        }
        settings
    }
}

#[async_trait]
impl Probe for StoredEndpointProbe {
    fn target(&self) -> String {
        endpoint_probe(self.id, &self.startup).target()
    }

    async fn probe(&self) -> ProbeOutcome {
        endpoint_probe(self.id, &self.current()).probe().await
    }
}

/// Composition root: every long-lived component is constructed here and
/// handed out explicitly.
pub struct Orchestrator {
    store: SettingsStore,
    settings: Settings,
    executor: Arc<RepairExecutor>,
    selector: Arc<ProviderSelector>,
}

impl Orchestrator {
    pub fn from_store(store: SettingsStore) -> steward_store::Result<Self> {
        Self::with_backend_override(store, None)
    }

    /// Like `from_store`, but probes `backend_url` (when given) instead of
    /// the stored backend endpoint. The override is never persisted.
    pub fn with_backend_override(
        store: SettingsStore,
        backend_url: Option<String>,
    ) -> steward_store::Result<Self> {
        let mut settings = store.load()?;
        if let Some(url) = &backend_url {
            settings.endpoints.backend_url = url.clone();
        }
        let probe_timeout = Duration::from_millis(settings.probe_timeout_ms);
        let engine = Arc::new(DiagnosticEngine::new(
            service_registry(&store, &settings, backend_url.as_deref()),
            probe_timeout,
        ));
        let remediator: Arc<dyn Remediator> = Arc::new(ServiceLauncher::new(store.clone()));
        let selector = ProviderSelector::new(store.clone(), probe_timeout);
        Ok(Self::from_parts(store, settings, engine, remediator, selector))
    }

    pub fn from_parts(
        store: SettingsStore,
        settings: Settings,
        engine: Arc<DiagnosticEngine>,
        remediator: Arc<dyn Remediator>,
        selector: ProviderSelector,
    ) -> Self {
        let executor = Arc::new(RepairExecutor::new(
            engine,
            remediator,
            Duration::from_secs(settings.action_timeout_secs),
        ));
        Self {
            store,
            settings,
            executor,
            selector: Arc::new(selector),
        }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<DiagnosticEngine> {
        self.executor.engine()
    }

    pub fn executor(&self) -> &Arc<RepairExecutor> {
        &self.executor
    }

    pub fn selector(&self) -> &Arc<ProviderSelector> {
        &self.selector
    }

    pub fn controller(&self) -> Controller {
        Controller::new(self.store.clone(), Arc::clone(self.engine()))
    }

    pub fn monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.store.clone(), Arc::clone(&self.executor))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.settings.monitor_interval_secs.max(1))
    }
}
