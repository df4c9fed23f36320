use std::sync::Arc;

use repair_guard::{DiagnosticReport, Mode, Services, derive_mode};
use serde::Serialize;
use steward_store::{ConsentId, ConsentState, SettingsStore, StoreError};
use tracing::{debug, info};

use crate::diagnostics::{DiagnosisOptions, DiagnosticEngine};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("consent '{}' was already decided", .0.as_str())]
    AlreadyDecided(ConsentId),
    #[error("cannot {action} while {stage}")]
    InvalidTransition {
        action: &'static str,
        stage: &'static str,
    },
    #[error("failed to persist configuration: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Unconfigured,
    Scanning,
    AwaitingConsent,
    Configured,
}

impl Stage {
    fn describe(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Scanning => "scanning",
            Self::AwaitingConsent => "awaiting consent",
            Self::Configured => "configured",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "mode", rename_all = "snake_case")]
pub enum ControllerState {
    Unconfigured,
    Scanning,
    AwaitingConsent,
    Configured(Mode),
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub first_run: bool,
    pub wizard_mode: bool,
    pub services: Services,
    pub consent: ConsentState,
    pub mode: Mode,
}

/// Owns consent and the setup state machine. The capability mode is never
/// stored here; it is derived from the engine's service statuses on demand.
pub struct Controller {
    store: SettingsStore,
    engine: Arc<DiagnosticEngine>,
    stage: Stage,
    first_run: bool,
    consent: ConsentState,
    pending: Vec<ConsentId>,
}

impl Controller {
    pub fn new(store: SettingsStore, engine: Arc<DiagnosticEngine>) -> Self {
        Self {
            store,
            engine,
            stage: Stage::Unconfigured,
            first_run: true,
            consent: ConsentState::default(),
            pending: Vec::new(),
        }
    }

    /// Re-reads the first-run marker and consent. Called once per process.
    pub async fn boot(&mut self) -> Result<ControllerState, ControllerError> {
        let marker = self.store.load_marker()?;
        self.consent = self.store.load_consent()?;
        self.pending.clear();
        if marker.first_run_complete {
            self.stage = Stage::Configured;
            self.first_run = false;
        } else {
            self.stage = Stage::Unconfigured;
            self.first_run = true;
        }
        debug!("controller booted in stage {}", self.stage.describe());
        Ok(self.state().await)
    }

    pub fn begin_first_run(&mut self) -> Result<(), ControllerError> {
        self.require_stage(Stage::Unconfigured, "begin first-run setup")?;
        self.stage = Stage::Scanning;
        info!("first run: scanning services");
        Ok(())
    }

    /// Diagnoses the system. During setup this also decides whether consent
    /// must be collected, committing straight away when none is outstanding.
    pub async fn scan(&mut self, options: &DiagnosisOptions) -> Result<DiagnosticReport, ControllerError> {
        match self.stage {
            Stage::Scanning | Stage::Configured => {}
            other => {
                return Err(ControllerError::InvalidTransition {
                    action: "scan",
                    stage: other.describe(),
                });
            }
        }
        let report = self.engine.run_diagnosis(options).await;
        if self.stage == Stage::Scanning {
            self.pending = self.consent.undecided();
            if self.pending.is_empty() {
                self.commit_configuration()?;
            } else {
                self.stage = Stage::AwaitingConsent;
            }
        }
        Ok(report)
    }

    pub fn pending_consents(&self) -> &[ConsentId] {
        &self.pending
    }

    pub fn record_consent(&mut self, id: ConsentId, granted: bool) -> Result<(), ControllerError> {
        self.require_stage(Stage::AwaitingConsent, "record consent")?;
        let Some(index) = self.pending.iter().position(|p| *p == id) else {
            return Err(ControllerError::AlreadyDecided(id));
        };
        self.pending.remove(index);
        self.consent.record(id, granted);
        debug!("consent {} recorded as {}", id.as_str(), granted);
        Ok(())
    }

    /// Persists consent then the first-run marker. On failure the controller
    /// stays where it was so the caller can retry.
    pub fn commit_configuration(&mut self) -> Result<(), ControllerError> {
        match self.stage {
            Stage::Scanning => {}
            Stage::AwaitingConsent if self.pending.is_empty() => {}
            Stage::AwaitingConsent => {
                return Err(ControllerError::InvalidTransition {
                    action: "commit configuration",
                    stage: "consent decisions are outstanding",
                });
            }
            other => {
                return Err(ControllerError::InvalidTransition {
                    action: "commit configuration",
                    stage: other.describe(),
                });
            }
        }
        self.store.save_consent(&self.consent)?;
        self.store.mark_first_run_complete()?;
        self.stage = Stage::Configured;
        self.first_run = false;
        info!("configuration committed");
        Ok(())
    }

    /// Steady-state consent toggle, persisted before it takes effect.
    pub fn set_consent(&mut self, id: ConsentId, granted: bool) -> Result<(), ControllerError> {
        self.require_stage(Stage::Configured, "change consent")?;
        let mut updated = self.store.load_consent()?;
        updated.record(id, granted);
        self.store.save_consent(&updated)?;
        self.consent = updated;
        info!("consent {} set to {}", id.as_str(), granted);
        Ok(())
    }

    pub fn consent(&self) -> &ConsentState {
        &self.consent
    }

    /// Once configured the store is authoritative: another process (the CLI,
    /// a second server) may have revoked a decision since boot. Decisions
    /// collected during setup stay in memory until committed.
    pub fn refresh_consent(&mut self) -> Result<ConsentState, ControllerError> {
        if self.stage == Stage::Configured {
            self.consent = self.store.load_consent()?;
        }
        Ok(self.consent)
    }

    pub async fn mode(&self) -> Mode {
        derive_mode(&self.engine.services().await)
    }

    pub async fn state(&self) -> ControllerState {
        match self.stage {
            Stage::Unconfigured => ControllerState::Unconfigured,
            Stage::Scanning => ControllerState::Scanning,
            Stage::AwaitingConsent => ControllerState::AwaitingConsent,
            Stage::Configured => ControllerState::Configured(self.mode().await),
        }
    }

    pub async fn system_state(&self) -> SystemState {
        let services = self.engine.services().await;
        SystemState {
            first_run: self.first_run,
            wizard_mode: matches!(self.stage, Stage::Scanning | Stage::AwaitingConsent),
            mode: derive_mode(&services),
            services,
            consent: self.consent,
        }
    }

    fn require_stage(&self, stage: Stage, action: &'static str) -> Result<(), ControllerError> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(ControllerError::InvalidTransition {
                action,
                stage: self.stage.describe(),
            })
        }
    }
}
