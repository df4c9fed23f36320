use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_store::{ConsentId, ConsentState};
use uuid::Uuid;

/// Number of `error` checks at which a settings reset joins the plan.
pub const RESET_ERROR_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckId {
    Inference,
    KnowledgeStore,
    Backend,
    Internet,
    CloudKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    Optional,
}

impl CheckId {
    /// Registration order. Reports always list checks in this order.
    pub const ALL: [CheckId; 5] = [
        Self::Inference,
        Self::KnowledgeStore,
        Self::Backend,
        Self::Internet,
        Self::CloudKeys,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::KnowledgeStore => "knowledge_store",
            Self::Backend => "backend",
            Self::Internet => "internet",
            Self::CloudKeys => "cloud_keys",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Inference => "AI inference endpoint",
            Self::KnowledgeStore => "Knowledge store",
            Self::Backend => "Backend API",
            Self::Internet => "Internet connectivity",
            Self::CloudKeys => "Cloud provider keys",
        }
    }

    pub fn criticality(self) -> Criticality {
        match self {
            Self::Inference | Self::Backend | Self::Internet => Criticality::Critical,
            Self::KnowledgeStore | Self::CloudKeys => Criticality::Optional,
        }
    }

    /// Whether FULL mode requires this dependency to be running and ready.
    pub fn gates_full(self) -> bool {
        matches!(self, Self::Inference | Self::Backend)
    }

    pub fn remediations(self) -> &'static [RemediationKind] {
        match self {
            Self::Inference => &[RemediationKind::StartInference],
            Self::KnowledgeStore => &[RemediationKind::StartKnowledgeStore],
            Self::Backend => &[RemediationKind::AwaitBackend],
            Self::Internet | Self::CloudKeys => &[],
        }
    }

    pub fn manual_hint(self) -> &'static str {
        match self {
            Self::Inference => "Start LM Studio or Ollama and load a model.",
            Self::KnowledgeStore => "Start the knowledge store (docker compose up -d).",
            Self::Backend => "Start the backend API server and check its port.",
            Self::Internet => "Check the network connection, proxy and firewall settings.",
            Self::CloudKeys => "Add a provider API key with `steward provider set-key`.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
    Pending,
}

impl CheckStatus {
    pub fn is_failing(self) -> bool {
        matches!(self, Self::Warning | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticCheck {
    pub id: CheckId,
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticCheck {
    pub fn new(id: CheckId, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            id,
            name: id.name().to_string(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pending(id: CheckId) -> Self {
        Self::new(id, CheckStatus::Pending, "not checked yet")
    }
}

/// Aggregate result of one diagnosis pass. Every derived field is computed
/// in [`DiagnosticReport::new`], so it cannot disagree with `checks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    timestamp: DateTime<Utc>,
    issues_found: bool,
    checks: Vec<DiagnosticCheck>,
    summary: String,
    recommendation: Option<String>,
}

impl DiagnosticReport {
    pub fn new(checks: Vec<DiagnosticCheck>) -> Self {
        Self {
            timestamp: Utc::now(),
            issues_found: checks.iter().any(|c| c.status == CheckStatus::Error),
            summary: summarize(&checks),
            recommendation: recommend(&checks),
            checks,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn issues_found(&self) -> bool {
        self.issues_found
    }

    pub fn checks(&self) -> &[DiagnosticCheck] {
        &self.checks
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn recommendation(&self) -> Option<&str> {
        self.recommendation.as_deref()
    }

    pub fn check(&self, id: CheckId) -> Option<&DiagnosticCheck> {
        self.checks.iter().find(|c| c.id == id)
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        count(&self.checks, status)
    }
}

fn count(checks: &[DiagnosticCheck], status: CheckStatus) -> usize {
    checks.iter().filter(|c| c.status == status).count()
}

pub fn summarize(checks: &[DiagnosticCheck]) -> String {
    let errors = count(checks, CheckStatus::Error);
    let warnings = count(checks, CheckStatus::Warning);
    let pending = count(checks, CheckStatus::Pending);
    let total = checks.len();
    let mut summary = if errors == 0 && warnings == 0 {
        format!("all {total} checks passed")
    } else {
        format!("{errors} error(s), {warnings} warning(s) across {total} checks")
    };
    if pending > 0 {
        summary.push_str(&format!(", {pending} pending"));
    }
    summary
}

pub fn recommend(checks: &[DiagnosticCheck]) -> Option<String> {
    [CheckStatus::Error, CheckStatus::Warning]
        .into_iter()
        .find_map(|status| checks.iter().find(|c| c.status == status))
        .map(|c| c.id.manual_hint().to_string())
}

/// Last observed state of one registered dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub ready: bool,
    pub last_check: DateTime<Utc>,
    pub error: Option<String>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            running: false,
            ready: false,
            last_check: DateTime::<Utc>::UNIX_EPOCH,
            error: None,
        }
    }
}

impl ServiceStatus {
    /// Applies a probe observation. `last_check` never moves backwards.
    pub fn observe(&mut self, running: bool, ready: bool, at: DateTime<Utc>, error: Option<String>) {
        self.running = running;
        self.ready = ready;
        self.last_check = self.last_check.max(at);
        self.error = error;
    }
}

pub type Services = BTreeMap<CheckId, ServiceStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Limited,
    Full,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Limited => "LIMITED",
            Self::Full => "FULL",
        }
    }
}

/// FULL only when every gating dependency has a status and is running and
/// ready. A dependency that was never observed counts as down.
pub fn derive_mode(services: &Services) -> Mode {
    let all_ready = CheckId::ALL
        .into_iter()
        .filter(|id| id.gates_full())
        .all(|id| services.get(&id).is_some_and(|s| s.running && s.ready));
    if all_ready { Mode::Full } else { Mode::Limited }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    StartInference,
    StartKnowledgeStore,
    AwaitBackend,
    ResetSettings,
}

impl RemediationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartInference => "start_inference",
            Self::StartKnowledgeStore => "start_knowledge_store",
            Self::AwaitBackend => "await_backend",
            Self::ResetSettings => "reset_settings",
        }
    }

    pub fn risk(self) -> RiskTier {
        match self {
            Self::StartInference | Self::AwaitBackend => RiskTier::Low,
            Self::StartKnowledgeStore => RiskTier::Medium,
            Self::ResetSettings => RiskTier::High,
        }
    }

    pub fn consent(self) -> Option<ConsentId> {
        match self {
            Self::StartInference | Self::StartKnowledgeStore => Some(ConsentId::AutoStartServices),
            Self::AwaitBackend => None,
            Self::ResetSettings => Some(ConsentId::SettingsReset),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::StartInference => "Start the local AI inference service",
            Self::StartKnowledgeStore => "Start the knowledge store",
            Self::AwaitBackend => "Wait for the backend API and re-verify it",
            Self::ResetSettings => "Reset stored settings to defaults",
        }
    }

    /// Actions the health monitor may run on its own.
    pub fn is_service_start(self) -> bool {
        matches!(self, Self::StartInference | Self::StartKnowledgeStore)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    pub id: Uuid,
    pub kind: RemediationKind,
    pub description: String,
    pub risk: RiskTier,
    pub consent: Option<ConsentId>,
}

impl RepairAction {
    pub fn new(kind: RemediationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            description: kind.description().to_string(),
            risk: kind.risk(),
            consent: kind.consent(),
        }
    }
}

/// Remediation kinds for a check list, in check order, each kind once.
/// A settings reset is appended last once enough checks are in `error`.
pub fn planned_kinds(checks: &[DiagnosticCheck]) -> Vec<RemediationKind> {
    let mut kinds = Vec::new();
    for check in checks.iter().filter(|c| c.status.is_failing()) {
        for kind in check.id.remediations() {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
    }
    if count(checks, CheckStatus::Error) >= RESET_ERROR_THRESHOLD {
        kinds.push(RemediationKind::ResetSettings);
    }
    kinds
}

/// Overall risk of repairing `checks`: the highest tier among the planned
/// remediations, `low` when nothing needs doing.
pub fn risk(checks: &[DiagnosticCheck]) -> RiskTier {
    planned_kinds(checks)
        .into_iter()
        .map(RemediationKind::risk)
        .max()
        .unwrap_or(RiskTier::Low)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairPlan {
    id: Uuid,
    timestamp: DateTime<Utc>,
    report: DiagnosticReport,
    actions: Vec<RepairAction>,
    estimated_risk: RiskTier,
    explanation: String,
}

pub fn create_repair_plan(report: DiagnosticReport) -> RepairPlan {
    let kinds = planned_kinds(report.checks());
    RepairPlan::from_kinds(report, kinds)
}

impl RepairPlan {
    /// Plan restricted to service starts, used by the health monitor.
    pub fn auto_start(report: DiagnosticReport) -> Self {
        let kinds = planned_kinds(report.checks())
            .into_iter()
            .filter(|k| k.is_service_start())
            .collect();
        Self::from_kinds(report, kinds)
    }

    fn from_kinds(report: DiagnosticReport, kinds: Vec<RemediationKind>) -> Self {
        let actions: Vec<RepairAction> = kinds.into_iter().map(RepairAction::new).collect();
        let estimated_risk = actions
            .iter()
            .map(|a| a.risk)
            .max()
            .unwrap_or(RiskTier::Low);
        let explanation = explain(&report, &actions, estimated_risk);
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            report,
            actions,
            estimated_risk,
            explanation,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn report(&self) -> &DiagnosticReport {
        &self.report
    }

    pub fn actions(&self) -> &[RepairAction] {
        &self.actions
    }

    pub fn estimated_risk(&self) -> RiskTier {
        self.estimated_risk
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Binds the plan to the consent the user holds right now. Plan content
    /// never depends on consent; only what may run does.
    pub fn approve(self, consent: &ConsentState) -> ApprovedPlan {
        let gates = self
            .actions
            .iter()
            .map(|action| match action.consent {
                Some(id) if !consent.granted(id) => ActionGate::Withheld(id),
                _ => ActionGate::Approved,
            })
            .collect();
        ApprovedPlan { plan: self, gates }
    }
}

fn explain(report: &DiagnosticReport, actions: &[RepairAction], risk: RiskTier) -> String {
    if actions.is_empty() {
        return format!("No automatic repairs available ({}).", report.summary());
    }
    let steps = actions
        .iter()
        .map(|a| a.description.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let mut text = format!(
        "{}. Proposed {} action(s): {}. Overall risk: {}.",
        report.summary(),
        actions.len(),
        steps,
        risk.as_str()
    );
    if actions.iter().any(|a| a.kind == RemediationKind::ResetSettings) {
        text.push_str(&format!(
            " {} or more checks failed, so a settings reset is included.",
            RESET_ERROR_THRESHOLD
        ));
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "gate", content = "consent", rename_all = "snake_case")]
pub enum ActionGate {
    Approved,
    Withheld(ConsentId),
}

/// A plan whose actions have each been cleared or withheld against the
/// consent state. Only the executor consumes this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedPlan {
    plan: RepairPlan,
    gates: Vec<ActionGate>,
}

impl ApprovedPlan {
    pub fn plan(&self) -> &RepairPlan {
        &self.plan
    }

    pub fn steps(&self) -> impl Iterator<Item = (&RepairAction, ActionGate)> {
        self.plan.actions.iter().zip(self.gates.iter().copied())
    }

    pub fn approved_count(&self) -> usize {
        self.gates
            .iter()
            .filter(|g| **g == ActionGate::Approved)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: Uuid,
    pub kind: RemediationKind,
    pub description: String,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionRecord {
    pub fn withheld(action: &RepairAction, consent: ConsentId) -> Self {
        Self {
            action_id: action.id,
            kind: action.kind,
            description: action.description.clone(),
            success: false,
            skipped: true,
            error: Some(format!("consent '{}' not granted", consent.as_str())),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairResult {
    plan_id: Uuid,
    success: bool,
    actions_taken: Vec<ActionRecord>,
    verification: DiagnosticReport,
}

impl RepairResult {
    pub fn new(plan_id: Uuid, actions_taken: Vec<ActionRecord>, verification: DiagnosticReport) -> Self {
        Self {
            plan_id,
            success: !verification.issues_found(),
            actions_taken,
            verification,
        }
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn actions_taken(&self) -> &[ActionRecord] {
        &self.actions_taken
    }

    pub fn verification(&self) -> &DiagnosticReport {
        &self.verification
    }
}
