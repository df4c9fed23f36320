use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use probe_adapter::{
    CloudKeysProbe, INTERNET_TARGETS, KeyAuth, KeyProbe, ModelsProbe, Probe, ProbeOutcome, TcpProbe,
};
use serde::Serialize;
use steward_store::{AiSettings, ProviderKind, SettingsStore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    Local,
    FreeTier,
    Paid,
    Fallback,
}

/// How a candidate proves it is usable.
#[derive(Debug, Clone)]
pub enum Availability {
    /// `GET {base_url}/models` lists at least one model.
    ModelList,
    /// A key is configured (vault first, then `env`) and `url` accepts it.
    ApiKey {
        url: String,
        auth: KeyAuth,
        env: &'static str,
        headers: Vec<(&'static str, &'static str)>,
    },
    /// Any of the targets accepts a TCP connection.
    Connectivity(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub priority: u8,
    pub tier: ProviderTier,
    pub base_url: Option<String>,
    pub availability: Availability,
}

fn keyed(
    kind: ProviderKind,
    priority: u8,
    tier: ProviderTier,
    base_url: &str,
    check_url: &str,
    auth: KeyAuth,
    env: &'static str,
) -> ProviderSpec {
    ProviderSpec {
        kind,
        priority,
        tier,
        base_url: Some(base_url.to_string()),
        availability: Availability::ApiKey {
            url: check_url.to_string(),
            auth,
            env,
            headers: Vec::new(),
        },
    }
}

/// Local first, then free-tier cloud, then paid cloud, then plain internet.
pub fn default_catalog() -> Vec<ProviderSpec> {
    let mut anthropic = keyed(
        ProviderKind::Anthropic,
        7,
        ProviderTier::Paid,
        "https://api.anthropic.com/v1",
        "https://api.anthropic.com/v1/models",
        KeyAuth::Header("x-api-key"),
        "ANTHROPIC_API_KEY",
    );
    if let Availability::ApiKey { headers, .. } = &mut anthropic.availability {
        headers.push(("anthropic-version", "2023-06-01"));
    }
    vec![
        ProviderSpec {
            kind: ProviderKind::LmStudio,
            priority: 1,
            tier: ProviderTier::Local,
            base_url: Some("http://127.0.0.1:1234/v1".to_string()),
            availability: Availability::ModelList,
        },
        ProviderSpec {
            kind: ProviderKind::Ollama,
            priority: 2,
            tier: ProviderTier::Local,
            base_url: Some("http://127.0.0.1:11434/v1".to_string()),
            availability: Availability::ModelList,
        },
        keyed(
            ProviderKind::Gemini,
            3,
            ProviderTier::FreeTier,
            "https://generativelanguage.googleapis.com/v1beta",
            "https://generativelanguage.googleapis.com/v1beta/models",
            KeyAuth::Query("key"),
            "GEMINI_API_KEY",
        ),
        keyed(
            ProviderKind::OpenRouter,
            4,
            ProviderTier::FreeTier,
            "https://openrouter.ai/api/v1",
            "https://openrouter.ai/api/v1/auth/key",
            KeyAuth::Bearer,
            "OPENROUTER_API_KEY",
        ),
        keyed(
            ProviderKind::HuggingFace,
            5,
            ProviderTier::FreeTier,
            "https://router.huggingface.co/v1",
            "https://huggingface.co/api/whoami-v2",
            KeyAuth::Bearer,
            "HF_TOKEN",
        ),
        keyed(
            ProviderKind::OpenAi,
            6,
            ProviderTier::Paid,
            "https://api.openai.com/v1",
            "https://api.openai.com/v1/models",
            KeyAuth::Bearer,
            "OPENAI_API_KEY",
        ),
        anthropic,
        ProviderSpec {
            kind: ProviderKind::Internet,
            priority: 8,
            tier: ProviderTier::Fallback,
            base_url: None,
            availability: Availability::Connectivity(
                INTERNET_TARGETS.iter().map(|t| t.to_string()).collect(),
            ),
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct AiProvider {
    pub kind: ProviderKind,
    pub name: String,
    pub tier: ProviderTier,
    pub available: bool,
    pub url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub priority: u8,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDefaults {
    pub model: Option<String>,
    pub context_window: u32,
    pub temperature: f32,
}

pub fn provider_defaults(kind: ProviderKind, detected_models: &[String]) -> ProviderDefaults {
    let fixed = |model: &str, context_window: u32| ProviderDefaults {
        model: Some(model.to_string()),
        context_window,
        temperature: 0.7,
    };
    match kind {
        ProviderKind::LmStudio => ProviderDefaults {
            model: Some(
                detected_models
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "local-model".to_string()),
            ),
            context_window: 8192,
            temperature: 0.7,
        },
        ProviderKind::Ollama => ProviderDefaults {
            model: Some(
                detected_models
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "llama3.1".to_string()),
            ),
            context_window: 8192,
            temperature: 0.7,
        },
        ProviderKind::Gemini => fixed("gemini-1.5-flash", 1_000_000),
        ProviderKind::OpenRouter => fixed("meta-llama/llama-3.1-8b-instruct:free", 131_072),
        ProviderKind::HuggingFace => fixed("mistralai/Mistral-7B-Instruct-v0.3", 32_768),
        ProviderKind::OpenAi => fixed("gpt-4o-mini", 128_000),
        ProviderKind::Anthropic => fixed("claude-3-5-haiku-latest", 200_000),
        ProviderKind::Internet => ProviderDefaults {
            model: None,
            context_window: 4096,
            temperature: 0.3,
        },
    }
}

pub fn display_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::LmStudio => "LM Studio",
        ProviderKind::Ollama => "Ollama",
        ProviderKind::Gemini => "Google Gemini",
        ProviderKind::OpenRouter => "OpenRouter",
        ProviderKind::HuggingFace => "Hugging Face",
        ProviderKind::OpenAi => "OpenAI",
        ProviderKind::Anthropic => "Anthropic",
        ProviderKind::Internet => "Internet (no model)",
    }
}

/// Lowest priority value among available providers.
pub fn select(providers: &[AiProvider]) -> Option<&AiProvider> {
    providers
        .iter()
        .filter(|p| p.available)
        .min_by_key(|p| p.priority)
}

fn resolve_key(store: &SettingsStore, kind: ProviderKind, env_name: &str) -> Option<String> {
    match store.get_secret(&kind.secret_ref()) {
        Ok(Some(key)) => return Some(key),
        Ok(None) => {}
        Err(e) => warn!("could not read stored key for {}: {}", kind.as_str(), e),
    }
    env::var(env_name).ok().filter(|v| !v.trim().is_empty())
}

pub struct ProviderSelector {
    store: SettingsStore,
    timeout: Duration,
    catalog: Vec<ProviderSpec>,
}

impl ProviderSelector {
    pub fn new(store: SettingsStore, timeout: Duration) -> Self {
        Self::with_catalog(store, timeout, default_catalog())
    }

    pub fn with_catalog(store: SettingsStore, timeout: Duration, catalog: Vec<ProviderSpec>) -> Self {
        Self {
            store,
            timeout,
            catalog,
        }
    }

    /// Probes every candidate concurrently. The result covers the whole
    /// catalog, available or not, sorted by priority.
    pub async fn probe_all(&self) -> Vec<AiProvider> {
        let mut tasks = JoinSet::new();
        for spec in &self.catalog {
            let spec = spec.clone();
            let api_key = match &spec.availability {
                Availability::ApiKey { env, .. } => resolve_key(&self.store, spec.kind, env),
                _ => None,
            };
            let timeout = self.timeout;
            tasks.spawn(async move { probe_candidate(spec, api_key, timeout).await });
        }

        let mut providers = Vec::with_capacity(self.catalog.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!("provider probe task failed: {}", e),
            }
        }
        providers.sort_by_key(|p| p.priority);
        providers
    }

    pub async fn detect_providers(&self) -> Vec<AiProvider> {
        self.probe_all()
            .await
            .into_iter()
            .filter(|p| p.available)
            .collect()
    }

    /// Re-detects from scratch and persists the best provider with its
    /// defaults. With nothing available the stored selection is cleared.
    pub async fn self_configure(&self) -> steward_store::Result<Option<AiProvider>> {
        let providers = self.detect_providers().await;
        let chosen = select(&providers).cloned();
        let mut settings = self.store.load()?;
        settings.ai = match &chosen {
            Some(provider) => {
                let defaults = provider_defaults(provider.kind, &provider.models);
                info!(
                    "self-configured provider {} (priority {}, model {})",
                    provider.kind.as_str(),
                    provider.priority,
                    defaults.model.as_deref().unwrap_or("<none>")
                );
                AiSettings {
                    provider: Some(provider.kind),
                    base_url: provider.url.clone(),
                    model: defaults.model,
                    context_window: Some(defaults.context_window),
                    temperature: Some(defaults.temperature),
                    self_configured: true,
                    configured_at: Some(Utc::now()),
                }
            }
            None => {
                warn!("no AI provider available; clearing stored selection");
                AiSettings::default()
            }
        };
        self.store.save(&settings)?;
        Ok(chosen)
    }

    /// Keys are validated concurrently, each within 80% of the probe timeout
    /// so the aggregate settles before the engine gives up on it.
    pub fn key_probes(&self) -> Vec<KeyProbe> {
        let per_key = self.timeout.mul_f64(0.8);
        self.catalog
            .iter()
            .filter_map(|spec| {
                let Availability::ApiKey {
                    url,
                    auth,
                    env,
                    headers,
                } = &spec.availability
                else {
                    return None;
                };
                let key = resolve_key(&self.store, spec.kind, env)?;
                let probe = headers.iter().fold(
                    KeyProbe::new(spec.kind.as_str(), url.clone(), auth.clone(), key, per_key),
                    |probe, &(name, value)| probe.with_header(name, value),
                );
                Some(probe)
            })
            .collect()
    }
}

async fn probe_candidate(spec: ProviderSpec, api_key: Option<String>, timeout: Duration) -> AiProvider {
    let outcome = match &spec.availability {
        Availability::ModelList => match spec.base_url.as_deref() {
            Some(base) => ModelsProbe::new([base], timeout).probe().await,
            None => ProbeOutcome::unreachable("no base URL"),
        },
        Availability::ApiKey {
            url, auth, headers, ..
        } => match api_key.as_deref() {
            Some(key) => {
                let probe = headers.iter().fold(
                    KeyProbe::new(spec.kind.as_str(), url.clone(), auth.clone(), key, timeout),
                    |probe, &(name, value)| probe.with_header(name, value),
                );
                probe.probe().await
            }
            None => ProbeOutcome::not_ready("no API key configured"),
        },
        Availability::Connectivity(targets) => {
            TcpProbe::new(targets.iter().cloned(), timeout).probe().await
        }
    };
    debug!("provider {} -> {:?}", spec.kind.as_str(), outcome);
    AiProvider {
        kind: spec.kind,
        name: display_name(spec.kind).to_string(),
        tier: spec.tier,
        available: outcome.is_ready(),
        url: spec.base_url,
        api_key,
        models: outcome.models().to_vec(),
        priority: spec.priority,
        detail: outcome.detail().to_string(),
    }
}

/// Cloud-keys check. Keys are resolved on every run so a key added after
/// startup is picked up by the next diagnosis.
pub struct ConfiguredKeysProbe {
    selector: ProviderSelector,
}

impl ConfiguredKeysProbe {
    pub fn new(store: SettingsStore, timeout: Duration) -> Self {
        Self {
            selector: ProviderSelector::new(store, timeout),
        }
    }

    #[cfg(test)]
    fn with_catalog(store: SettingsStore, timeout: Duration, catalog: Vec<ProviderSpec>) -> Self {
        Self {
            selector: ProviderSelector::with_catalog(store, timeout, catalog),
        }
    }
}

#[async_trait]
impl Probe for ConfiguredKeysProbe {
    fn target(&self) -> String {
        "configured provider keys".to_string()
    }

    async fn probe(&self) -> ProbeOutcome {
        CloudKeysProbe::new(self.selector.key_probes()).probe().await
    }
}
