use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SETTINGS_VERSION: u32 = 1;
const SETTINGS_FILE: &str = "settings.json";
const CONSENT_FILE: &str = "consent.json";
const MARKER_FILE: &str = "state.json";
const SECRETS_DIR: &str = "secrets";
const SECRETS_FILE: &str = "secrets.enc.json";
const SECRETS_KEY_FILE: &str = "secrets.key";
const HOME_ENV: &str = "STEWARD_HOME";

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8234";
const DEFAULT_KNOWLEDGE_STORE_URL: &str = "http://127.0.0.1:3003";
const DEFAULT_INFERENCE_URLS: [&str; 6] = [
    "http://127.0.0.1:1234/v1",
    "http://127.0.0.1:1235/v1",
    "http://127.0.0.1:8080/v1",
    "http://127.0.0.1:5000/v1",
    "http://127.0.0.1:8000/v1",
    "http://127.0.0.1:11434/v1",
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot resolve a configuration directory")]
    NoHome,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("secret vault error: {0}")]
    Vault(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistent orchestrator settings. Unknown or missing fields fall back to
/// defaults so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    pub endpoints: Endpoints,
    pub launch: LaunchSettings,
    pub probe_timeout_ms: u64,
    pub action_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub auto_recovery: bool,
    pub ai: AiSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub inference_urls: Vec<String>,
    pub backend_url: String,
    pub knowledge_store_url: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// Program plus arguments that starts the local inference server.
    pub inference_command: Option<Vec<String>>,
    pub knowledge_store_compose: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub provider: Option<ProviderKind>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub context_window: Option<u32>,
    pub temperature: Option<f32>,
    pub self_configured: bool,
    pub configured_at: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            endpoints: Endpoints::default(),
            launch: LaunchSettings::default(),
            probe_timeout_ms: 3_000,
            action_timeout_secs: 60,
            monitor_interval_secs: 30,
            auto_recovery: false,
            ai: AiSettings::default(),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            inference_urls: DEFAULT_INFERENCE_URLS.iter().map(|s| s.to_string()).collect(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            knowledge_store_url: DEFAULT_KNOWLEDGE_STORE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    LmStudio,
    Ollama,
    Gemini,
    OpenRouter,
    HuggingFace,
    OpenAi,
    Anthropic,
    Internet,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        Self::LmStudio,
        Self::Ollama,
        Self::Gemini,
        Self::OpenRouter,
        Self::HuggingFace,
        Self::OpenAi,
        Self::Anthropic,
        Self::Internet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LmStudio => "lm_studio",
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
            Self::HuggingFace => "huggingface",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Internet => "internet",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    /// Secret vault key holding this provider's API key.
    pub fn secret_ref(self) -> String {
        format!("provider.{}.api_key", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentId {
    AutoStartServices,
    SettingsReset,
}

impl ConsentId {
    pub const ALL: [ConsentId; 2] = [Self::AutoStartServices, Self::SettingsReset];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoStartServices => "auto_start_services",
            Self::SettingsReset => "settings_reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }

    pub fn prompt(self) -> &'static str {
        match self {
            Self::AutoStartServices => {
                "Allow starting local services (inference server, knowledge store) on your behalf?"
            }
            Self::SettingsReset => {
                "Allow resetting stored settings to defaults when several checks fail at once?"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub granted: bool,
    pub decided_at: DateTime<Utc>,
}

/// One optional decision per known consent item. `None` means the user has
/// not been asked yet, which never counts as granted.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentState {
    pub auto_start_services: Option<ConsentDecision>,
    pub settings_reset: Option<ConsentDecision>,
}

impl ConsentState {
    pub fn decision(&self, id: ConsentId) -> Option<ConsentDecision> {
        match id {
            ConsentId::AutoStartServices => self.auto_start_services,
            ConsentId::SettingsReset => self.settings_reset,
        }
    }

    pub fn granted(&self, id: ConsentId) -> bool {
        self.decision(id).is_some_and(|d| d.granted)
    }

    pub fn record(&mut self, id: ConsentId, granted: bool) {
        let decision = Some(ConsentDecision {
            granted,
            decided_at: Utc::now(),
        });
        match id {
            ConsentId::AutoStartServices => self.auto_start_services = decision,
            ConsentId::SettingsReset => self.settings_reset = decision,
        }
    }

    pub fn undecided(&self) -> Vec<ConsentId> {
        ConsentId::ALL
            .into_iter()
            .filter(|id| self.decision(*id).is_none())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMarker {
    pub first_run_complete: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    home_dir: PathBuf,
}

impl SettingsStore {
    pub fn new(home_override: Option<PathBuf>) -> Result<Self> {
        let home_dir = if let Some(path) = home_override {
            path
        } else if let Ok(v) = env::var(HOME_ENV) {
            PathBuf::from(v)
        } else {
            dirs::config_dir().ok_or(StoreError::NoHome)?.join("steward")
        };
        create_dir(&home_dir)?;
        Ok(Self { home_dir })
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.home_dir.join(SETTINGS_FILE)
    }

    fn consent_path(&self) -> PathBuf {
        self.home_dir.join(CONSENT_FILE)
    }

    fn marker_path(&self) -> PathBuf {
        self.home_dir.join(MARKER_FILE)
    }

    fn secrets_dir(&self) -> PathBuf {
        self.home_dir.join(SECRETS_DIR)
    }

    /// Loads settings, writing defaults on first use.
    pub fn load(&self) -> Result<Settings> {
        let path = self.settings_path();
        if !path.exists() {
            let settings = Settings::default();
            self.save(&settings)?;
            return Ok(settings);
        }
        let mut settings: Settings = read_json(&path)?;
        if settings.endpoints.inference_urls.is_empty() {
            settings.endpoints.inference_urls = Endpoints::default().inference_urls;
        }
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        write_json(&self.settings_path(), settings)
    }

    /// Overwrites stored settings with defaults. Consent and the first-run
    /// marker are left untouched.
    pub fn reset(&self) -> Result<Settings> {
        let settings = Settings::default();
        self.save(&settings)?;
        debug!("settings reset to defaults at {}", self.settings_path().display());
        Ok(settings)
    }

    pub fn load_consent(&self) -> Result<ConsentState> {
        let path = self.consent_path();
        if !path.exists() {
            return Ok(ConsentState::default());
        }
        read_json(&path)
    }

    pub fn save_consent(&self, consent: &ConsentState) -> Result<()> {
        write_json(&self.consent_path(), consent)
    }

    pub fn load_marker(&self) -> Result<RunMarker> {
        let path = self.marker_path();
        if !path.exists() {
            return Ok(RunMarker::default());
        }
        read_json(&path)
    }

    pub fn mark_first_run_complete(&self) -> Result<RunMarker> {
        let marker = RunMarker {
            first_run_complete: true,
            completed_at: Some(Utc::now()),
        };
        write_json(&self.marker_path(), &marker)?;
        Ok(marker)
    }

    pub fn put_secret(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.load_secrets()?;
        map.insert(key.to_string(), self.seal(value)?);
        write_json(&self.secrets_dir().join(SECRETS_FILE), &map)
    }

    pub fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let map = self.load_secrets()?;
        match map.get(key) {
            Some(sealed) => Ok(Some(self.open(sealed)?)),
            None => Ok(None),
        }
    }

    fn load_secrets(&self) -> Result<BTreeMap<String, String>> {
        let path = self.secrets_dir().join(SECRETS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        read_json(&path)
    }

    fn vault_key(&self) -> Result<[u8; 32]> {
        let path = self.secrets_dir().join(SECRETS_KEY_FILE);
        if path.exists() {
            let raw = fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            return raw.as_slice().try_into().map_err(|_| {
                StoreError::Vault(format!("invalid key length at {}", path.display()))
            });
        }
        create_dir(&self.secrets_dir())?;
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        fs::write(&path, key).map_err(|source| StoreError::Io { path, source })?;
        Ok(key)
    }

    fn seal(&self, plaintext: &str) -> Result<String> {
        let key = self.vault_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| StoreError::Vault("encryption failed".to_string()))?;
        Ok(format!("{}:{}", B64.encode(nonce), B64.encode(ciphertext)))
    }

    fn open(&self, sealed: &str) -> Result<String> {
        let (nonce, ciphertext) = sealed
            .split_once(':')
            .ok_or_else(|| StoreError::Vault("malformed sealed secret".to_string()))?;
        let nonce = B64
            .decode(nonce)
            .map_err(|e| StoreError::Vault(e.to_string()))?;
        let ciphertext = B64
            .decode(ciphertext)
            .map_err(|e| StoreError::Vault(e.to_string()))?;
        if nonce.len() != 12 {
            return Err(StoreError::Vault("malformed nonce".to_string()));
        }
        let key = self.vault_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| StoreError::Vault("decryption failed".to_string()))?;
        String::from_utf8(plain).map_err(|_| StoreError::Vault("secret is not utf-8".to_string()))
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let raw = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, raw).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}
