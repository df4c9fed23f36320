use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use probe_adapter::{HealthProbe, ModelsProbe, Probe};
use repair_guard::RemediationKind;
use steward_store::{Settings, SettingsStore};
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::executor::Remediator;

pub const BACKEND_HEALTH_PATH: &str = "/api/health";
pub const KNOWLEDGE_STORE_HEALTH_PATH: &str = "/health";

const INFERENCE_STARTUP: Duration = Duration::from_secs(30);
const KNOWLEDGE_STORE_STARTUP: Duration = Duration::from_secs(45);
const BACKEND_GRACE: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Starts local services and waits for them to come up.
#[derive(Debug, Clone)]
pub struct ServiceLauncher {
    store: SettingsStore,
    inference_startup: Duration,
    knowledge_store_startup: Duration,
    backend_grace: Duration,
}

impl ServiceLauncher {
    pub fn new(store: SettingsStore) -> Self {
        Self {
            store,
            inference_startup: INFERENCE_STARTUP,
            knowledge_store_startup: KNOWLEDGE_STORE_STARTUP,
            backend_grace: BACKEND_GRACE,
        }
    }

    #[cfg(test)]
    fn with_windows(store: SettingsStore, window: Duration) -> Self {
        Self {
            store,
            inference_startup: window,
            knowledge_store_startup: window,
            backend_grace: window,
        }
    }

    fn probe_timeout(settings: &Settings) -> Duration {
        Duration::from_millis(settings.probe_timeout_ms)
    }

    async fn start_inference(&self) -> Result<()> {
        let settings = self.store.load()?;
        let probe = ModelsProbe::new(&settings.endpoints.inference_urls, Self::probe_timeout(&settings));
        if probe.probe().await.is_ready() {
            info!("inference endpoint already serving a model");
            return Ok(());
        }
        let command = match settings.launch.inference_command.clone() {
            Some(command) if !command.is_empty() => command,
            _ => discover_lm_studio()
                .map(|exe| vec![exe.display().to_string()])
                .ok_or_else(|| {
                    anyhow!(
                        "no inference launch command configured and LM Studio was not found; set launch.inference_command in {}",
                        self.store.settings_path().display()
                    )
                })?,
        };
        spawn_detached(&command)?;
        if wait_until_ready(&probe, self.inference_startup).await {
            Ok(())
        } else {
            bail!(
                "inference server did not serve a model within {}s",
                self.inference_startup.as_secs()
            )
        }
    }

    async fn start_knowledge_store(&self) -> Result<()> {
        let settings = self.store.load()?;
        let probe = HealthProbe::new(
            &settings.endpoints.knowledge_store_url,
            KNOWLEDGE_STORE_HEALTH_PATH,
            Self::probe_timeout(&settings),
        );
        if probe.probe().await.is_ready() {
            return Ok(());
        }
        let compose = settings
            .launch
            .knowledge_store_compose
            .clone()
            .ok_or_else(|| anyhow!("no knowledge store compose file configured"))?;
        compose_up(&compose).await?;
        if wait_until_ready(&probe, self.knowledge_store_startup).await {
            Ok(())
        } else {
            bail!(
                "knowledge store did not become healthy within {}s",
                self.knowledge_store_startup.as_secs()
            )
        }
    }

    async fn await_backend(&self) -> Result<()> {
        let settings = self.store.load()?;
        let probe = HealthProbe::new(
            &settings.endpoints.backend_url,
            BACKEND_HEALTH_PATH,
            Self::probe_timeout(&settings),
        );
        if wait_until_ready(&probe, self.backend_grace).await {
            Ok(())
        } else {
            bail!(
                "backend at {} still unhealthy after {}s",
                settings.endpoints.backend_url,
                self.backend_grace.as_secs()
            )
        }
    }
}

#[async_trait]
impl Remediator for ServiceLauncher {
    async fn remediate(&self, kind: RemediationKind) -> Result<()> {
        match kind {
            RemediationKind::StartInference => self.start_inference().await,
            RemediationKind::StartKnowledgeStore => self.start_knowledge_store().await,
            RemediationKind::AwaitBackend => self.await_backend().await,
            RemediationKind::ResetSettings => {
                self.store.reset().context("failed to reset settings")?;
                info!("settings reset to defaults");
                Ok(())
            }
        }
    }
}

async fn wait_until_ready(probe: &dyn Probe, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if probe.probe().await.is_ready() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

fn spawn_detached(command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("empty launch command"))?;
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;
    info!("spawned {} (pid {:?})", program, child.id());
    Ok(())
}

async fn compose_up(compose_file: &Path) -> Result<()> {
    if !compose_file.exists() {
        bail!("compose file {} not found", compose_file.display());
    }
    let output = Command::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(compose_file)
        .arg("up")
        .arg("-d")
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run docker compose")?;
    if !output.status.success() {
        bail!(
            "docker compose up failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!("docker compose up -d succeeded for {}", compose_file.display());
    Ok(())
}

fn lm_studio_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for var in ["LOCALAPPDATA", "PROGRAMFILES"] {
        if let Ok(base) = env::var(var) {
            candidates.push(PathBuf::from(&base).join("LM Studio").join("LM Studio.exe"));
            candidates.push(
                PathBuf::from(&base)
                    .join("Programs")
                    .join("LM Studio")
                    .join("LM Studio.exe"),
            );
        }
    }
    candidates.push(PathBuf::from("/Applications/LM Studio.app/Contents/MacOS/LM Studio"));
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".lmstudio").join("bin").join("lms"));
    }
    candidates
}

fn discover_lm_studio() -> Option<PathBuf> {
    lm_studio_candidates().into_iter().find(|p| p.is_file())
}
