use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

/// What a single reachability check observed. Probes never fail: every
/// network error, timeout, or unparsable body ends up as `Unreachable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ready {
        detail: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        models: Vec<String>,
    },
    NotReady {
        detail: String,
    },
    Unreachable {
        reason: String,
    },
}

impl ProbeOutcome {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self::Ready {
            detail: detail.into(),
            models: Vec::new(),
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self::NotReady {
            detail: detail.into(),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn is_reachable(&self) -> bool {
        !matches!(self, Self::Unreachable { .. })
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Ready { detail, .. } | Self::NotReady { detail } => detail,
            Self::Unreachable { reason } => reason,
        }
    }

    pub fn models(&self) -> &[String] {
        match self {
            Self::Ready { models, .. } => models,
            _ => &[],
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// Human-readable target, e.g. a URL or `host:port` list.
    fn target(&self) -> String;

    async fn probe(&self) -> ProbeOutcome;
}

fn http_client(timeout: Duration) -> Option<Client> {
    Client::builder().timeout(timeout).build().ok()
}

pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Option<Vec<ModelEntry>>,
    models: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(alias = "name")]
    id: String,
}

/// Parses an OpenAI-style (`data[].id`) or Ollama-style (`models[].name`)
/// model listing.
pub fn parse_model_list(body: &str) -> Option<Vec<String>> {
    let list: ModelList = serde_json::from_str(body).ok()?;
    let entries = match (list.data, list.models) {
        (Some(data), _) => data,
        (None, Some(models)) => models,
        (None, None) => return None,
    };
    Some(entries.into_iter().map(|m| m.id).collect())
}

/// Inference endpoint probe: `GET {base}/models` against each candidate base
/// URL in order. The first candidate that answers 2xx with a model list decides
/// the outcome; errors and other statuses fall through to the next one.
#[derive(Debug, Clone)]
pub struct ModelsProbe {
    candidates: Vec<String>,
    timeout: Duration,
}

impl ModelsProbe {
    pub fn new(candidates: impl IntoIterator<Item = impl AsRef<str>>, timeout: Duration) -> Self {
        Self {
            candidates: candidates
                .into_iter()
                .map(|c| normalize_base_url(c.as_ref()))
                .collect(),
            timeout,
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }
}

#[async_trait]
impl Probe for ModelsProbe {
    fn target(&self) -> String {
        self.candidates.join(", ")
    }

    async fn probe(&self) -> ProbeOutcome {
        let Some(http) = http_client(self.timeout) else {
            return ProbeOutcome::unreachable("failed to build HTTP client");
        };
        if self.candidates.is_empty() {
            return ProbeOutcome::unreachable("no inference endpoints configured");
        }
        let mut last_error = String::new();
        for base in &self.candidates {
            let url = format!("{base}/models");
            let resp = match http.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!("models probe {} failed: {}", url, e);
                    last_error = format!("{url}: {e}");
                    continue;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                debug!("models probe {} answered HTTP {}", url, status);
                last_error = format!("{url}: HTTP {status}");
                continue;
            }
            let Ok(body) = resp.text().await else {
                last_error = format!("{url}: unreadable body");
                continue;
            };
            let Some(models) = parse_model_list(&body) else {
                last_error = format!("{url}: malformed model list");
                continue;
            };
            if models.is_empty() {
                return ProbeOutcome::not_ready(format!("{base} is running but no model is loaded"));
            }
            return ProbeOutcome::Ready {
                detail: format!("{base} serving {} model(s)", models.len()),
                models,
            };
        }
        ProbeOutcome::unreachable(format!("not detected on any endpoint ({last_error})"))
    }
}

/// Liveness probe: any 2xx is ready, any other status means the service is up
/// but not ready.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    url: String,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Self {
        Self {
            url: format!("{}/{}", normalize_base_url(base_url), path.trim_start_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for HealthProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn probe(&self) -> ProbeOutcome {
        let Some(http) = http_client(self.timeout) else {
            return ProbeOutcome::unreachable("failed to build HTTP client");
        };
        match http.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => {
                ProbeOutcome::ready(format!("{} -> {}", self.url, resp.status()))
            }
            Ok(resp) => ProbeOutcome::not_ready(format!("{} responded HTTP {}", self.url, resp.status())),
            Err(e) => {
                debug!("health probe {} failed: {}", self.url, e);
                ProbeOutcome::unreachable(format!("could not reach {}: {e}", self.url))
            }
        }
    }
}

/// Connectivity probe: ready as soon as one `host:port` accepts a TCP
/// connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    targets: Vec<String>,
    timeout: Duration,
}

pub const INTERNET_TARGETS: [&str; 3] = ["google.com:443", "cloudflare.com:443", "github.com:443"];

impl TcpProbe {
    pub fn new(targets: impl IntoIterator<Item = impl Into<String>>, timeout: Duration) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    pub fn internet(timeout: Duration) -> Self {
        Self::new(INTERNET_TARGETS, timeout)
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn target(&self) -> String {
        self.targets.join(", ")
    }

    async fn probe(&self) -> ProbeOutcome {
        for target in &self.targets {
            match tokio::time::timeout(self.timeout, TcpStream::connect(target.as_str())).await {
                Ok(Ok(_)) => return ProbeOutcome::ready(format!("connected via {target}")),
                Ok(Err(e)) => debug!("tcp probe {} failed: {}", target, e),
                Err(_) => debug!("tcp probe {} timed out", target),
            }
        }
        ProbeOutcome::unreachable(format!("none of [{}] accepted a connection", self.target()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAuth {
    Bearer,
    Query(&'static str),
    Header(&'static str),
}

/// Validates one provider API key against the provider's model listing.
#[derive(Debug, Clone)]
pub struct KeyProbe {
    label: String,
    url: String,
    auth: KeyAuth,
    key: String,
    extra_headers: Vec<(&'static str, &'static str)>,
    timeout: Duration,
}

impl KeyProbe {
    pub fn new(
        label: impl Into<String>,
        url: impl Into<String>,
        auth: KeyAuth,
        key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            auth,
            key: key.into(),
            extra_headers: Vec::new(),
            timeout,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.extra_headers.push((name, value));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl Probe for KeyProbe {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn probe(&self) -> ProbeOutcome {
        let Some(http) = http_client(self.timeout) else {
            return ProbeOutcome::unreachable("failed to build HTTP client");
        };
        let mut request = http.get(&self.url);
        request = match self.auth {
            KeyAuth::Bearer => request.bearer_auth(&self.key),
            KeyAuth::Query(name) => request.query(&[(name, self.key.as_str())]),
            KeyAuth::Header(name) => request.header(name, &self.key),
        };
        for (name, value) in &self.extra_headers {
            request = request.header(*name, *value);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                ProbeOutcome::ready(format!("{} key accepted", self.label))
            }
            Ok(resp) => match resp.status() {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ProbeOutcome::not_ready(format!("{} key rejected (HTTP {})", self.label, resp.status()))
                }
                status => ProbeOutcome::not_ready(format!("{} responded HTTP {}", self.label, status)),
            },
            Err(e) => ProbeOutcome::unreachable(format!("{} unreachable: {e}", self.label)),
        }
    }
}

/// Aggregate over every configured provider key.
#[derive(Debug, Clone, Default)]
pub struct CloudKeysProbe {
    keys: Vec<KeyProbe>,
}

impl CloudKeysProbe {
    pub fn new(keys: Vec<KeyProbe>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Probe for CloudKeysProbe {
    fn target(&self) -> String {
        self.keys
            .iter()
            .map(|k| k.label().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn probe(&self) -> ProbeOutcome {
        if self.keys.is_empty() {
            return ProbeOutcome::not_ready("no cloud API keys configured");
        }
        let mut tasks = JoinSet::new();
        for (idx, key) in self.keys.iter().cloned().enumerate() {
            tasks.spawn(async move { (idx, key.probe().await) });
        }
        let mut slots: Vec<Option<ProbeOutcome>> = vec![None; self.keys.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => debug!("key validation task failed: {}", e),
            }
        }

        let mut valid = Vec::new();
        let mut errors = Vec::new();
        for (key, outcome) in self.keys.iter().zip(slots) {
            match outcome {
                Some(outcome) if outcome.is_ready() => valid.push(key.label().to_string()),
                Some(outcome) => errors.push(outcome.detail().to_string()),
                None => errors.push(format!("{} check aborted", key.label())),
            }
        }
        if valid.is_empty() {
            ProbeOutcome::unreachable(format!("no configured key works: {}", errors.join("; ")))
        } else {
            ProbeOutcome::ready(format!("valid: {}", valid.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn spawn_mock(app: Router) -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });
        (format!("http://{addr}"), tx)
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn timeout() -> Duration {
        Duration::from_secs(2)
    }

    #[test]
    fn model_list_accepts_both_shapes() {
        assert_eq!(
            parse_model_list(r#"{"object":"list","data":[{"id":"qwen2.5-7b","object":"model"}]}"#),
            Some(vec!["qwen2.5-7b".to_string()])
        );
        assert_eq!(
            parse_model_list(r#"{"models":[{"name":"llama3.1:8b","size":1}]}"#),
            Some(vec!["llama3.1:8b".to_string()])
        );
        assert_eq!(parse_model_list(r#"{"data":[]}"#), Some(vec![]));
        assert_eq!(parse_model_list(r#"{"status":"ok"}"#), None);
        assert_eq!(parse_model_list("<html>"), None);
    }

    #[test]
    fn base_urls_are_normalized() {
        assert_eq!(normalize_base_url("127.0.0.1:1234/v1/"), "http://127.0.0.1:1234/v1");
        assert_eq!(normalize_base_url("https://api.openai.com/v1"), "https://api.openai.com/v1");
    }

    #[tokio::test]
    async fn models_probe_distinguishes_ready_and_not_ready() {
        let (loaded, stop_loaded) = spawn_mock(Router::new().route(
            "/v1/models",
            get(|| async { axum::Json(json!({"data":[{"id":"phi-3"}]})) }),
        ))
        .await;
        let (empty, stop_empty) = spawn_mock(Router::new().route(
            "/v1/models",
            get(|| async { axum::Json(json!({"data":[]})) }),
        ))
        .await;

        let ready = ModelsProbe::new([format!("{loaded}/v1")], timeout()).probe().await;
        assert!(ready.is_ready());
        assert_eq!(ready.models(), ["phi-3".to_string()]);

        let idle = ModelsProbe::new([format!("{empty}/v1")], timeout()).probe().await;
        assert!(idle.is_reachable());
        assert!(!idle.is_ready());
        assert!(idle.detail().contains("no model"));

        let _ = stop_loaded.send(());
        let _ = stop_empty.send(());
    }

    #[tokio::test]
    async fn models_probe_falls_through_dead_candidates() {
        let dead = closed_port().await;
        let (live, stop) = spawn_mock(Router::new().route(
            "/v1/models",
            get(|| async { axum::Json(json!({"models":[{"name":"mistral"}]})) }),
        ))
        .await;

        let probe = ModelsProbe::new([format!("{dead}/v1"), format!("{live}/v1")], timeout());
        let outcome = probe.probe().await;
        assert!(outcome.is_ready(), "{outcome:?}");

        let all_dead = ModelsProbe::new([format!("{dead}/v1")], timeout()).probe().await;
        assert!(!all_dead.is_reachable());
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn models_fall_through_non_success_candidates() {
        let (other, stop_other) = spawn_mock(Router::new().route(
            "/v1/models",
            get(|| async { (AxumStatus::NOT_FOUND, "no such route") }),
        ))
        .await;
        let (live, stop_live) = spawn_mock(Router::new().route(
            "/v1/models",
            get(|| async { axum::Json(json!({"data":[{"id":"llama3"}]})) }),
        ))
        .await;

        let outcome = ModelsProbe::new([format!("{other}/v1"), format!("{live}/v1")], timeout())
            .probe()
            .await;
        assert!(outcome.is_ready(), "{outcome:?}");
        assert_eq!(outcome.models(), ["llama3".to_string()]);

        let only_404 = ModelsProbe::new([format!("{other}/v1")], timeout()).probe().await;
        assert!(!only_404.is_reachable());
        assert!(only_404.detail().contains("404"), "{only_404:?}");

        let _ = stop_other.send(());
        let _ = stop_live.send(());
    }

    #[tokio::test]
    async fn malformed_model_list_is_unreachable() {
        let (base, stop) = spawn_mock(Router::new().route("/v1/models", get(|| async { "not json" })))
            .await;
        let outcome = ModelsProbe::new([format!("{base}/v1")], timeout()).probe().await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable { .. }));
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn health_probe_maps_status_codes() {
        let (base, stop) = spawn_mock(
            Router::new()
                .route("/api/health", get(|| async { "ok" }))
                .route(
                    "/degraded",
                    get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "starting") }),
                ),
        )
        .await;

        assert!(HealthProbe::new(&base, "/api/health", timeout()).probe().await.is_ready());
        let degraded = HealthProbe::new(&base, "degraded", timeout()).probe().await;
        assert!(degraded.is_reachable() && !degraded.is_ready());

        let dead = closed_port().await;
        assert!(!HealthProbe::new(&dead, "/api/health", timeout()).probe().await.is_reachable());
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn tcp_probe_uses_first_open_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let closed = closed_port().await.trim_start_matches("http://").to_string();

        let outcome = TcpProbe::new([closed.clone(), open.clone()], timeout()).probe().await;
        assert_eq!(outcome, ProbeOutcome::ready(format!("connected via {open}")));

        let outcome = TcpProbe::new([closed], timeout()).probe().await;
        assert!(!outcome.is_reachable());
    }

    #[tokio::test]
    async fn key_probes_validate_and_aggregate() {
        let (base, stop) = spawn_mock(Router::new().route(
            "/models",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth == "Bearer good" {
                    (AxumStatus::OK, "{}")
                } else {
                    (AxumStatus::UNAUTHORIZED, "{}")
                }
            }),
        ))
        .await;
        let url = format!("{base}/models");
        let good = KeyProbe::new("openai", &url, KeyAuth::Bearer, "good", timeout());
        let bad = KeyProbe::new("openrouter", &url, KeyAuth::Bearer, "bad", timeout());

        assert!(good.probe().await.is_ready());
        let rejected = bad.probe().await;
        assert!(rejected.detail().contains("rejected"));

        let mixed = CloudKeysProbe::new(vec![bad.clone(), good]).probe().await;
        assert_eq!(mixed, ProbeOutcome::ready("valid: openai"));

        let none_valid = CloudKeysProbe::new(vec![bad]).probe().await;
        assert!(!none_valid.is_reachable());

        let empty = CloudKeysProbe::default().probe().await;
        assert!(empty.is_reachable() && !empty.is_ready());
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn hanging_provider_does_not_hide_a_valid_key() {
        let (base, stop) = spawn_mock(
            Router::new()
                .route(
                    "/stalled",
                    get(|| async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        "{}"
                    }),
                )
                .route("/models", get(|| async { "{}" })),
        )
        .await;
        let per_key = Duration::from_millis(300);
        let stalled = KeyProbe::new("gemini", format!("{base}/stalled"), KeyAuth::Query("key"), "k", per_key);
        let good = KeyProbe::new("openai", format!("{base}/models"), KeyAuth::Bearer, "good", per_key);

        let outcome = tokio::time::timeout(
            Duration::from_millis(900),
            CloudKeysProbe::new(vec![stalled, good]).probe(),
        )
        .await
        .expect("aggregate should finish within a single key budget");
        assert_eq!(outcome, ProbeOutcome::ready("valid: openai"));
        let _ = stop.send(());
    }
}
