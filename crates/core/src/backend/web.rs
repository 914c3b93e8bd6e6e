use super::sse::{SseDecoder, SseEvent};
use super::{BackendConfig, BackendKind, default_timeout_secs, resolve_secret, with_timeout};
use crate::completion::{
    BackendMetrics, CancellationToken, ChatBackend, ChatMessage, Completion, CompletionResponse,
    SenderType,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api";
const FREE_MODEL: &str = "text-davinci-002-render-sha";
const PAID_MODEL: &str = "text-davinci-002-render-paid";

#[derive(Debug, Clone, Deserialize)]
struct WebSettings {
    #[serde(default = "default_base_url")]
    base_url: String,
    access_token: Option<String>,
    email: Option<String>,
    password: Option<String>,
    auth_url: Option<String>,
    #[serde(default)]
    paid: bool,
    proxy: Option<String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Clone)]
enum Credentials {
    AccessToken(String),
    Login {
        auth_url: String,
        email: String,
        password: String,
    },
}

/// Server side conversation pointers, advanced by every reply.
#[derive(Debug, Default)]
struct SessionState {
    conversation_id: Option<String>,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebEvent {
    message: Option<WebMessage>,
    conversation_id: Option<String>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WebMessage {
    id: String,
    author: Author,
    content: Content,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct Author {
    role: String,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    finish_details: Option<FinishDetails>,
}

#[derive(Debug, Deserialize)]
struct FinishDetails {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

/// Browser session chatbot.
///
/// The service keeps the conversation itself and streams the whole message
/// so far on every event; only the new tail is forwarded.
pub struct WebSessionBackend {
    model: String,
    base_url: String,
    credentials: Credentials,
    token: Arc<OnceCell<String>>,
    state: Arc<Mutex<SessionState>>,
    client: reqwest::Client,
    timeout: Duration,
    metrics: BackendMetrics,
}

impl WebSessionBackend {
    pub fn new(backend_config: BackendConfig) -> Result<Self> {
        let start = Instant::now();
        let settings: WebSettings = backend_config.parse_settings()?;

        let credentials = match (&settings.access_token, &settings.email, &settings.password) {
            (Some(token), _, _) => {
                info!("Try to login with access token.");
                Credentials::AccessToken(resolve_secret(token)?)
            }
            (None, Some(email), Some(password)) => {
                info!("Try to login with email and password.");
                let auth_url = settings
                    .auth_url
                    .clone()
                    .ok_or_else(|| anyhow!("'auth_url' is required to login with email"))?;
                Credentials::Login {
                    auth_url,
                    email: email.clone(),
                    password: resolve_secret(password)?,
                }
            }
            _ => {
                return Err(anyhow!(
                    "Web backend needs 'access_token', or 'email' and 'password'"
                ));
            }
        };

        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = &settings.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("Invalid proxy url")?);
        }
        let client = builder.build().context("Failed to build http client")?;

        let model = match (backend_config.name.is_empty(), settings.paid) {
            (false, _) => backend_config.name.clone(),
            (true, true) => PAID_MODEL.to_string(),
            (true, false) => FREE_MODEL.to_string(),
        };

        let token = match &credentials {
            Credentials::AccessToken(token) => OnceCell::new_with(Some(token.clone())),
            Credentials::Login { .. } => OnceCell::new(),
        };

        Ok(Self {
            model,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            credentials,
            token: Arc::new(token),
            state: Arc::new(Mutex::new(SessionState::default())),
            client,
            timeout: Duration::from_secs(settings.timeout_secs),
            metrics: BackendMetrics {
                init_latency_ms: start.elapsed().as_secs_f32() * 1000.0,
            },
        })
    }
}

async fn login(client: &reqwest::Client, credentials: &Credentials) -> Result<String> {
    match credentials {
        Credentials::AccessToken(token) => Ok(token.clone()),
        Credentials::Login {
            auth_url,
            email,
            password,
        } => {
            let response = client
                .post(auth_url)
                .json(&json!({"email": email, "password": password}))
                .send()
                .await
                .context("Login request failed")?;
            let status = response.status();
            if !status.is_success() {
                return Err(anyhow!("Login failed with status {status}"));
            }
            let login: LoginResponse = response.json().await.context("Invalid login response")?;
            info!("Logged in with email.");
            Ok(login.access_token)
        }
    }
}

/// New text of a cumulative message, given what was already forwarded.
fn delta<'a>(message: &'a str, forwarded: &str) -> &'a str {
    message.get(forwarded.len()..).unwrap_or_default()
}

#[async_trait]
impl ChatBackend for WebSessionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Web
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.clone()
    }

    fn accepts_system_prompt(&self) -> bool {
        false
    }

    /// Forgets the server side conversation; the next message starts a new one.
    async fn reset(&self) {
        *self.state.lock().await = SessionState::default();
        debug!("Web conversation reset");
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _settings: &HashMap<String, String>,
        cancel_token: CancellationToken,
    ) -> BoxStream<'static, Result<Completion>> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.sender == SenderType::User)
            .map(|m| m.text.clone());

        let client = self.client.clone();
        let credentials = self.credentials.clone();
        let token = self.token.clone();
        let state = self.state.clone();
        let endpoint = format!("{}/conversation", self.base_url);
        let model = self.model.clone();
        let timeout = self.timeout;

        let stream = async_stream::stream! {
            let Some(prompt) = prompt else {
                yield Err(anyhow!("No user message to send"));
                return;
            };

            let access_token = match token.get_or_try_init(|| login(&client, &credentials)).await {
                Ok(token) => token.clone(),
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let body = {
                let state = state.lock().await;
                json!({
                    "action": "next",
                    "messages": [{
                        "id": Uuid::new_v4().to_string(),
                        "author": {"role": "user"},
                        "content": {"content_type": "text", "parts": [prompt]},
                    }],
                    "conversation_id": state.conversation_id,
                    "parent_message_id": state
                        .parent_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    "model": model,
                })
            };

            let sent = tokio::time::timeout(
                timeout,
                client
                    .post(&endpoint)
                    .bearer_auth(&access_token)
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .json(&body)
                    .send(),
            )
            .await;
            let response = match sent {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    yield Err(anyhow!("Web chat request failed: {err}"));
                    return;
                }
                Err(_) => {
                    yield Err(anyhow!("Web chat request timed out after {}s", timeout.as_secs()));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield Err(anyhow!("Web chat failed with status {status}: {body}"));
                return;
            }

            let mut forwarded = String::new();
            let mut decoder = SseDecoder::default();
            let mut body = with_timeout(
                response.bytes_stream().map(|b| b.map_err(|e| anyhow!("Web chat stream error: {e}"))),
                timeout,
            );
            let mut finished = false;
            while !finished {
                let events = match body.next().await {
                    Some(Ok(bytes)) => decoder.feed(&bytes),
                    Some(Err(err)) => {
                        warn!("{err}");
                        yield Err(err);
                        break;
                    }
                    None => {
                        finished = true;
                        decoder.finish().into_iter().collect()
                    }
                };
                if cancel_token.is_cancelled() {
                    debug!("Completion cancelled");
                    break;
                }

                for event in events {
                    let data = match event {
                        SseEvent::Done => {
                            finished = true;
                            break;
                        }
                        SseEvent::Data(data) => data,
                    };
                    let event: WebEvent = match serde_json::from_str(&data) {
                        Ok(event) => event,
                        Err(err) => {
                            debug!("Skipping unknown web event: {err}");
                            continue;
                        }
                    };
                    if let Some(error) = event.error.filter(|e| !e.is_null()) {
                        yield Err(anyhow!("Web chat error: {error}"));
                        finished = true;
                        break;
                    }
                    let Some(message) = event.message else { continue };
                    if message.author.role != "assistant" {
                        continue;
                    }

                    {
                        let mut state = state.lock().await;
                        if event.conversation_id.is_some() {
                            state.conversation_id = event.conversation_id.clone();
                        }
                        state.parent_id = Some(message.id.clone());
                    }

                    let text = message
                        .content
                        .parts
                        .first()
                        .and_then(|p| p.as_str())
                        .unwrap_or_default();
                    let finish_reason = message
                        .metadata
                        .and_then(|m| m.finish_details)
                        .map(|d| d.kind);
                    let new_text = delta(text, &forwarded).to_string();
                    forwarded = text.to_string();

                    if !new_text.is_empty() || finish_reason.is_some() {
                        yield Ok(Completion::Response(CompletionResponse {
                            text: new_text,
                            finish_reason,
                            raw_chunk: Some(data.clone()),
                        }));
                    }
                }
            }
        };

        Box::pin(stream)
    }
}
