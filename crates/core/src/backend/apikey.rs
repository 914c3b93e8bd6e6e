use super::machine_id::get_machine_id;
use super::openai::{ask_chat, chat_request, stream_chat};
use super::{BackendConfig, BackendKind, default_timeout_secs, resolve_secret};
use crate::completion::{
    BackendMetrics, CancellationToken, ChatBackend, ChatMessage, Completion, CompletionResponse,
    SenderType,
};
use anyhow::{Context, Result, anyhow};
use async_openai::Client as OpenAIClient;
use async_openai::config::OpenAIConfig;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ENGINE: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone, serde::Deserialize)]
struct ApiKeySettings {
    #[serde(default = "default_api_url")]
    api_url: String,
    api_key: Option<String>,
    relay_url: Option<String>,
    proxy: Option<String>,
    #[serde(default = "default_max_context_tokens")]
    max_context_tokens: usize,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_max_context_tokens() -> usize {
    4000
}

/// Chat completions with an API key, or a relay keyed by machine id.
///
/// The conversation is kept client side, so older turns are trimmed to fit
/// `max_context_tokens`.
pub struct ApiKeyBackend {
    model: String,
    client: OpenAIClient<OpenAIConfig>,
    max_context_tokens: usize,
    timeout: Duration,
    metrics: BackendMetrics,
}

impl ApiKeyBackend {
    pub fn new(backend_config: BackendConfig) -> Result<Self> {
        let start = Instant::now();
        let settings: ApiKeySettings = backend_config.parse_settings()?;

        let (api_url, api_key) = match &settings.api_key {
            Some(key) => {
                info!("Using own API key.");
                (settings.api_url.clone(), resolve_secret(key)?)
            }
            None => {
                let relay_url = settings
                    .relay_url
                    .clone()
                    .ok_or_else(|| anyhow!("Either 'api_key' or 'relay_url' is required for apikey backend"))?;
                info!("Using API relay with machine id, requests may be rate limited.");
                (relay_url, get_machine_id()?)
            }
        };

        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_url.trim_end_matches('/'));
        let mut client = OpenAIClient::with_config(config);
        if let Some(proxy) = &settings.proxy {
            let http_client = reqwest::Client::builder()
                .proxy(reqwest::Proxy::all(proxy).context("Invalid proxy url")?)
                .build()
                .context("Failed to build http client")?;
            client = client.with_http_client(http_client);
        }

        let model = if backend_config.name.is_empty() {
            DEFAULT_ENGINE.to_string()
        } else {
            backend_config.name.clone()
        };

        Ok(Self {
            model,
            client,
            max_context_tokens: settings.max_context_tokens,
            timeout: Duration::from_secs(settings.timeout_secs),
            metrics: BackendMetrics {
                init_latency_ms: start.elapsed().as_secs_f32() * 1000.0,
            },
        })
    }
}

/// Rough token estimate, four characters per token.
fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Drops the oldest turns until the conversation fits `max_tokens`.
///
/// Leading system messages and the latest message are always kept.
fn trim_history(messages: &[ChatMessage], max_tokens: usize) -> Vec<ChatMessage> {
    let system_count = messages
        .iter()
        .take_while(|m| m.sender == SenderType::System)
        .count();
    let (system, turns) = messages.split_at(system_count);

    let mut budget = system
        .iter()
        .map(|m| estimate_tokens(&m.text))
        .sum::<usize>();
    let mut kept = 0;
    for (idx, message) in turns.iter().enumerate().rev() {
        let cost = estimate_tokens(&message.text);
        let is_latest = idx + 1 == turns.len();
        if !is_latest && budget + cost > max_tokens {
            break;
        }
        budget += cost;
        kept += 1;
    }

    if kept < turns.len() {
        debug!(dropped = turns.len() - kept, "Trimmed conversation history");
    }
    system
        .iter()
        .chain(&turns[turns.len() - kept..])
        .cloned()
        .collect()
}

#[async_trait]
impl ChatBackend for ApiKeyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Apikey
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.clone()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        settings: &HashMap<String, String>,
        cancel_token: CancellationToken,
    ) -> BoxStream<'static, Result<Completion>> {
        let messages = trim_history(messages, self.max_context_tokens);
        let request = chat_request(&self.model, &messages, settings, true);
        stream_chat(self.client.clone(), request, self.timeout, cancel_token)
    }

    async fn ask(
        &self,
        messages: &[ChatMessage],
        settings: &HashMap<String, String>,
    ) -> Result<CompletionResponse> {
        let messages = trim_history(messages, self.max_context_tokens);
        let request = chat_request(&self.model, &messages, settings, false);
        ask_chat(&self.client, request, self.timeout).await
    }
}
