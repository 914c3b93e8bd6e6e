//! Chat backends and their configuration.
mod apikey;
mod machine_id;
mod openai;
mod openai_types;
mod sse;
#[cfg(test)]
pub(crate) mod test_backend;
mod web;

pub use apikey::ApiKeyBackend;
pub use openai::OpenAiBackend;
pub use web::WebSessionBackend;

use crate::completion::ChatBackend;
use anyhow::{Result, anyhow};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;

/// Backend configuration for the tool.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Model name sent to the service.
    #[serde(default)]
    pub name: String,
    /// Key of this backend in the config file.
    #[serde(skip)]
    pub key: String,
    #[serde(alias = "type")]
    pub kind: BackendKind,
    #[serde(default, flatten)]
    pub settings: HashMap<String, serde_yaml::Value>,
}

impl BackendConfig {
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| serde_yaml::from_value(v.clone()).ok())
    }

    /// Deserializes the free-form settings into a backend specific struct.
    pub(crate) fn parse_settings<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_yaml::to_value(&self.settings)
            .map_err(|_e| anyhow!("Invalid settings structure"))?;
        serde_yaml::from_value(value)
            .map_err(|e| anyhow!("Invalid settings for backend '{}': {e}", self.name))
    }
}

/// Supported chat backends (serialized as lowercase strings).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Browser session chatbot, authenticated with an access token.
    Web,
    /// Chat completions with an API key and client side history.
    Apikey,
    /// Any OpenAI compatible streaming endpoint.
    Openai,
}

impl From<BackendKind> for String {
    fn from(val: BackendKind) -> Self {
        val.as_str().into()
    }
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match &self {
            BackendKind::Web => "web",
            BackendKind::Apikey => "apikey",
            BackendKind::Openai => "openai",
        }
    }
}

#[instrument(skip(backend_config), fields(kind = backend_config.kind.as_str()))]
pub fn get_chat_backend(backend_config: BackendConfig) -> Result<Box<dyn ChatBackend>> {
    match backend_config.kind {
        BackendKind::Web => Ok(Box::new(WebSessionBackend::new(backend_config)?)),
        BackendKind::Apikey => Ok(Box::new(ApiKeyBackend::new(backend_config)?)),
        BackendKind::Openai => Ok(Box::new(OpenAiBackend::new(backend_config)?)),
    }
}

/// Reads secrets written as `env:NAME` from the environment.
pub(crate) fn resolve_secret(value: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(name) => {
            let name = name.trim();
            std::env::var(name).map_err(|_| anyhow!("Environment variable {} not found", name))
        }
        None => Ok(value.to_string()),
    }
}

pub(crate) fn default_timeout_secs() -> u64 {
    30
}

/// Fails any item that takes longer than `timeout` to arrive.
pub(crate) fn with_timeout<'a, T, S>(
    stream: S,
    timeout: Duration,
) -> BoxStream<'a, Result<T>>
where
    S: futures::Stream<Item = Result<T>> + Send + 'a,
    T: Send + 'a,
{
    let stream = async_stream::stream! {
        let mut stream = Box::pin(stream);
        loop {
            match tokio::time::timeout(timeout, stream.next()).await {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(_) => {
                    yield Err(anyhow!("No response within {}s", timeout.as_secs()));
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}

/// Settings sent with every request, falling back to `default`.
pub(crate) fn setting_or<T: std::str::FromStr>(
    settings: &HashMap<String, String>,
    key: &str,
    default: T,
) -> T {
    settings
        .get(key)
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
