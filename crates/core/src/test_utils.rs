//! Test utilities for utter-core crate
//!
//! Shared helpers for mock servers and temporary configuration files.

use crate::backend::{BackendConfig, BackendKind};
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tempfile::Builder;

/// Creates a temporary config file with the given content.
/// Uses tempfile::Builder to ensure unique directories for parallel tests.
///
/// # Panics
/// Panics if temp directory creation or file writing fails.
pub fn create_temp_config(content: &str) -> PathBuf {
    let temp_dir = Builder::new()
        .prefix("utter-test")
        .rand_bytes(8)
        .tempdir()
        .unwrap();
    let config_path = temp_dir.path().join("utter.yml");
    File::create(&config_path)
        .unwrap()
        .write_all(content.as_bytes())
        .unwrap();
    // Keep the temp directory alive by leaking it (this is just for tests)
    let _ = Box::leak(Box::new(temp_dir));
    config_path
}

/// OpenAI compatible backend pointing at `server_url`.
pub fn openai_backend_config(server_url: &str) -> BackendConfig {
    BackendConfig {
        name: "test-model".to_string(),
        key: "test".to_string(),
        kind: BackendKind::Openai,
        settings: HashMap::from([
            ("base_url".to_string(), server_url.into()),
            ("api_key".to_string(), "MOCK_OPENAI_API_KEY".into()),
        ]),
    }
}

/// Server sent events body of a chat completion stream.
///
/// One chunk per entry of `contents`, then an empty `stop` chunk when
/// `with_stop` is set, a usage chunk and the `[DONE]` marker.
pub fn mock_event_stream_body(contents: &[&str], with_stop: bool) -> String {
    let chunk = |delta: serde_json::Value, finish_reason: serde_json::Value| {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1684,
            "model": "test-model",
            "choices": [{
                "delta": delta,
                "index": 0,
                "finish_reason": finish_reason
            }]
        })
    };

    let mut events: Vec<serde_json::Value> = contents
        .iter()
        .map(|c| chunk(json!({"content": c}), serde_json::Value::Null))
        .collect();
    if with_stop {
        events.push(chunk(json!({}), json!("stop")));
    }
    events.push(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 1684,
        "model": "test-model",
        "choices": [],
        "usage": {
            "prompt_tokens": 20,
            "completion_tokens": 30,
            "total_tokens": 50
        }
    }));

    let mut body = events
        .into_iter()
        .map(|event| format!("data: {event}\n\n"))
        .collect::<String>();
    body.push_str("data: [DONE]\n\n");
    body
}
