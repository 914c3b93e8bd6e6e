use anyhow::Result;
use std::time::Instant;
use utter_core::{Conversation, config::Config};

use crate::cli::require_text;
use crate::cli::ux::{ChatMessageType, GenerationSpinner, StreamSummary, format_footer, style_chat_text};

/// Asks `text` and prints the whole reply once it arrives.
pub async fn execute(text: &str, config: &Config) -> Result<()> {
    let text = require_text(text)?;
    let mut chat = Conversation::from_config(config)?;

    let start = Instant::now();
    let spinner = GenerationSpinner::new("Thinking...".to_string());
    let reply = chat.ask(text).await;
    spinner.clear();
    let reply = reply?;

    println!("{reply}");
    let summary = StreamSummary {
        sentences: 0,
        first_sentence_ms: None,
        total_ms: start.elapsed().as_secs_f32() * 1000.0,
    };
    eprintln!();
    eprintln!(
        "{}",
        style_chat_text(&format_footer(&summary, false), ChatMessageType::Footer)
    );
    Ok(())
}
