use anyhow::Result;
use futures::StreamExt;
use std::io::Write;
use std::time::Instant;
use tracing::debug;
use utter_core::{Conversation, completion::CancellationToken, config::Config};

use crate::cli::require_text;
use crate::cli::ux::{
    ChatMessageType, GenerationSpinner, StreamSummary, format_footer, style_chat_text,
};

/// Asks `text` and prints the reply one sentence per line.
pub async fn execute(text: &str, config: &Config) -> Result<()> {
    let text = require_text(text)?;
    let mut chat = Conversation::from_config(config)?;

    let mut stdout = std::io::stdout();
    let (summary, cancelled) = stream_reply(&mut chat, text, &mut stdout).await?;

    eprintln!();
    eprintln!(
        "{}",
        style_chat_text(&format_footer(&summary, cancelled), ChatMessageType::Footer)
    );
    Ok(())
}

/// Streams the reply to `text` into `out`, one sentence per line.
///
/// Ctrl-C cancels the request. Returns the timings and whether the reply was
/// cancelled.
pub async fn stream_reply<W: Write>(
    chat: &mut Conversation,
    text: &str,
    out: &mut W,
) -> Result<(StreamSummary, bool)> {
    let start = Instant::now();
    let cancel_token = CancellationToken::new();
    let spinner = GenerationSpinner::new("Thinking...".to_string());

    let mut summary = StreamSummary::default();
    let mut cancelled = false;
    {
        let mut sentences = chat.ask_stream(text, cancel_token.clone());
        let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    cancel_token.cancel();
                    cancelled = true;
                    break;
                },
                next = sentences.next() => {
                    let Some(sentence) = next else { break };
                    if summary.sentences == 0 {
                        spinner.clear();
                        summary.first_sentence_ms = Some(elapsed_ms(start));
                    }
                    summary.sentences += 1;
                    writeln!(
                        out,
                        "{}",
                        style_chat_text(&sentence, ChatMessageType::Sentence)
                    )?;
                    out.flush()?;
                }
            }
        }
    }
    spinner.clear();

    summary.total_ms = elapsed_ms(start);
    debug!(?summary, cancelled, "Reply streamed");
    Ok((summary, cancelled))
}

fn elapsed_ms(start: Instant) -> f32 {
    start.elapsed().as_secs_f32() * 1000.0
}
