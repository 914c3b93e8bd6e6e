mod presenter;
mod progress;

pub use presenter::{ChatMessageType, StreamSummary, format_footer, style_chat_text};
pub use progress::GenerationSpinner;

/// Prints a formatted error message to stderr.
pub fn present_error(error: anyhow::Error) {
    let error_text = style_chat_text("ERROR:", ChatMessageType::Error);
    eprintln!("\n{error_text} {error:#}");
}
