use console::{Style, StyledObject};

/// Represents the type of a chat message, used for styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMessageType {
    /// The prompt for user input.
    Prompt,
    /// One segmented sentence of a reply.
    Sentence,
    /// Footer information, like timings or status.
    Footer,
    /// An error message.
    Error,
}

/// Styles a string of text according to the specified `ChatMessageType`.
pub fn style_chat_text(text: &str, style: ChatMessageType) -> StyledObject<&str> {
    let style_obj = match style {
        ChatMessageType::Prompt => Style::new().blue().bold(),
        ChatMessageType::Sentence => Style::new().white().bright(),
        ChatMessageType::Footer => Style::new().white().dim(),
        ChatMessageType::Error => Style::new().red().bold(),
    };
    style_obj.apply_to(text)
}

/// Timings of one streamed reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub sentences: usize,
    pub first_sentence_ms: Option<f32>,
    pub total_ms: f32,
}

/// Formats a reply summary for the footer line.
pub fn format_footer(summary: &StreamSummary, is_cancelled: bool) -> String {
    if is_cancelled {
        return "◼ Cancelled.".to_string();
    }

    let mut details = Vec::new();
    if let Some(first) = summary.first_sentence_ms {
        details.push(format!("{:.2}s to first sentence", first / 1000.0));
    }
    if summary.total_ms > 0.0 {
        details.push(format!("{:.2}s total", summary.total_ms / 1000.0));
    }
    if summary.sentences > 0 {
        let unit = if summary.sentences == 1 {
            "sentence"
        } else {
            "sentences"
        };
        details.push(format!("{} {unit}", summary.sentences));
    }

    if details.is_empty() {
        "◼ Completed.".to_string()
    } else {
        format!("◼ Completed. {}", details.join(". "))
    }
}
