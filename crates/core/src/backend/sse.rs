//! Minimal decoder for `text/event-stream` bodies.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum SseEvent {
    Data(String),
    Done,
}

/// Splits arbitrary body chunks into `data:` events.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters cut across chunks decode correctly.
#[derive(Debug, Default)]
pub(super) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(super) fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Handles a last line without a trailing newline.
    pub(super) fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&line))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?;
    let data = data.trim();
    match data {
        "" => None,
        "[DONE]" => Some(SseEvent::Done),
        _ => Some(SseEvent::Data(data.to_string())),
    }
}
