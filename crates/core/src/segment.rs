//! Sentence segmentation of streamed text.
//!
//! Backends deliver replies as arbitrary fragments. Speech playback wants
//! whole sentences as early as possible, so fragments are accumulated and
//! flushed whenever a boundary marker shows up.
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::{debug, error};

pub const DEFAULT_FALLBACK_MESSAGE: &str = "服务暂时不可用，请检查网络或配置";

/// A piece of upstream text, or the signal that the upstream is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Stop,
}

impl From<&str> for Fragment {
    fn from(value: &str) -> Self {
        Fragment::Text(value.to_string())
    }
}

/// Segmentation options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SegmenterConfig {
    pub boundary_markers: Vec<char>,
    pub min_first_chunk_length: usize,
    pub fallback_message: String,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            boundary_markers: vec!['。', '！', '？', '\n'],
            min_first_chunk_length: 3,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

/// Accumulates fragments and cuts them into sentences.
#[derive(Debug, Clone)]
pub struct Segmenter {
    markers: Vec<char>,
    min_first_chunk_length: usize,
    buffer: String,
    emitted: bool,
}

impl Segmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            markers: config.boundary_markers.clone(),
            min_first_chunk_length: config.min_first_chunk_length,
            buffer: String::new(),
            emitted: false,
        }
    }

    /// Appends a fragment and returns the sentences it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        let mut start = 0;
        for (idx, ch) in self.buffer.char_indices() {
            if !self.markers.contains(&ch) {
                continue;
            }
            let end = idx + ch.len_utf8();
            let piece = self.buffer[start..end].trim();
            if piece.is_empty() {
                start = end;
                continue;
            }
            // Hold a too-short opening piece so it merges with the next one.
            if !self.emitted && piece.chars().count() < self.min_first_chunk_length {
                continue;
            }
            sentences.push(piece.to_string());
            self.emitted = true;
            start = end;
        }

        self.buffer.drain(..start);
        sentences
    }

    /// Flushes whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            self.emitted = true;
            Some(rest.to_string())
        }
    }

    /// Drops the unflushed text.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Blocking sentence iterator over a fragment iterator.
pub struct Segments<I> {
    fragments: I,
    segmenter: Segmenter,
    fallback_message: String,
    ready: std::collections::VecDeque<String>,
    done: bool,
}

/// Segments a blocking fragment producer.
pub fn segments<I, E>(fragments: I, config: &SegmenterConfig) -> Segments<I::IntoIter>
where
    I: IntoIterator<Item = Result<Fragment, E>>,
    E: Display,
{
    Segments {
        fragments: fragments.into_iter(),
        segmenter: Segmenter::new(config),
        fallback_message: config.fallback_message.clone(),
        ready: Default::default(),
        done: false,
    }
}

impl<I, E> Iterator for Segments<I>
where
    I: Iterator<Item = Result<Fragment, E>>,
    E: Display,
{
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.ready.is_empty() && !self.done {
            match self.fragments.next() {
                Some(Ok(Fragment::Text(text))) => self.ready.extend(self.segmenter.push(&text)),
                Some(Ok(Fragment::Stop)) | None => {
                    self.done = true;
                    self.ready.extend(self.segmenter.finish());
                }
                Some(Err(err)) => {
                    error!("Upstream failed while segmenting: {err}");
                    self.done = true;
                    self.segmenter.reset();
                    self.ready.push_back(self.fallback_message.clone());
                }
            }
        }
        self.ready.pop_front()
    }
}

/// Segments an async fragment producer into a lazy sentence stream.
///
/// Upstream errors never escape: the pending text is dropped, the configured
/// fallback message is yielded once and the stream ends. Dropping the
/// returned stream drops the producer too.
pub fn segment_stream<'a, S, E>(fragments: S, config: SegmenterConfig) -> BoxStream<'a, String>
where
    S: Stream<Item = Result<Fragment, E>> + Send + 'a,
    E: Display + Send + 'a,
{
    let stream = async_stream::stream! {
        let mut segmenter = Segmenter::new(&config);
        let mut fragments = Box::pin(fragments);
        let mut failed = false;

        while let Some(next) = fragments.next().await {
            match next {
                Ok(Fragment::Text(text)) => {
                    for sentence in segmenter.push(&text) {
                        debug!(%sentence, "segment");
                        yield sentence;
                    }
                }
                Ok(Fragment::Stop) => break,
                Err(err) => {
                    error!("Upstream failed while segmenting: {err}");
                    segmenter.reset();
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            yield config.fallback_message.clone();
        } else if let Some(sentence) = segmenter.finish() {
            debug!(%sentence, "segment (flush)");
            yield sentence;
        }
    };

    Box::pin(stream)
}
