pub mod backend;
pub mod completion;
pub mod config;
pub mod conversation;
mod paths;
pub mod segment;

#[cfg(test)]
mod test_utils;

pub use crate::backend::get_chat_backend;
pub use crate::paths::get_data_dir;
pub use crate::conversation::{Conversation, ConversationOptions};
pub use crate::segment::{Fragment, Segmenter, SegmenterConfig, segment_stream, segments};
