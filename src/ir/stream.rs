// Stream chunk alphabet. Every stream is: one `start`, any number of
// `content`/`tool_call_delta`, then exactly one `done` or `error`, with a
// gapless sequence numbering from 0. `crate::stream::normalize` enforces the
// invariants for streams produced by adapters.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use super::{FinishReason, Message, ResponseMetadata, Usage};

/// A single chunk of a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamChunk {
    /// Exactly one per stream, always first.
    Start {
        sequence: u64,
        metadata: ResponseMetadata,
    },
    /// Incremental assistant text.
    Content {
        sequence: u64,
        delta: String,
        /// Running concatenation of all deltas so far; present iff the
        /// effective stream mode is `accumulated`.
        #[serde(skip_serializing_if = "Option::is_none")]
        accumulated: Option<String>,
    },
    /// Incremental tool-call arguments from tool-calling providers.
    ToolCallDelta {
        sequence: u64,
        id: String,
        /// Sent once, on the first delta of a call.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        input_delta: String,
    },
    /// Well-formed termination with the assembled final message.
    Done {
        sequence: u64,
        finish_reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        message: Message,
    },
    /// Terminal failure; mutually exclusive with `done`.
    Error {
        sequence: u64,
        code: String,
        message: String,
    },
}

impl StreamChunk {
    pub fn sequence(&self) -> u64 {
        match self {
            StreamChunk::Start { sequence, .. }
            | StreamChunk::Content { sequence, .. }
            | StreamChunk::ToolCallDelta { sequence, .. }
            | StreamChunk::Done { sequence, .. }
            | StreamChunk::Error { sequence, .. } => *sequence,
        }
    }

    pub fn with_sequence(mut self, new_sequence: u64) -> Self {
        match &mut self {
            StreamChunk::Start { sequence, .. }
            | StreamChunk::Content { sequence, .. }
            | StreamChunk::ToolCallDelta { sequence, .. }
            | StreamChunk::Done { sequence, .. }
            | StreamChunk::Error { sequence, .. } => *sequence = new_sequence,
        }
        self
    }

    /// `done` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamChunk::Done { .. } | StreamChunk::Error { .. }
        )
    }

    pub fn is_content(&self) -> bool {
        matches!(self, StreamChunk::Content { .. })
    }

    /// Shorthand for a terminal error chunk from a typed error.
    pub fn error(sequence: u64, err: &crate::error::GatewayError) -> Self {
        StreamChunk::Error {
            sequence,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Shorthand for the `aborted` terminal chunk produced on cancellation.
    pub fn aborted(sequence: u64) -> Self {
        StreamChunk::Error {
            sequence,
            code: "aborted".to_string(),
            message: "request cancelled".to_string(),
        }
    }
}

/// A lazy, single-consumer chunk stream. Errors travel in-band as terminal
/// [`StreamChunk::Error`] chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Box a concrete stream into the common alias.
pub fn boxed<S>(stream: S) -> ChunkStream
where
    S: Stream<Item = StreamChunk> + Send + 'static,
{
    Box::pin(stream)
}
