// Stream utilities: invariant normalization, accumulation, collection,
// line-buffering, interval coalescing, and fan-out. Streams are pull-based;
// nothing here buffers a whole stream except `tee`'s per-consumer queues,
// which are unbounded (pair with `throttle` when bounds matter).

use futures::StreamExt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::GatewayError;
use crate::ir::stream::{boxed, ChunkStream, StreamChunk};
use crate::ir::{FinishReason, Message, ResponseMetadata, StreamMode, Usage};

static DEFAULT_STREAM_MODE: OnceLock<StreamMode> = OnceLock::new();

/// Set the process-wide default stream mode. Takes effect once; returns
/// `false` if a default was already set.
pub fn set_default_stream_mode(mode: StreamMode) -> bool {
    DEFAULT_STREAM_MODE.set(mode).is_ok()
}

/// The process-wide default stream mode (`delta` unless configured).
pub fn default_stream_mode() -> StreamMode {
    DEFAULT_STREAM_MODE.get().copied().unwrap_or(StreamMode::Delta)
}

/// Re-sequence a chunk stream from 0, guarantee start-first and terminal
/// uniqueness, and compute the `accumulated` field per the effective stream
/// mode. Every stream leaving the bridge passes through here.
///
/// A terminal `error` with no prior `start` is forwarded alone; any other
/// chunk arriving before `start` gets one injected from `fallback`.
pub fn normalize(
    stream: ChunkStream,
    mode: StreamMode,
    fallback: ResponseMetadata,
) -> ChunkStream {
    boxed(async_stream::stream! {
        let mut stream = stream;
        let mut sequence: u64 = 0;
        let mut started = false;
        let mut running = String::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Start { metadata, .. } => {
                    if started {
                        continue;
                    }
                    started = true;
                    yield StreamChunk::Start { sequence, metadata };
                    sequence += 1;
                }
                StreamChunk::Content { delta, .. } => {
                    if !started {
                        started = true;
                        yield StreamChunk::Start {
                            sequence,
                            metadata: fallback.clone(),
                        };
                        sequence += 1;
                    }
                    running.push_str(&delta);
                    let accumulated = match mode {
                        StreamMode::Accumulated => Some(running.clone()),
                        StreamMode::Delta => None,
                    };
                    yield StreamChunk::Content {
                        sequence,
                        delta,
                        accumulated,
                    };
                    sequence += 1;
                }
                StreamChunk::ToolCallDelta {
                    id,
                    name,
                    input_delta,
                    ..
                } => {
                    if !started {
                        started = true;
                        yield StreamChunk::Start {
                            sequence,
                            metadata: fallback.clone(),
                        };
                        sequence += 1;
                    }
                    yield StreamChunk::ToolCallDelta {
                        sequence,
                        id,
                        name,
                        input_delta,
                    };
                    sequence += 1;
                }
                StreamChunk::Done {
                    finish_reason,
                    usage,
                    message,
                    ..
                } => {
                    if !started {
                        started = true;
                        yield StreamChunk::Start {
                            sequence,
                            metadata: fallback.clone(),
                        };
                        sequence += 1;
                    }
                    yield StreamChunk::Done {
                        sequence,
                        finish_reason,
                        usage,
                        message,
                    };
                    return;
                }
                StreamChunk::Error { code, message, .. } => {
                    yield StreamChunk::Error {
                        sequence,
                        code,
                        message,
                    };
                    return;
                }
            }
        }

        // Upstream ended without a terminal chunk.
        yield StreamChunk::Error {
            sequence,
            code: "stream".to_string(),
            message: "stream ended without a terminal chunk".to_string(),
        };
    })
}

/// Everything a finished stream said, in one value.
#[derive(Debug, Clone)]
pub struct Collected {
    /// Concatenation of all content deltas.
    pub content: String,
    /// The assembled final message from `done`.
    pub message: Option<Message>,
    /// Every chunk observed, in order.
    pub chunks: Vec<StreamChunk>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub request_id: Option<String>,
}

/// Drain a stream to completion. A terminal `error` chunk becomes a typed
/// error return.
pub async fn collect(stream: ChunkStream) -> Result<Collected, GatewayError> {
    process(stream, StreamCallbacks::default()).await
}

/// Callbacks observed while draining a stream. Chain `on_*` setters onto
/// `StreamCallbacks::default()`.
#[derive(Default)]
pub struct StreamCallbacks {
    on_start: Option<Box<dyn Fn(&ResponseMetadata) + Send>>,
    on_content: Option<Box<dyn Fn(&str) + Send>>,
    on_done: Option<Box<dyn Fn(&Message, FinishReason) + Send>>,
    on_error: Option<Box<dyn Fn(&str, &str) + Send>>,
}

impl StreamCallbacks {
    pub fn on_start<F: Fn(&ResponseMetadata) + Send + 'static>(mut self, f: F) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_content<F: Fn(&str) + Send + 'static>(mut self, f: F) -> Self {
        self.on_content = Some(Box::new(f));
        self
    }

    pub fn on_done<F: Fn(&Message, FinishReason) + Send + 'static>(mut self, f: F) -> Self {
        self.on_done = Some(Box::new(f));
        self
    }

    pub fn on_error<F: Fn(&str, &str) + Send + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Drain a stream, invoking callbacks along the way.
pub async fn process(
    mut stream: ChunkStream,
    callbacks: StreamCallbacks,
) -> Result<Collected, GatewayError> {
    let mut collected = Collected {
        content: String::new(),
        message: None,
        chunks: Vec::new(),
        finish_reason: None,
        usage: None,
        request_id: None,
    };

    while let Some(chunk) = stream.next().await {
        collected.chunks.push(chunk.clone());
        match &chunk {
            StreamChunk::Start { metadata, .. } => {
                collected.request_id = Some(metadata.request_id.clone());
                if let Some(f) = &callbacks.on_start {
                    f(metadata);
                }
            }
            StreamChunk::Content { delta, .. } => {
                collected.content.push_str(delta);
                if let Some(f) = &callbacks.on_content {
                    f(delta);
                }
            }
            StreamChunk::ToolCallDelta { .. } => {}
            StreamChunk::Done {
                finish_reason,
                usage,
                message,
                ..
            } => {
                collected.finish_reason = Some(*finish_reason);
                collected.usage = *usage;
                collected.message = Some(message.clone());
                if let Some(f) = &callbacks.on_done {
                    f(message, *finish_reason);
                }
                return Ok(collected);
            }
            StreamChunk::Error { code, message, .. } => {
                if let Some(f) = &callbacks.on_error {
                    f(code, message);
                }
                return Err(GatewayError::from_chunk(code, message));
            }
        }
    }

    Err(GatewayError::Stream {
        message: "stream ended without a terminal chunk".to_string(),
    })
}

/// Content deltas only; everything else (including errors) is dropped.
pub fn to_text(stream: ChunkStream) -> std::pin::Pin<Box<dyn futures::Stream<Item = String> + Send>> {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Content { delta, .. } => yield delta,
                c if c.is_terminal() => return,
                _ => {}
            }
        }
    })
}

/// Buffer content across chunks and yield complete lines; the trailing
/// partial line is flushed at the terminal chunk.
pub fn to_lines(stream: ChunkStream) -> std::pin::Pin<Box<dyn futures::Stream<Item = String> + Send>> {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Content { delta, .. } => {
                    buffer.push_str(&delta);
                    while let Some(newline) = buffer.find('\n') {
                        let line: String = buffer.drain(..=newline).collect();
                        yield line.trim_end_matches('\n').to_string();
                    }
                }
                c if c.is_terminal() => {
                    if !buffer.is_empty() {
                        yield std::mem::take(&mut buffer);
                    }
                    return;
                }
                _ => {}
            }
        }
        if !buffer.is_empty() {
            yield buffer;
        }
    })
}

/// Coalesce content deltas within each interval into one merged content
/// chunk. Non-content chunks pass through immediately; pending content is
/// flushed before any terminal chunk (flush-on-terminal). Output is
/// re-sequenced to stay gapless after merging.
pub fn throttle(stream: ChunkStream, interval: Duration) -> ChunkStream {
    boxed(async_stream::stream! {
        enum Step {
            Next(Option<StreamChunk>),
            IntervalElapsed,
        }

        let mut stream = stream;
        let mut sequence: u64 = 0;
        let mut pending_delta = String::new();
        let mut pending_accumulated: Option<String> = None;
        let mut deadline = tokio::time::Instant::now() + interval;

        loop {
            let step = tokio::select! {
                next = stream.next() => Step::Next(next),
                _ = tokio::time::sleep_until(deadline) => Step::IntervalElapsed,
            };
            match step {
                Step::Next(Some(StreamChunk::Content { delta, accumulated, .. })) => {
                    pending_delta.push_str(&delta);
                    if accumulated.is_some() {
                        pending_accumulated = accumulated;
                    }
                }
                Step::Next(Some(chunk)) => {
                    let terminal = chunk.is_terminal();
                    if !pending_delta.is_empty() {
                        yield StreamChunk::Content {
                            sequence,
                            delta: std::mem::take(&mut pending_delta),
                            accumulated: pending_accumulated.take(),
                        };
                        sequence += 1;
                    }
                    yield chunk.with_sequence(sequence);
                    sequence += 1;
                    if terminal {
                        return;
                    }
                }
                Step::Next(None) => {
                    if !pending_delta.is_empty() {
                        yield StreamChunk::Content {
                            sequence,
                            delta: std::mem::take(&mut pending_delta),
                            accumulated: pending_accumulated.take(),
                        };
                    }
                    return;
                }
                Step::IntervalElapsed => {
                    if !pending_delta.is_empty() {
                        yield StreamChunk::Content {
                            sequence,
                            delta: std::mem::take(&mut pending_delta),
                            accumulated: pending_accumulated.take(),
                        };
                        sequence += 1;
                    }
                    deadline = tokio::time::Instant::now() + interval;
                }
            }
        }
    })
}

/// Split one stream into `n` independent consumers. Each consumer has its own
/// unbounded queue: a slow consumer's queue grows without limit, which is the
/// documented trade-off of this utility.
pub fn tee(stream: ChunkStream, n: usize) -> Vec<ChunkStream> {
    let mut senders = Vec::with_capacity(n);
    let mut outputs: Vec<ChunkStream> = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        senders.push(tx);
        outputs.push(boxed(UnboundedReceiverStream::new(rx)));
    }

    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            for tx in &senders {
                // A dropped consumer just stops receiving.
                let _ = tx.send(chunk.clone());
            }
        }
    });

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::stream::boxed;

    fn raw_stream(chunks: Vec<StreamChunk>) -> ChunkStream {
        boxed(futures::stream::iter(chunks))
    }

    fn meta() -> ResponseMetadata {
        ResponseMetadata {
            request_id: "req-1".to_string(),
            ..ResponseMetadata::default()
        }
    }

    fn content(sequence: u64, delta: &str) -> StreamChunk {
        StreamChunk::Content {
            sequence,
            delta: delta.to_string(),
            accumulated: None,
        }
    }

    fn done(sequence: u64, text: &str) -> StreamChunk {
        StreamChunk::Done {
            sequence,
            finish_reason: FinishReason::Stop,
            usage: None,
            message: Message::assistant(text),
        }
    }

    fn hello_world_stream() -> ChunkStream {
        raw_stream(vec![
            StreamChunk::Start {
                sequence: 0,
                metadata: meta(),
            },
            content(1, "He"),
            content(2, "llo"),
            content(3, " world"),
            done(4, "Hello world"),
        ])
    }

    #[tokio::test]
    async fn accumulated_mode_carries_running_total() {
        let normalized = normalize(hello_world_stream(), StreamMode::Accumulated, meta());
        let chunks: Vec<_> = normalized.collect().await;

        let accumulated: Vec<_> = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Content { accumulated, .. } => accumulated.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(accumulated, vec!["He", "Hello", "Hello world"]);
    }

    #[tokio::test]
    async fn delta_mode_strips_accumulated() {
        let normalized = normalize(hello_world_stream(), StreamMode::Delta, meta());
        let chunks: Vec<_> = normalized.collect().await;
        assert!(chunks.iter().all(|c| !matches!(
            c,
            StreamChunk::Content {
                accumulated: Some(_),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn normalize_resequences_gapless_from_zero() {
        let gappy = raw_stream(vec![
            StreamChunk::Start {
                sequence: 7,
                metadata: meta(),
            },
            content(9, "a"),
            content(20, "b"),
            done(99, "ab"),
        ]);
        let chunks: Vec<_> = normalize(gappy, StreamMode::Delta, meta()).collect().await;
        let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence()).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert!(matches!(chunks[0], StreamChunk::Start { .. }));
        assert!(chunks.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn normalize_injects_start_and_synthesizes_missing_terminal() {
        let headless = raw_stream(vec![content(0, "hi")]);
        let chunks: Vec<_> = normalize(headless, StreamMode::Delta, meta())
            .collect()
            .await;
        assert!(matches!(chunks[0], StreamChunk::Start { .. }));
        assert!(matches!(chunks[2], StreamChunk::Error { .. }));
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn normalize_allows_bare_error() {
        let failing = raw_stream(vec![StreamChunk::Error {
            sequence: 0,
            code: "provider".to_string(),
            message: "boom".to_string(),
        }]);
        let chunks: Vec<_> = normalize(failing, StreamMode::Delta, meta()).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], StreamChunk::Error { .. }));
    }

    #[tokio::test]
    async fn normalize_drops_chunks_after_terminal() {
        let chatty = raw_stream(vec![
            StreamChunk::Start {
                sequence: 0,
                metadata: meta(),
            },
            done(1, ""),
            content(2, "late"),
        ]);
        let chunks: Vec<_> = normalize(chatty, StreamMode::Delta, meta()).collect().await;
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn collect_assembles_content() {
        let collected = collect(hello_world_stream()).await.unwrap();
        assert_eq!(collected.content, "Hello world");
        assert_eq!(collected.finish_reason, Some(FinishReason::Stop));
        assert_eq!(collected.request_id.as_deref(), Some("req-1"));
        assert_eq!(collected.chunks.len(), 5);
    }

    #[tokio::test]
    async fn collect_errors_on_error_chunk() {
        let failing = raw_stream(vec![
            StreamChunk::Start {
                sequence: 0,
                metadata: meta(),
            },
            StreamChunk::Error {
                sequence: 1,
                code: "rate_limit".to_string(),
                message: "slow down".to_string(),
            },
        ]);
        let err = collect(failing).await.unwrap_err();
        assert_eq!(err.code(), "rate_limit");
    }

    #[tokio::test]
    async fn process_runs_callbacks() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let collected = process(
            hello_world_stream(),
            StreamCallbacks::default().on_content(move |delta| {
                seen_clone.lock().unwrap().push(delta.to_string());
            }),
        )
        .await
        .unwrap();
        assert_eq!(collected.content, "Hello world");
        assert_eq!(seen.lock().unwrap().as_slice(), ["He", "llo", " world"]);
    }

    #[tokio::test]
    async fn to_lines_buffers_across_chunks() {
        let stream = raw_stream(vec![
            StreamChunk::Start {
                sequence: 0,
                metadata: meta(),
            },
            content(1, "one\ntw"),
            content(2, "o\nthr"),
            content(3, "ee"),
            done(4, "one\ntwo\nthree"),
        ]);
        let lines: Vec<_> = to_lines(stream).collect().await;
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn throttle_merges_within_interval_and_flushes_on_terminal() {
        let throttled = throttle(hello_world_stream(), Duration::from_secs(5));
        let chunks: Vec<_> = throttled.collect().await;

        // All three deltas land inside one interval: start, merged content, done.
        assert_eq!(chunks.len(), 3);
        match &chunks[1] {
            StreamChunk::Content { delta, .. } => assert_eq!(delta, "Hello world"),
            other => panic!("expected merged content, got {:?}", other),
        }
        let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence()).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn tee_gives_independent_copies() {
        let consumers = tee(hello_world_stream(), 2);
        let mut results = Vec::new();
        for consumer in consumers {
            let collected = collect(consumer).await.unwrap();
            results.push(collected.content);
        }
        assert_eq!(results, vec!["Hello world", "Hello world"]);
    }
}
