// Response cache keyed by a caller-supplied function over the IR request.
// Hits return a deep copy. Streams are not cached unless enabled, in which
// case a completed stream is recorded chunk-by-chunk and replayed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Middleware, Next, RequestContext, StreamNext};
use crate::error::GatewayError;
use crate::ir::stream::{boxed, ChunkStream, StreamChunk};
use crate::ir::{ChatRequest, ChatResponse};

pub type CacheKeyFn = dyn Fn(&ChatRequest) -> Option<String> + Send + Sync;

/// Default key: the semantic payload of the request (messages, parameters,
/// tools), excluding metadata so identical requests share an entry. Returns
/// `None` (uncacheable) when serialization fails.
pub fn semantic_key(request: &ChatRequest) -> Option<String> {
    let payload = serde_json::json!({
        "messages": request.messages,
        "parameters": request.parameters,
        "tools": request.tools,
        "toolChoice": request.tool_choice,
    });
    serde_json::to_string(&payload).ok()
}

pub struct CacheMiddleware {
    key_fn: Box<CacheKeyFn>,
    responses: Mutex<HashMap<String, ChatResponse>>,
    streams: Arc<Mutex<HashMap<String, Vec<StreamChunk>>>>,
    cache_streams: bool,
}

impl CacheMiddleware {
    pub fn new() -> Self {
        Self::with_key_fn(semantic_key)
    }

    pub fn with_key_fn<F>(key_fn: F) -> Self
    where
        F: Fn(&ChatRequest) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            key_fn: Box::new(key_fn),
            responses: Mutex::new(HashMap::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            cache_streams: false,
        }
    }

    /// Opt in to collecting completed streams and replaying them on hits.
    pub fn cache_streams(mut self) -> Self {
        self.cache_streams = true;
        self
    }

    pub fn invalidate_all(&self) {
        self.responses.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for CacheMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn handle(
        &self,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<ChatResponse, GatewayError> {
        let key = match (self.key_fn)(&ctx.request) {
            Some(key) => key,
            None => return next.run(ctx).await,
        };

        if let Some(hit) = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            log::debug!("cache hit for request {}", ctx.request.metadata.request_id);
            return Ok(hit.clone());
        }

        let response = next.run(ctx).await?;
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, response.clone());
        Ok(response)
    }

    async fn handle_stream(
        &self,
        ctx: RequestContext,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, GatewayError> {
        if !self.cache_streams {
            return next.run(ctx).await;
        }
        let key = match (self.key_fn)(&ctx.request) {
            Some(key) => key,
            None => return next.run(ctx).await,
        };

        let replay = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        if let Some(chunks) = replay {
            return Ok(boxed(futures::stream::iter(chunks)));
        }

        let inner = next.run(ctx).await?;
        let store = self.streams.clone();
        Ok(boxed(async_stream::stream! {
            let mut inner = inner;
            let mut recorded: Vec<StreamChunk> = Vec::new();
            let mut completed = false;
            use futures::StreamExt;
            while let Some(chunk) = inner.next().await {
                recorded.push(chunk.clone());
                if matches!(chunk, StreamChunk::Done { .. }) {
                    completed = true;
                }
                yield chunk;
            }
            // Only streams that finished with `done` are worth replaying.
            if completed {
                store
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key, recorded);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, Message, ResponseMetadata};
    use crate::middleware::UnaryHandler;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Counting(AtomicU32);

    #[async_trait]
    impl UnaryHandler for Counting {
        async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                message: Message::assistant("cached?"),
                finish_reason: FinishReason::Stop,
                usage: None,
                metadata: ResponseMetadata::for_request(&ctx.request),
                raw: None,
            })
        }
    }

    fn ctx(text: &str) -> RequestContext {
        RequestContext::new(
            ChatRequest::new(vec![Message::user(text)]),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn second_identical_request_hits_without_dispatch() {
        let cache = CacheMiddleware::new();
        let terminal = Counting(AtomicU32::new(0));
        let chain = Vec::new();

        let first = cache
            .handle(ctx("same"), Next::new(&chain, &terminal))
            .await
            .unwrap();
        let second = cache
            .handle(ctx("same"), Next::new(&chain, &terminal))
            .await
            .unwrap();

        assert_eq!(terminal.0.load(Ordering::SeqCst), 1);
        assert_eq!(first.message, second.message);
    }

    #[tokio::test]
    async fn different_requests_miss() {
        let cache = CacheMiddleware::new();
        let terminal = Counting(AtomicU32::new(0));
        let chain = Vec::new();

        cache
            .handle(ctx("a"), Next::new(&chain, &terminal))
            .await
            .unwrap();
        cache
            .handle(ctx("b"), Next::new(&chain, &terminal))
            .await
            .unwrap();
        assert_eq!(terminal.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncacheable_key_bypasses() {
        let cache = CacheMiddleware::with_key_fn(|_| None);
        let terminal = Counting(AtomicU32::new(0));
        let chain = Vec::new();

        cache
            .handle(ctx("same"), Next::new(&chain, &terminal))
            .await
            .unwrap();
        cache
            .handle(ctx("same"), Next::new(&chain, &terminal))
            .await
            .unwrap();
        assert_eq!(terminal.0.load(Ordering::SeqCst), 2);
    }
}
