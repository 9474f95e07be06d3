// Onion-model middleware. The first registered middleware is outermost; each
// layer receives the context plus a `Next` handle and decides whether, when,
// and how often to invoke the rest of the chain. Two shapes exist: unary
// (returns a response) and streaming (returns a lazy chunk stream).

pub mod cache;
pub mod logging;
pub mod retry;
pub mod transform;
pub mod validation;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::ir::stream::ChunkStream;
use crate::ir::{ChatRequest, ChatResponse};

/// What a middleware sees: the IR request plus the request's cancellation
/// handle. Middleware that rewrites the request builds a new context; the
/// request id must be carried over unchanged.
#[derive(Clone)]
pub struct RequestContext {
    pub request: ChatRequest,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(request: ChatRequest, cancel: CancellationToken) -> Self {
        Self { request, cancel }
    }
}

/// A middleware layer. Both methods default to pass-through, so a middleware
/// that only cares about one shape implements one method.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<ChatResponse, GatewayError> {
        next.run(ctx).await
    }

    /// Streaming shape. Implementations that wrap the chunk stream must keep
    /// sequences monotonic (re-sequence when reordering) and keep the
    /// terminal chunk unique.
    async fn handle_stream(
        &self,
        ctx: RequestContext,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, GatewayError> {
        next.run(ctx).await
    }
}

/// Innermost handler of the unary chain (the bridge's dispatch).
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError>;
}

/// Innermost handler of the streaming chain.
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    async fn call(&self, ctx: RequestContext) -> Result<ChunkStream, GatewayError>;
}

/// Continuation into the rest of the unary chain. Copyable so middleware such
/// as retry can invoke it more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn UnaryHandler,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], terminal: &'a dyn UnaryHandler) -> Self {
        Self { chain, terminal }
    }

    pub async fn run(self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
        if ctx.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

/// Continuation into the rest of the streaming chain.
#[derive(Clone, Copy)]
pub struct StreamNext<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn StreamingHandler,
}

impl<'a> StreamNext<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], terminal: &'a dyn StreamingHandler) -> Self {
        Self { chain, terminal }
    }

    pub async fn run(self, ctx: RequestContext) -> Result<ChunkStream, GatewayError> {
        if ctx.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle_stream(
                    ctx,
                    StreamNext {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, Message, ResponseMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tag(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(
            &self,
            ctx: RequestContext,
            next: Next<'_>,
        ) -> Result<ChatResponse, GatewayError> {
            self.1.lock().unwrap().push(self.0);
            let out = next.run(ctx).await;
            self.1.lock().unwrap().push(self.0);
            out
        }
    }

    struct Echo(AtomicUsize);

    #[async_trait]
    impl UnaryHandler for Echo {
        async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                message: Message::assistant("pong"),
                finish_reason: FinishReason::Stop,
                usage: None,
                metadata: ResponseMetadata::for_request(&ctx.request),
                raw: None,
            })
        }
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tag("outer", order.clone())),
            Arc::new(Tag("inner", order.clone())),
        ];
        let terminal = Echo(AtomicUsize::new(0));
        let ctx = RequestContext::new(
            ChatRequest::new(vec![Message::user("ping")]),
            CancellationToken::new(),
        );

        Next::new(&chain, &terminal).run(ctx).await.unwrap();
        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["outer", "inner", "inner", "outer"]
        );
    }

    #[tokio::test]
    async fn cancelled_context_never_reaches_the_terminal() {
        let chain: Vec<Arc<dyn Middleware>> = Vec::new();
        let terminal = Echo(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = RequestContext::new(ChatRequest::new(vec![Message::user("ping")]), cancel);

        let err = Next::new(&chain, &terminal).run(ctx).await.unwrap_err();
        assert_eq!(err.code(), "aborted");
        assert_eq!(terminal.0.load(Ordering::SeqCst), 0);
    }
}
