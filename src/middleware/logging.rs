// Observe-only logging through the `log` facade. Never alters IR semantics.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Instant;

use super::{Middleware, Next, RequestContext, StreamNext};
use crate::error::GatewayError;
use crate::ir::stream::{boxed, ChunkStream, StreamChunk};
use crate::ir::ChatResponse;

#[derive(Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<ChatResponse, GatewayError> {
        let request_id = ctx.request.metadata.request_id.clone();
        let model = ctx.request.parameters.model.clone().unwrap_or_default();
        let started = Instant::now();
        log::info!("chat request {} model={}", request_id, model);

        match next.run(ctx).await {
            Ok(response) => {
                log::info!(
                    "chat response {} finish={:?} latency={}ms",
                    request_id,
                    response.finish_reason,
                    started.elapsed().as_millis()
                );
                Ok(response)
            }
            Err(err) => {
                log::warn!("chat request {} failed: {}", request_id, err);
                Err(err)
            }
        }
    }

    async fn handle_stream(
        &self,
        ctx: RequestContext,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, GatewayError> {
        let request_id = ctx.request.metadata.request_id.clone();
        let started = Instant::now();
        log::info!("chat stream {} opened", request_id);

        let inner = next.run(ctx).await?;
        Ok(boxed(async_stream::stream! {
            let mut inner = inner;
            while let Some(chunk) = inner.next().await {
                match &chunk {
                    StreamChunk::Done { finish_reason, .. } => {
                        log::info!(
                            "chat stream {} done finish={:?} latency={}ms",
                            request_id,
                            finish_reason,
                            started.elapsed().as_millis()
                        );
                    }
                    StreamChunk::Error { code, message, .. } => {
                        log::warn!("chat stream {} error {}: {}", request_id, code, message);
                    }
                    _ => {}
                }
                yield chunk;
            }
        }))
    }
}
