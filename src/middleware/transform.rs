// Pure IR-in/IR-out rewriting of requests and/or responses. The request id
// is pinned: whatever a transform does to metadata, the original id is
// restored before the request continues downstream.

use async_trait::async_trait;

use super::{Middleware, Next, RequestContext, StreamNext};
use crate::error::GatewayError;
use crate::ir::stream::ChunkStream;
use crate::ir::{ChatRequest, ChatResponse};

type RequestFn = dyn Fn(ChatRequest) -> ChatRequest + Send + Sync;
type ResponseFn = dyn Fn(ChatResponse) -> ChatResponse + Send + Sync;

#[derive(Default)]
pub struct TransformMiddleware {
    request: Option<Box<RequestFn>>,
    response: Option<Box<ResponseFn>>,
}

impl TransformMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_request<F>(mut self, f: F) -> Self
    where
        F: Fn(ChatRequest) -> ChatRequest + Send + Sync + 'static,
    {
        self.request = Some(Box::new(f));
        self
    }

    pub fn map_response<F>(mut self, f: F) -> Self
    where
        F: Fn(ChatResponse) -> ChatResponse + Send + Sync + 'static,
    {
        self.response = Some(Box::new(f));
        self
    }

    fn apply_request(&self, ctx: RequestContext) -> RequestContext {
        match &self.request {
            Some(f) => {
                let request_id = ctx.request.metadata.request_id.clone();
                let mut request = f(ctx.request);
                request.metadata.request_id = request_id;
                RequestContext::new(request, ctx.cancel)
            }
            None => ctx,
        }
    }
}

#[async_trait]
impl Middleware for TransformMiddleware {
    async fn handle(
        &self,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<ChatResponse, GatewayError> {
        let response = next.run(self.apply_request(ctx)).await?;
        Ok(match &self.response {
            Some(f) => f(response),
            None => response,
        })
    }

    async fn handle_stream(
        &self,
        ctx: RequestContext,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, GatewayError> {
        next.run(self.apply_request(ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, Message, ResponseMetadata};
    use crate::middleware::UnaryHandler;
    use tokio_util::sync::CancellationToken;

    struct EchoModel;

    #[async_trait]
    impl UnaryHandler for EchoModel {
        async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
            Ok(ChatResponse {
                message: Message::assistant(
                    ctx.request.parameters.model.clone().unwrap_or_default(),
                ),
                finish_reason: FinishReason::Stop,
                usage: None,
                metadata: ResponseMetadata::for_request(&ctx.request),
                raw: None,
            })
        }
    }

    #[tokio::test]
    async fn request_transform_cannot_change_the_request_id() {
        let transform = TransformMiddleware::new().map_request(|mut request| {
            request.parameters.model = Some("rewritten".to_string());
            request.metadata.request_id = "hijacked".to_string();
            request
        });

        let request = ChatRequest::new(vec![Message::user("hi")]);
        let original_id = request.metadata.request_id.clone();
        let ctx = RequestContext::new(request, CancellationToken::new());
        let chain = Vec::new();
        let terminal = EchoModel;

        let response = transform
            .handle(ctx, Next::new(&chain, &terminal))
            .await
            .unwrap();
        assert_eq!(response.message.content.text(), "rewritten");
        assert_eq!(response.metadata.request_id, original_id);
    }
}
