// Pre-dispatch validation and optional PII redaction. Rejections happen
// before `next()` runs; redaction substitutes message text and forwards a new
// request carrying the same id.

use async_trait::async_trait;

use super::{Middleware, Next, RequestContext, StreamNext};
use crate::error::GatewayError;
use crate::ir::stream::ChunkStream;
use crate::ir::{ChatRequest, ChatResponse, ContentBlock, MessageContent};

type ValidatorFn = dyn Fn(&ChatRequest) -> Result<(), GatewayError> + Send + Sync;
type RedactorFn = dyn Fn(&str) -> String + Send + Sync;

#[derive(Default)]
pub struct ValidationMiddleware {
    validator: Option<Box<ValidatorFn>>,
    redactor: Option<Box<RedactorFn>>,
}

impl ValidationMiddleware {
    /// Structural IR validation only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a caller-supplied check run after the structural one.
    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<(), GatewayError> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(f));
        self
    }

    /// Substitute message text before dispatch (PII scrubbing).
    pub fn with_redactor<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.redactor = Some(Box::new(f));
        self
    }

    fn check_and_redact(&self, ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        ctx.request.validate()?;
        if let Some(validator) = &self.validator {
            validator(&ctx.request)?;
        }

        let Some(redactor) = &self.redactor else {
            return Ok(ctx);
        };
        let mut request = ctx.request;
        for message in &mut request.messages {
            match &mut message.content {
                MessageContent::Text(text) => *text = redactor(text),
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        if let ContentBlock::Text { text } = block {
                            *text = redactor(text);
                        }
                    }
                }
            }
        }
        Ok(RequestContext::new(request, ctx.cancel))
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(
        &self,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<ChatResponse, GatewayError> {
        next.run(self.check_and_redact(ctx)?).await
    }

    async fn handle_stream(
        &self,
        ctx: RequestContext,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, GatewayError> {
        next.run(self.check_and_redact(ctx)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, Message, ResponseMetadata};
    use crate::middleware::UnaryHandler;
    use tokio_util::sync::CancellationToken;

    struct EchoPrompt;

    #[async_trait]
    impl UnaryHandler for EchoPrompt {
        async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
            Ok(ChatResponse {
                message: Message::assistant(ctx.request.messages[0].content.text()),
                finish_reason: FinishReason::Stop,
                usage: None,
                metadata: ResponseMetadata::for_request(&ctx.request),
                raw: None,
            })
        }
    }

    #[tokio::test]
    async fn empty_messages_rejected_before_dispatch() {
        let middleware = ValidationMiddleware::new();
        let ctx = RequestContext::new(ChatRequest::new(vec![]), CancellationToken::new());
        let chain = Vec::new();
        let err = middleware
            .handle(ctx, Next::new(&chain, &EchoPrompt))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn redaction_substitutes_before_next() {
        let middleware = ValidationMiddleware::new()
            .with_redactor(|text| text.replace("555-0100", "[phone]"));
        let ctx = RequestContext::new(
            ChatRequest::new(vec![Message::user("call me at 555-0100")]),
            CancellationToken::new(),
        );
        let chain = Vec::new();
        let response = middleware
            .handle(ctx, Next::new(&chain, &EchoPrompt))
            .await
            .unwrap();
        assert_eq!(response.message.content.text(), "call me at [phone]");
    }
}
