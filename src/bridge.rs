// The Bridge composes one Frontend with one Backend (or Router) and threads
// the middleware chain around both unary and streaming dispatch. It owns the
// cross-cutting duties: request ids, provenance, validation, timeouts as
// cancellation, usage estimation, and stream-invariant normalization.

use futures::Stream;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    Backend, CostEstimate, DialectStream, Frontend, ListModelsResult, ModelFilter,
};
use crate::error::GatewayError;
use crate::ir::stream::ChunkStream;
use crate::ir::{
    estimate_usage, warning, ChatRequest, ChatResponse, ResponseMetadata, StreamMode, Warning,
};
use crate::middleware::{
    Middleware, Next, RequestContext, StreamNext, StreamingHandler, UnaryHandler,
};
use crate::structured::{
    self, ObjectOptions, ObjectResult, ObjectStreamEvent,
};
use crate::tool_loop::{run_tool_loop, ToolLoopConfig, ToolLoopResult};

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Bridge-level stream mode, between the per-request setting and the
    /// process-wide default.
    pub stream_mode: Option<StreamMode>,
    /// Fill in missing usage from the 4-chars-per-token heuristic.
    pub estimate_usage: bool,
    /// Overall deadline; fires the request's cancellation handle.
    pub timeout: Option<Duration>,
}

pub struct Bridge<F: Frontend> {
    frontend: F,
    backend: Arc<dyn Backend>,
    middleware: Vec<Arc<dyn Middleware>>,
    config: BridgeConfig,
}

struct Dispatch<'a> {
    backend: &'a dyn Backend,
}

#[async_trait::async_trait]
impl UnaryHandler for Dispatch<'_> {
    async fn call(&self, ctx: RequestContext) -> Result<ChatResponse, GatewayError> {
        self.backend.execute(ctx.request, ctx.cancel).await
    }
}

#[async_trait::async_trait]
impl StreamingHandler for Dispatch<'_> {
    async fn call(&self, ctx: RequestContext) -> Result<ChunkStream, GatewayError> {
        self.backend.execute_stream(ctx.request, ctx.cancel).await
    }
}

impl<F: Frontend> Bridge<F> {
    pub fn new(frontend: F, backend: Arc<dyn Backend>) -> Self {
        Self {
            frontend,
            backend,
            middleware: Vec::new(),
            config: BridgeConfig::default(),
        }
    }

    /// Register a middleware layer. The first registered is outermost.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Assign ids and provenance, then check structural invariants.
    fn prepare(&self, mut request: ChatRequest) -> Result<ChatRequest, GatewayError> {
        if request.metadata.request_id.is_empty() {
            request.metadata.request_id = uuid::Uuid::new_v4().to_string();
        }
        if request.metadata.provenance.frontend.is_none() {
            request.metadata.provenance.frontend = Some(self.frontend.metadata().name.clone());
        }
        request.metadata.provenance.backend = Some(self.backend.metadata().name.clone());
        request.validate()?;
        Ok(request)
    }

    /// First defined wins: request, bridge config, process default.
    fn effective_stream_mode(&self, request: &ChatRequest) -> StreamMode {
        request
            .stream_mode
            .or(self.config.stream_mode)
            .unwrap_or_else(crate::stream::default_stream_mode)
    }

    /// Arm the timeout timer: a deadline that fires the cancellation handle.
    fn arm_timeout(&self, cancel: &CancellationToken) {
        if let Some(limit) = self.config.timeout {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => token.cancel(),
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Unary
    // ------------------------------------------------------------------

    pub async fn chat(&self, inbound: F::Request) -> Result<F::Response, GatewayError> {
        self.chat_with_cancel(inbound, CancellationToken::new())
            .await
    }

    pub async fn chat_with_cancel(
        &self,
        inbound: F::Request,
        cancel: CancellationToken,
    ) -> Result<F::Response, GatewayError> {
        let ir = self.frontend.to_ir(inbound.clone())?;
        let response = self.chat_ir_with_cancel(ir, cancel).await?;
        self.frontend.from_ir(response, &inbound)
    }

    pub async fn chat_ir(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        self.chat_ir_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn chat_ir_with_cancel(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let request = self.prepare(request)?;
        let dispatch = Dispatch {
            backend: self.backend.as_ref(),
        };
        let ctx = RequestContext::new(request.clone(), cancel.clone());
        let chain = Next::new(&self.middleware, &dispatch).run(ctx);

        let mut response = match self.config.timeout {
            Some(limit) => {
                tokio::select! {
                    out = chain => out?,
                    _ = tokio::time::sleep(limit) => {
                        cancel.cancel();
                        return Err(GatewayError::Timeout {
                            message: format!("request exceeded {:?}", limit),
                        });
                    }
                }
            }
            None => chain.await?,
        };

        if self.config.estimate_usage && response.usage.is_none() {
            response.usage = Some(estimate_usage(&request, &response.message.content.text()));
            response.metadata.warnings.push(Warning::new(
                warning::ESTIMATED_USAGE,
                "usage estimated at 4 characters per token",
            ));
        }
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    pub async fn chat_stream(
        &self,
        inbound: F::Request,
    ) -> Result<DialectStream<F::StreamItem>, GatewayError> {
        self.chat_stream_with_cancel(inbound, CancellationToken::new())
            .await
    }

    pub async fn chat_stream_with_cancel(
        &self,
        inbound: F::Request,
        cancel: CancellationToken,
    ) -> Result<DialectStream<F::StreamItem>, GatewayError> {
        let ir = self.frontend.to_ir(inbound.clone())?;
        let stream = self.chat_stream_ir_with_cancel(ir, cancel).await?;
        Ok(self.frontend.stream_from_ir(stream, &inbound))
    }

    pub async fn chat_stream_ir(&self, request: ChatRequest) -> Result<ChunkStream, GatewayError> {
        self.chat_stream_ir_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn chat_stream_ir_with_cancel(
        &self,
        mut request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GatewayError> {
        request.stream = true;
        let request = self.prepare(request)?;
        let mode = self.effective_stream_mode(&request);
        let fallback_metadata = ResponseMetadata::for_request(&request);
        self.arm_timeout(&cancel);

        let dispatch = Dispatch {
            backend: self.backend.as_ref(),
        };
        let ctx = RequestContext::new(request, cancel);
        let stream = match StreamNext::new(&self.middleware, &dispatch).run(ctx).await {
            Ok(stream) => stream,
            // Cancellation surfaces in-stream: one terminal `aborted` chunk,
            // never an exception from the stream constructor.
            Err(GatewayError::Cancelled) => {
                return Ok(crate::ir::stream::boxed(futures::stream::iter(vec![
                    crate::ir::stream::StreamChunk::aborted(0),
                ])))
            }
            Err(err) => return Err(err),
        };
        Ok(crate::stream::normalize(stream, mode, fallback_metadata))
    }

    // ------------------------------------------------------------------
    // Structured output
    // ------------------------------------------------------------------

    pub async fn generate_object<T>(
        &self,
        request: ChatRequest,
        options: ObjectOptions,
    ) -> Result<ObjectResult<T>, GatewayError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let spec = structured::schema_spec_for::<T>(&options)?;
        let prepared = structured::build_request(request, &spec);
        let response = self.chat_ir(prepared).await?;
        structured::finish::<T>(&spec, response)
    }

    pub async fn generate_object_stream<T>(
        &self,
        request: ChatRequest,
        options: ObjectOptions,
    ) -> Result<impl Stream<Item = Result<ObjectStreamEvent<T>, GatewayError>> + Send, GatewayError>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        let spec = structured::schema_spec_for::<T>(&options)?;
        let prepared = structured::build_request(request, &spec);
        let stream = self.chat_stream_ir(prepared).await?;
        Ok(structured::generate_object_stream::<T>(stream, spec))
    }

    // ------------------------------------------------------------------
    // Tools, models, cost
    // ------------------------------------------------------------------

    /// Auto-execute tool calls until the model stops asking, within the
    /// configured round budget.
    pub async fn chat_with_tools(
        &self,
        request: ChatRequest,
        config: ToolLoopConfig,
    ) -> Result<ToolLoopResult, GatewayError> {
        run_tool_loop(|r| self.chat_ir(r), request, config).await
    }

    pub async fn list_models(
        &self,
        filter: Option<&ModelFilter>,
    ) -> Result<ListModelsResult, GatewayError> {
        self.backend.list_models(filter).await
    }

    pub fn estimate_cost(&self, request: &ChatRequest) -> Option<CostEstimate> {
        self.backend.estimate_cost(request)
    }
}
