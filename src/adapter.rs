// Adapter contracts: a Frontend lowers an external dialect into the IR and
// raises IR results back; a Backend owns the HTTP client for one provider.
// The Router implements Backend too, which is what lets a Bridge hold either.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::ir::stream::ChunkStream;
use crate::ir::{ChatRequest, ChatResponse};

// ============================================================================
// Metadata and capabilities
// ============================================================================

/// How a provider expects system messages to be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemMessageStrategy {
    /// System messages stay in the message list.
    InMessages,
    /// System messages are stripped and sent as a distinct parameter.
    SeparateParameter,
    /// System text is prepended to the first user message.
    PrependedToFirstUser,
    /// The provider has no system-message concept; they are dropped.
    Unsupported,
}

/// The recognized capability set of an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub streaming: bool,
    pub multi_modal: bool,
    pub tools: bool,
    pub max_context_tokens: u32,
    pub system_message_strategy: SystemMessageStrategy,
    pub supports_multiple_system_messages: bool,
    pub supports_temperature: bool,
    pub supports_top_p: bool,
    pub supports_top_k: bool,
    pub supports_seed: bool,
    pub supports_frequency_penalty: bool,
    pub supports_presence_penalty: bool,
    pub max_stop_sequences: usize,
}

impl Default for Capabilities {
    /// Permissive defaults matching the IR itself (everything supported).
    fn default() -> Self {
        Self {
            streaming: true,
            multi_modal: true,
            tools: true,
            max_context_tokens: 128_000,
            system_message_strategy: SystemMessageStrategy::InMessages,
            supports_multiple_system_messages: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: true,
            supports_frequency_penalty: true,
            supports_presence_penalty: true,
            max_stop_sequences: 16,
        }
    }
}

/// Immutable identity of an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    pub name: String,
    pub version: String,
    pub provider: String,
    pub capabilities: Capabilities,
}

impl AdapterMetadata {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            provider: provider.into(),
            capabilities,
        }
    }
}

// ============================================================================
// Model listing
// ============================================================================

/// Where a model list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Static,
    Fetched,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListModelsResult {
    pub models: Vec<ModelInfo>,
    pub source: ModelSource,
}

/// Client-side filter over a model list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelFilter {
    pub id_prefix: Option<String>,
    pub id_contains: Option<String>,
}

impl ModelFilter {
    pub fn matches(&self, model: &ModelInfo) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !model.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.id_contains {
            if !model.id.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

impl ListModelsResult {
    pub fn filtered(mut self, filter: &ModelFilter) -> Self {
        self.models.retain(|m| filter.matches(m));
        self
    }
}

/// Rough cost estimate from the token heuristic and a configured price table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub estimated_prompt_tokens: u32,
    pub estimated_usd: f64,
}

// ============================================================================
// Contracts
// ============================================================================

/// A dialect-native stream produced by [`Frontend::stream_from_ir`].
pub type DialectStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Converts one external dialect to and from the IR.
///
/// `to_ir` must reject malformed inbound requests with a validation error
/// naming the field, and must preserve a caller-supplied request id (creating
/// one when absent). `from_ir` must be deterministic and side-effect free.
pub trait Frontend: Send + Sync {
    /// Inbound request shape of the dialect.
    type Request: Clone + Send + Sync + 'static;
    /// Outbound unary response shape.
    type Response: Send + 'static;
    /// Outbound stream event shape.
    type StreamItem: Send + 'static;

    fn metadata(&self) -> &AdapterMetadata;

    fn to_ir(&self, inbound: Self::Request) -> Result<ChatRequest, GatewayError>;

    fn from_ir(
        &self,
        response: ChatResponse,
        original: &Self::Request,
    ) -> Result<Self::Response, GatewayError>;

    /// Map an IR chunk stream onto the dialect's own start/delta/done
    /// envelope. Terminal `error` chunks must surface as dialect-native
    /// errors, never be swallowed.
    fn stream_from_ir(
        &self,
        stream: ChunkStream,
        original: &Self::Request,
    ) -> DialectStream<Self::StreamItem>;
}

/// Dispatches IR requests to one concrete provider (or, for the router, to a
/// pool of them).
#[async_trait]
pub trait Backend: Send + Sync {
    fn metadata(&self) -> &AdapterMetadata;

    /// Unary dispatch. Must honor `cancel` by aborting the in-flight HTTP
    /// call promptly and returning the cancelled error.
    async fn execute(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError>;

    /// Streaming dispatch. The returned stream yields exactly one `start`,
    /// terminates with `done` or `error`, and never interleaves requests.
    async fn execute_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GatewayError>;

    /// List the models this backend can serve. Fetched results are placed in
    /// the process-wide model cache by implementations.
    async fn list_models(
        &self,
        filter: Option<&ModelFilter>,
    ) -> Result<ListModelsResult, GatewayError> {
        let _ = filter;
        Err(GatewayError::Config(format!(
            "backend '{}' does not support listing models",
            self.metadata().name
        )))
    }

    /// Optional pre-dispatch cost estimate.
    fn estimate_cost(&self, request: &ChatRequest) -> Option<CostEstimate> {
        let _ = request;
        None
    }

    /// Active liveness probe, used by router health tracking.
    async fn health_check(&self) -> bool {
        true
    }
}
