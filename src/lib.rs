//! crosswire: a provider-agnostic chat-completion gateway.
//!
//! A request arrives in one vendor's dialect, is lowered by a [`Frontend`]
//! into a neutral IR, runs through a middleware chain and a [`Backend`]
//! (optionally a [`Router`] over several), and comes back as a single
//! response or a stream of chunks in the caller's own dialect.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crosswire::backend::anthropic::AnthropicBackend;
//! use crosswire::frontend::openai::OpenAiFrontend;
//! use crosswire::Bridge;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(AnthropicBackend::new(std::env::var("ANTHROPIC_API_KEY")?)?);
//! let bridge = Bridge::new(OpenAiFrontend::new(), backend);
//!
//! let inbound: crosswire::wire::openai::ChatCompletionRequest = serde_json::from_str(
//!     r#"{"model": "claude-sonnet-4-5", "messages": [{"role": "user", "content": "ping"}]}"#,
//! )?;
//! let response = bridge.chat(inbound).await?;
//! println!("{}", serde_json::to_string(&response)?);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backend;
pub mod bridge;
pub mod error;
pub mod frontend;
pub mod ir;
pub mod middleware;
pub mod model_cache;
pub mod normalize;
pub mod router;
pub mod stream;
pub mod structured;
pub mod tool_loop;
pub mod wire;

#[cfg(test)]
mod tests;

// Re-export the types most callers touch.
pub use adapter::{
    AdapterMetadata, Backend, Capabilities, Frontend, ListModelsResult, ModelFilter, ModelInfo,
    SystemMessageStrategy,
};
pub use bridge::{Bridge, BridgeConfig};
pub use error::GatewayError;
pub use ir::stream::{ChunkStream, StreamChunk};
pub use ir::{
    ChatRequest, ChatResponse, ContentBlock, FinishReason, Message, MessageContent, Role,
    StreamMode, Usage,
};
pub use router::{Router, RouterConfig, RouterEvent, Strategy};
pub use structured::{ObjectOptions, ObjectResult, ObjectStreamEvent};
pub use tool_loop::{ToolLoopConfig, ToolLoopResult};
