// Cross-module scenarios: dialect-to-dialect round trips, router fallback
// behind a bridge, structured output, retry budgets, and stream caching.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterMetadata, Backend, Capabilities};
use crate::bridge::Bridge;
use crate::error::GatewayError;
use crate::frontend::passthrough::IrFrontend;
use crate::ir::stream::{boxed, ChunkStream, StreamChunk};
use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, FinishReason, Message, MessageContent,
    ResponseMetadata, Role,
};
use crate::middleware::cache::CacheMiddleware;
use crate::middleware::retry::RetryMiddleware;
use crate::router::{Router, RouterConfig};

fn init_logging() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

/// A backend that answers every request with scripted text and records what
/// it saw.
struct ScriptedBackend {
    metadata: AdapterMetadata,
    reply: String,
    calls: AtomicU32,
    seen: Mutex<Option<ChatRequest>>,
    fail_first: u32,
}

impl ScriptedBackend {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            metadata: AdapterMetadata::new("scripted", "mock", Capabilities::default()),
            reply: reply.to_string(),
            calls: AtomicU32::new(0),
            seen: Mutex::new(None),
            fail_first: 0,
        })
    }

    fn failing_first(reply: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            metadata: AdapterMetadata::new("scripted", "mock", Capabilities::default()),
            reply: reply.to_string(),
            calls: AtomicU32::new(0),
            seen: Mutex::new(None),
            fail_first: failures,
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = Some(request.clone());
        if call < self.fail_first {
            return Err(GatewayError::Provider {
                provider: "scripted".to_string(),
                status: Some(503),
                message: "overloaded".to_string(),
            });
        }
        Ok(ChatResponse {
            message: Message::assistant(self.reply.clone()),
            finish_reason: FinishReason::Stop,
            usage: None,
            metadata: ResponseMetadata::for_request(&request),
            raw: None,
        })
    }

    async fn execute_stream(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply.clone();
        let metadata = ResponseMetadata::for_request(&request);
        let mut chunks = vec![StreamChunk::Start {
            sequence: 0,
            metadata,
        }];
        let mut sequence = 1;
        for piece in reply.split_inclusive(' ') {
            chunks.push(StreamChunk::Content {
                sequence,
                delta: piece.to_string(),
                accumulated: None,
            });
            sequence += 1;
        }
        chunks.push(StreamChunk::Done {
            sequence,
            finish_reason: FinishReason::Stop,
            usage: None,
            message: Message::assistant(reply),
        });
        Ok(boxed(futures::stream::iter(chunks)))
    }
}

/// A backend that always answers with one tool call.
struct ToolCallBackend {
    metadata: AdapterMetadata,
    input: serde_json::Value,
}

impl ToolCallBackend {
    fn new(input: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            metadata: AdapterMetadata::new("tool-mock", "mock", Capabilities::default()),
            input,
        })
    }
}

#[async_trait]
impl Backend for ToolCallBackend {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let tool_name = request
            .tools
            .as_ref()
            .and_then(|tools| tools.first())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "tool".to_string());
        Ok(ChatResponse {
            message: Message::new(
                Role::Assistant,
                MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: tool_name,
                    input: self.input.clone(),
                }]),
            ),
            finish_reason: FinishReason::ToolCalls,
            usage: None,
            metadata: ResponseMetadata::for_request(&request),
            raw: None,
        })
    }

    async fn execute_stream(
        &self,
        _request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, GatewayError> {
        Err(GatewayError::Config("stream not scripted".to_string()))
    }
}

// ============================================================================
// Dialect round trips
// ============================================================================

#[cfg(feature = "openai")]
#[tokio::test]
async fn openai_dialect_request_round_trips_through_the_bridge() {
    use crate::frontend::openai::OpenAiFrontend;
    use crate::wire::openai as wire;

    let backend = ScriptedBackend::new("pong");
    let bridge = Bridge::new(OpenAiFrontend::new(), backend.clone());

    let inbound: wire::ChatCompletionRequest = serde_json::from_value(serde_json::json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "ping"}]
    }))
    .unwrap();
    let response = bridge.chat(inbound).await.unwrap();

    // The backend saw one IR user message.
    let seen = backend.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.messages.len(), 1);
    assert_eq!(seen.messages[0].role, Role::User);
    assert_eq!(seen.messages[0].content.text(), "ping");

    // The caller got an OpenAI-shaped response with non-empty content.
    assert_eq!(response.object, "chat.completion");
    match response.choices[0].message.content.as_ref().unwrap() {
        wire::MessageContent::Text(text) => assert_eq!(text, "pong"),
        other => panic!("expected text, got {:?}", other),
    }
}

#[cfg(all(feature = "openai", feature = "anthropic"))]
#[tokio::test]
async fn openai_frontend_over_anthropic_shaped_backend() {
    use crate::backend::anthropic::AnthropicBackend;
    use crate::frontend::openai::OpenAiFrontend;
    use crate::wire::{anthropic, openai};

    /// Runs requests through the real Anthropic wire conversion, answering
    /// from a canned provider payload instead of HTTP.
    struct AnthropicShaped {
        converter: AnthropicBackend,
        last_wire: Mutex<Option<anthropic::CreateMessageRequest>>,
    }

    #[async_trait]
    impl Backend for AnthropicShaped {
        fn metadata(&self) -> &AdapterMetadata {
            self.converter.metadata()
        }

        async fn execute(
            &self,
            request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChatResponse, GatewayError> {
            let (wire_request, warnings) = self.converter.from_ir(&request)?;
            *self.last_wire.lock().unwrap() = Some(wire_request.clone());
            let canned: anthropic::MessageResponse =
                serde_json::from_value(serde_json::json!({
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "model": wire_request.model,
                    "content": [{ "type": "text", "text": "pong" }],
                    "stop_reason": "end_turn",
                    "usage": { "input_tokens": 2, "output_tokens": 1 }
                }))
                .unwrap();
            self.converter.to_ir(canned, &request, 1, warnings)
        }

        async fn execute_stream(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChunkStream, GatewayError> {
            Err(GatewayError::Config("unary only".to_string()))
        }
    }

    let shaped = Arc::new(AnthropicShaped {
        converter: AnthropicBackend::new("sk-ant-test").unwrap(),
        last_wire: Mutex::new(None),
    });
    let bridge = Bridge::new(OpenAiFrontend::new(), shaped.clone());

    let inbound: openai::ChatCompletionRequest = serde_json::from_value(serde_json::json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "ping"}]
    }))
    .unwrap();
    let response = bridge.chat(inbound).await.unwrap();

    // Provider-shaped payload reached the wire.
    let wire_request = shaped.last_wire.lock().unwrap().clone().unwrap();
    assert_eq!(wire_request.messages.len(), 1);
    assert_eq!(wire_request.messages[0].role, "user");

    // And the answer came back in the OpenAI dialect.
    match response.choices[0].message.content.as_ref().unwrap() {
        openai::MessageContent::Text(text) => assert!(!text.is_empty()),
        other => panic!("expected text, got {:?}", other),
    }
    assert_eq!(response.usage.unwrap().total_tokens, 3);
}

// ============================================================================
// Router behind a bridge
// ============================================================================

#[tokio::test]
async fn bridge_over_router_falls_back_and_answers() {
    init_logging();
    let flaky = ScriptedBackend::failing_first("never", 10);
    let healthy = ScriptedBackend::new("from the healthy one");
    let router = Arc::new(
        Router::new(
            vec![flaky.clone(), healthy.clone()],
            RouterConfig::default(),
        )
        .unwrap(),
    );
    let bridge = Bridge::new(IrFrontend::new(), router);

    let response = bridge
        .chat_ir(ChatRequest::new(vec![Message::user("ping")]))
        .await
        .unwrap();
    assert_eq!(response.message.content.text(), "from the healthy one");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Retry budget
// ============================================================================

#[tokio::test]
async fn retry_middleware_spends_exactly_the_budget() {
    let backend = ScriptedBackend::failing_first("eventually", 2);
    let bridge = Bridge::new(IrFrontend::new(), backend.clone()).with_middleware(Arc::new(
        RetryMiddleware::new()
            .with_max_attempts(3)
            .with_initial_delay(std::time::Duration::from_millis(1)),
    ));

    let response = bridge
        .chat_ir(ChatRequest::new(vec![Message::user("ping")]))
        .await
        .unwrap();
    assert_eq!(response.message.content.text(), "eventually");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

// ============================================================================
// Structured output
// ============================================================================

#[derive(Debug, PartialEq, serde::Deserialize, schemars::JsonSchema)]
struct Person {
    name: String,
    age: u32,
}

#[tokio::test]
async fn generate_object_tools_mode_returns_typed_data() {
    let backend = ToolCallBackend::new(serde_json::json!({"name": "John", "age": 30}));
    let bridge = Bridge::new(IrFrontend::new(), backend);

    let result = bridge
        .generate_object::<Person>(
            ChatRequest::new(vec![Message::user("John is 30")]),
            crate::structured::ObjectOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        result.data,
        Person {
            name: "John".to_string(),
            age: 30
        }
    );
    assert!(result.warnings.is_empty());
    assert_eq!(result.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn generate_object_rejects_schema_violations() {
    let backend = ToolCallBackend::new(serde_json::json!({"name": "John", "age": "thirty"}));
    let bridge = Bridge::new(IrFrontend::new(), backend);

    let err = bridge
        .generate_object::<Person>(
            ChatRequest::new(vec![Message::user("John is 30")]),
            crate::structured::ObjectOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "schema_validation");
}

#[tokio::test]
async fn progressive_partials_deepen_then_validate() {
    use crate::ir::{SchemaMode, SchemaSpec};
    use crate::structured::{generate_object_stream, ObjectStreamEvent};

    let deltas = ["{\"a\":1,", "\"b\":[1,2", ",3]}"];
    let mut chunks = vec![StreamChunk::Start {
        sequence: 0,
        metadata: ResponseMetadata::default(),
    }];
    for (i, delta) in deltas.iter().enumerate() {
        chunks.push(StreamChunk::Content {
            sequence: i as u64 + 1,
            delta: delta.to_string(),
            accumulated: None,
        });
    }
    chunks.push(StreamChunk::Done {
        sequence: 4,
        finish_reason: FinishReason::Stop,
        usage: None,
        message: Message::assistant(deltas.concat()),
    });

    let spec = SchemaSpec {
        json_schema: serde_json::json!({"type": "object"}),
        mode: SchemaMode::Json,
        name: "partial".to_string(),
        description: None,
    };
    let events: Vec<_> = generate_object_stream::<serde_json::Value>(
        boxed(futures::stream::iter(chunks)),
        spec,
    )
    .collect()
    .await;

    let partials: Vec<serde_json::Value> = events
        .iter()
        .filter_map(|e| match e {
            Ok(ObjectStreamEvent::Partial(value)) => Some(value.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        partials,
        vec![
            serde_json::json!({"a": 1}),
            serde_json::json!({"a": 1, "b": [1, 2]}),
            serde_json::json!({"a": 1, "b": [1, 2, 3]}),
        ]
    );

    match events.last().unwrap() {
        Ok(ObjectStreamEvent::Complete(result)) => {
            assert_eq!(result.raw, serde_json::json!({"a": 1, "b": [1, 2, 3]}));
        }
        other => panic!("expected terminal complete, got {:?}", other),
    }
}

// ============================================================================
// Stream caching
// ============================================================================

#[tokio::test]
async fn cached_stream_replays_deep_equal() {
    let backend = ScriptedBackend::new("Hello world");
    let bridge = Bridge::new(IrFrontend::new(), backend.clone())
        .with_middleware(Arc::new(CacheMiddleware::new().cache_streams()));

    let request = ChatRequest::new(vec![Message::user("hi")]);
    let first = crate::stream::collect(bridge.chat_stream_ir(request.clone()).await.unwrap())
        .await
        .unwrap();
    let second = crate::stream::collect(bridge.chat_stream_ir(request).await.unwrap())
        .await
        .unwrap();

    assert_eq!(first.content, second.content);
    assert_eq!(first.message, second.message);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Tool loop through the bridge
// ============================================================================

#[tokio::test]
async fn chat_with_tools_runs_one_round() {
    /// Asks for a tool once, then answers with the tool's output.
    struct OneRound {
        metadata: AdapterMetadata,
    }

    #[async_trait]
    impl Backend for OneRound {
        fn metadata(&self) -> &AdapterMetadata {
            &self.metadata
        }

        async fn execute(
            &self,
            request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChatResponse, GatewayError> {
            let answered = request.messages.iter().any(|m| m.role == Role::Tool);
            let (message, finish_reason) = if answered {
                let result = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::Tool)
                    .map(|m| match &m.content {
                        MessageContent::Blocks(blocks) => blocks
                            .iter()
                            .filter_map(|b| match b {
                                ContentBlock::ToolResult { content, .. } => {
                                    Some(content.as_str())
                                }
                                _ => None,
                            })
                            .collect::<String>(),
                        MessageContent::Text(text) => text.clone(),
                    })
                    .unwrap_or_default();
                (
                    Message::assistant(format!("the answer is {}", result)),
                    FinishReason::Stop,
                )
            } else {
                (
                    Message::new(
                        Role::Assistant,
                        MessageContent::Blocks(vec![ContentBlock::ToolUse {
                            id: "call_1".to_string(),
                            name: "calc".to_string(),
                            input: serde_json::json!({"expression": "2+2"}),
                        }]),
                    ),
                    FinishReason::ToolCalls,
                )
            };
            Ok(ChatResponse {
                message,
                finish_reason,
                usage: None,
                metadata: ResponseMetadata::for_request(&request),
                raw: None,
            })
        }

        async fn execute_stream(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChunkStream, GatewayError> {
            Err(GatewayError::Config("unary only".to_string()))
        }
    }

    let bridge = Bridge::new(
        IrFrontend::new(),
        Arc::new(OneRound {
            metadata: AdapterMetadata::new("one-round", "mock", Capabilities::default()),
        }),
    );
    let result = bridge
        .chat_with_tools(
            ChatRequest::new(vec![Message::user("what is 2+2?")]),
            crate::tool_loop::ToolLoopConfig::new()
                .with_tool("calc", |_input| async { Ok("4".to_string()) }),
        )
        .await
        .unwrap();

    assert_eq!(result.rounds, 1);
    assert_eq!(result.response.message.content.text(), "the answer is 4");
    assert_eq!(result.all_tool_calls[0].name, "calc");
}
