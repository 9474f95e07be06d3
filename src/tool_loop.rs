// Bounded auto-execution of tool calls: dispatch, run the requested tools,
// feed the results back, repeat until the model stops asking or the round
// budget runs out.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::GatewayError;
use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, FinishReason, Message, MessageContent, Role,
};

/// Executes one tool call. `Ok` carries the tool output, `Err` an error
/// message; both are fed back to the model as the tool result.
pub type ToolExecutor = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        + Send
        + Sync,
>;

pub struct ToolLoopConfig {
    executors: HashMap<String, ToolExecutor>,
    max_rounds: usize,
    on_content: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl ToolLoopConfig {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            max_rounds: 10,
            on_content: None,
        }
    }

    /// Register an executor for a tool name.
    pub fn with_tool<F, Fut>(mut self, name: impl Into<String>, executor: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.executors
            .insert(name.into(), Box::new(move |input| Box::pin(executor(input))));
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn on_content<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_content = Some(Box::new(callback));
        self
    }
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One tool call observed during the loop.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug)]
pub struct ToolLoopResult {
    /// The final (non-tool-call) response.
    pub response: ChatResponse,
    /// How many tool rounds ran.
    pub rounds: usize,
    pub all_tool_calls: Vec<ToolCallRecord>,
}

/// Run the loop against a dispatch function (typically `Bridge::chat_ir`).
pub async fn run_tool_loop<D, Fut>(
    dispatch: D,
    mut request: ChatRequest,
    config: ToolLoopConfig,
) -> Result<ToolLoopResult, GatewayError>
where
    D: Fn(ChatRequest) -> Fut,
    Fut: Future<Output = Result<ChatResponse, GatewayError>>,
{
    let mut rounds = 0;
    let mut all_tool_calls = Vec::new();

    loop {
        let response = dispatch(request.clone()).await?;
        if let Some(callback) = &config.on_content {
            let text = response.message.content.text();
            if !text.is_empty() {
                callback(&text);
            }
        }

        let tool_uses: Vec<ToolCallRecord> = response
            .message
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| ToolCallRecord {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect();

        if response.finish_reason != FinishReason::ToolCalls || tool_uses.is_empty() {
            return Ok(ToolLoopResult {
                response,
                rounds,
                all_tool_calls,
            });
        }

        rounds += 1;
        if rounds > config.max_rounds {
            return Err(GatewayError::Config(format!(
                "tool loop exceeded {} rounds",
                config.max_rounds
            )));
        }

        request.messages.push(response.message.clone());
        let mut results = Vec::with_capacity(tool_uses.len());
        for call in tool_uses {
            let outcome = match config.executors.get(&call.name) {
                Some(executor) => executor(call.input.clone()).await,
                None => Err(format!("tool '{}' is not registered", call.name)),
            };
            let content = match outcome {
                Ok(output) => output,
                Err(error) => error,
            };
            results.push(ContentBlock::ToolResult {
                tool_call_id: call.id.clone(),
                content,
            });
            all_tool_calls.push(call);
        }
        request
            .messages
            .push(Message::new(Role::Tool, MessageContent::Blocks(results)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ResponseMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tool_call_response(request: &ChatRequest) -> ChatResponse {
        ChatResponse {
            message: Message::new(
                Role::Assistant,
                MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "calc".to_string(),
                    input: serde_json::json!({"expression": "2+2"}),
                }]),
            ),
            finish_reason: FinishReason::ToolCalls,
            usage: None,
            metadata: ResponseMetadata::for_request(request),
            raw: None,
        }
    }

    fn final_response(request: &ChatRequest) -> ChatResponse {
        ChatResponse {
            message: Message::assistant("the answer is 4"),
            finish_reason: FinishReason::Stop,
            usage: None,
            metadata: ResponseMetadata::for_request(request),
            raw: None,
        }
    }

    #[tokio::test]
    async fn executes_tools_and_returns_final_answer() {
        let dispatches = Arc::new(AtomicUsize::new(0));
        let dispatches_clone = dispatches.clone();
        let dispatch = move |request: ChatRequest| {
            let dispatches = dispatches_clone.clone();
            async move {
                if dispatches.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(tool_call_response(&request))
                } else {
                    // The tool result must be in the follow-up request.
                    let last = request.messages.last().unwrap();
                    assert_eq!(last.role, Role::Tool);
                    Ok(final_response(&request))
                }
            }
        };

        let config = ToolLoopConfig::new().with_tool("calc", |_input| async { Ok("4".to_string()) });
        let result = run_tool_loop(
            dispatch,
            ChatRequest::new(vec![Message::user("what is 2+2?")]),
            config,
        )
        .await
        .unwrap();

        assert_eq!(result.rounds, 1);
        assert_eq!(result.all_tool_calls.len(), 1);
        assert_eq!(result.response.message.content.text(), "the answer is 4");
        assert_eq!(dispatches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregistered_tools_feed_back_an_error_result() {
        let dispatches = Arc::new(AtomicUsize::new(0));
        let dispatches_clone = dispatches.clone();
        let dispatch = move |request: ChatRequest| {
            let dispatches = dispatches_clone.clone();
            async move {
                if dispatches.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(tool_call_response(&request))
                } else {
                    // The unregistered tool's error text came back as a result.
                    let last = request.messages.last().unwrap().clone();
                    match &last.content {
                        MessageContent::Blocks(blocks) => match &blocks[0] {
                            ContentBlock::ToolResult { content, .. } => {
                                assert!(content.contains("not registered"))
                            }
                            other => panic!("expected tool result, got {:?}", other),
                        },
                        other => panic!("expected blocks, got {:?}", other),
                    }
                    Ok(final_response(&request))
                }
            }
        };
        let result = run_tool_loop(
            dispatch,
            ChatRequest::new(vec![Message::user("2+2?")]),
            ToolLoopConfig::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.rounds, 1);
    }

    #[tokio::test]
    async fn round_budget_is_enforced() {
        let dispatch = |request: ChatRequest| async move { Ok(tool_call_response(&request)) };
        let config = ToolLoopConfig::new()
            .with_max_rounds(2)
            .with_tool("calc", |_input| async { Ok("4".to_string()) });
        let err = run_tool_loop(
            dispatch,
            ChatRequest::new(vec![Message::user("loop forever")]),
            config,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "config");
    }
}
