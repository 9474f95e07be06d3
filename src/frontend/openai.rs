// OpenAI chat-completions frontend: lifts inbound chat-completions JSON into
// the IR and renders IR results back, including the chunked streaming shape.

use std::collections::HashMap;

use crate::adapter::{AdapterMetadata, Capabilities, DialectStream, Frontend};
use crate::error::GatewayError;
use crate::ir::stream::{ChunkStream, StreamChunk};
use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, FinishReason, ImageSource, Message,
    MessageContent, Role, ToolChoice, ToolDefinition, Usage,
};
use crate::wire::openai as wire;
use futures::StreamExt;

pub struct OpenAiFrontend {
    metadata: AdapterMetadata,
}

impl OpenAiFrontend {
    pub fn new() -> Self {
        Self {
            metadata: AdapterMetadata::new("openai-frontend", "openai", Capabilities::default()),
        }
    }

    fn missing(field: &str) -> GatewayError {
        GatewayError::Validation {
            field: Some(field.to_string()),
            message: format!("missing required field '{}'", field),
        }
    }

    fn convert_message(index: usize, message: &wire::ChatMessage) -> Result<Message, GatewayError> {
        let role = match message.role.as_str() {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => {
                return Err(GatewayError::Validation {
                    field: Some(format!("messages[{}].role", index)),
                    message: format!("unknown role '{}'", other),
                })
            }
        };

        if role == Role::Tool {
            let tool_call_id = message
                .tool_call_id
                .clone()
                .ok_or_else(|| Self::missing(&format!("messages[{}].tool_call_id", index)))?;
            let content = match &message.content {
                Some(wire::MessageContent::Text(text)) => text.clone(),
                Some(wire::MessageContent::Parts(parts)) => parts
                    .iter()
                    .filter_map(|p| match p {
                        wire::ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect(),
                None => String::new(),
            };
            return Ok(Message::new(
                Role::Tool,
                MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_call_id,
                    content,
                }]),
            ));
        }

        let mut blocks: Vec<ContentBlock> = Vec::new();
        let mut plain: Option<String> = None;
        match &message.content {
            Some(wire::MessageContent::Text(text)) => plain = Some(text.clone()),
            Some(wire::MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        wire::ContentPart::Text { text } => blocks.push(ContentBlock::Text {
                            text: text.clone(),
                        }),
                        wire::ContentPart::ImageUrl { image_url } => {
                            blocks.push(ContentBlock::Image {
                                source: ImageSource::Url {
                                    url: image_url.url.clone(),
                                },
                            })
                        }
                    }
                }
            }
            None => {}
        }
        for call in message.tool_calls.iter().flatten() {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            });
        }

        let content = match (plain, blocks.is_empty()) {
            (Some(text), true) => MessageContent::Text(text),
            (Some(text), false) => {
                let mut all = vec![ContentBlock::Text { text }];
                all.extend(blocks);
                MessageContent::Blocks(all)
            }
            (None, _) => MessageContent::Blocks(blocks),
        };
        Ok(Message::new(role, content))
    }

    fn finish_reason_str(reason: FinishReason) -> &'static str {
        match reason {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "stop",
        }
    }

    fn render_message(message: &Message) -> wire::ChatMessage {
        let tool_calls: Vec<wire::ToolCall> = message
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| wire::ToolCall {
                id: id.to_string(),
                tool_type: "function".to_string(),
                function: wire::FunctionCall {
                    name: name.to_string(),
                    arguments: input.to_string(),
                },
            })
            .collect();
        let text = message.content.text();
        wire::ChatMessage {
            role: "assistant".to_string(),
            content: (!text.is_empty() || tool_calls.is_empty())
                .then(|| wire::MessageContent::Text(text)),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        }
    }
}

impl Default for OpenAiFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontend for OpenAiFrontend {
    type Request = wire::ChatCompletionRequest;
    type Response = wire::ChatCompletionResponse;
    type StreamItem = Result<wire::ChatCompletionChunk, GatewayError>;

    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    fn to_ir(&self, inbound: wire::ChatCompletionRequest) -> Result<ChatRequest, GatewayError> {
        if inbound.model.trim().is_empty() {
            return Err(Self::missing("model"));
        }
        if inbound.messages.is_empty() {
            return Err(Self::missing("messages"));
        }

        let messages = inbound
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| Self::convert_message(i, m))
            .collect::<Result<Vec<_>, _>>()?;

        let mut request = ChatRequest::new(messages);
        request.parameters.model = Some(inbound.model.clone());
        request.parameters.temperature = inbound.temperature;
        request.parameters.top_p = inbound.top_p;
        request.parameters.max_tokens = inbound.max_tokens;
        request.parameters.frequency_penalty = inbound.frequency_penalty;
        request.parameters.presence_penalty = inbound.presence_penalty;
        request.parameters.stop_sequences = inbound.stop.clone().unwrap_or_default();
        request.parameters.seed = inbound.seed;
        if let Some(format) = &inbound.response_format {
            request
                .parameters
                .custom
                .insert("response_format".to_string(), format.clone());
        }
        request.tools = inbound.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect()
        });
        request.tool_choice = inbound.tool_choice.as_ref().map(|choice| match choice {
            wire::ToolChoice::Mode(mode) => match mode.as_str() {
                "none" => ToolChoice::None,
                "required" => ToolChoice::Required,
                _ => ToolChoice::Auto,
            },
            wire::ToolChoice::Named { function, .. } => ToolChoice::Tool {
                name: function.name.clone(),
            },
        });
        request.stream = inbound.stream.unwrap_or(false);
        request.metadata.provenance.frontend = Some(self.metadata.name.clone());
        Ok(request)
    }

    fn from_ir(
        &self,
        response: ChatResponse,
        original: &wire::ChatCompletionRequest,
    ) -> Result<wire::ChatCompletionResponse, GatewayError> {
        Ok(wire::ChatCompletionResponse {
            id: format!("chatcmpl-{}", response.metadata.request_id),
            object: "chat.completion".to_string(),
            created: response.metadata.timestamp.timestamp(),
            model: original.model.clone(),
            choices: vec![wire::Choice {
                index: 0,
                message: Self::render_message(&response.message),
                finish_reason: Some(Self::finish_reason_str(response.finish_reason).to_string()),
            }],
            usage: response.usage.map(|u| wire::Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn stream_from_ir(
        &self,
        stream: ChunkStream,
        original: &wire::ChatCompletionRequest,
    ) -> DialectStream<Self::StreamItem> {
        let model = original.model.clone();
        Box::pin(async_stream::stream! {
            let mut stream = stream;
            let mut id = String::new();
            let mut created: i64 = 0;
            let mut tool_index: HashMap<String, usize> = HashMap::new();

            let chunk_shell = |id: &str, created: i64, model: &str,
                               delta: wire::Delta,
                               finish: Option<String>,
                               usage: Option<Usage>| {
                wire::ChatCompletionChunk {
                    id: id.to_string(),
                    object: "chat.completion.chunk".to_string(),
                    created,
                    model: model.to_string(),
                    choices: vec![wire::ChunkChoice {
                        index: 0,
                        delta,
                        finish_reason: finish,
                    }],
                    usage: usage.map(|u| wire::Usage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                        total_tokens: u.total_tokens,
                    }),
                }
            };

            while let Some(chunk) = stream.next().await {
                match chunk {
                    StreamChunk::Start { metadata, .. } => {
                        id = format!("chatcmpl-{}", metadata.request_id);
                        created = metadata.timestamp.timestamp();
                        yield Ok(chunk_shell(
                            &id,
                            created,
                            &model,
                            wire::Delta {
                                role: Some("assistant".to_string()),
                                ..wire::Delta::default()
                            },
                            None,
                            None,
                        ));
                    }
                    StreamChunk::Content { delta, .. } => {
                        yield Ok(chunk_shell(
                            &id,
                            created,
                            &model,
                            wire::Delta {
                                content: Some(delta),
                                ..wire::Delta::default()
                            },
                            None,
                            None,
                        ));
                    }
                    StreamChunk::ToolCallDelta {
                        id: call_id,
                        name,
                        input_delta,
                        ..
                    } => {
                        let slot_count = tool_index.len();
                        let index = *tool_index.entry(call_id.clone()).or_insert(slot_count);
                        let fresh = name.is_some();
                        yield Ok(chunk_shell(
                            &id,
                            created,
                            &model,
                            wire::Delta {
                                tool_calls: Some(vec![wire::ToolCallDelta {
                                    index,
                                    id: fresh.then_some(call_id),
                                    tool_type: fresh.then(|| "function".to_string()),
                                    function: Some(wire::FunctionDelta {
                                        name,
                                        arguments: Some(input_delta),
                                    }),
                                }]),
                                ..wire::Delta::default()
                            },
                            None,
                            None,
                        ));
                    }
                    StreamChunk::Done {
                        finish_reason,
                        usage,
                        ..
                    } => {
                        yield Ok(chunk_shell(
                            &id,
                            created,
                            &model,
                            wire::Delta::default(),
                            Some(Self::finish_reason_str(finish_reason).to_string()),
                            usage,
                        ));
                        return;
                    }
                    StreamChunk::Error { code, message, .. } => {
                        yield Err(GatewayError::from_chunk(&code, &message));
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(json: serde_json::Value) -> wire::ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn to_ir_maps_the_basic_request() {
        let frontend = OpenAiFrontend::new();
        let request = frontend
            .to_ir(inbound(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "ping"}],
                "temperature": 0.2,
                "stop": ["END"]
            })))
            .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.parameters.model.as_deref(), Some("gpt-4"));
        assert_eq!(request.parameters.temperature, Some(0.2));
        assert_eq!(request.parameters.stop_sequences, vec!["END".to_string()]);
        assert_eq!(
            request.metadata.provenance.frontend.as_deref(),
            Some("openai-frontend")
        );
    }

    #[test]
    fn to_ir_rejects_missing_model_and_messages() {
        let frontend = OpenAiFrontend::new();
        let err = frontend
            .to_ir(inbound(serde_json::json!({"model": "", "messages": []})))
            .unwrap_err();
        match err {
            GatewayError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("model")),
            other => panic!("expected validation error, got {:?}", other),
        }

        let err = frontend
            .to_ir(inbound(serde_json::json!({"model": "gpt-4", "messages": []})))
            .unwrap_err();
        match err {
            GatewayError::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("messages"))
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn tool_messages_require_a_call_id() {
        let frontend = OpenAiFrontend::new();
        let err = frontend
            .to_ir(inbound(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "tool", "content": "4"}]
            })))
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn from_ir_renders_the_completion_shape() {
        let frontend = OpenAiFrontend::new();
        let original = inbound(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "ping"}]
        }));
        let ir_request = frontend.to_ir(original.clone()).unwrap();
        let response = ChatResponse {
            message: Message::assistant("pong"),
            finish_reason: FinishReason::Stop,
            usage: Some(Usage::new(3, 1)),
            metadata: crate::ir::ResponseMetadata::for_request(&ir_request),
            raw: None,
        };
        let rendered = frontend.from_ir(response, &original).unwrap();
        assert_eq!(rendered.object, "chat.completion");
        assert_eq!(rendered.model, "gpt-4");
        assert_eq!(rendered.choices.len(), 1);
        assert_eq!(
            rendered.choices[0].finish_reason.as_deref(),
            Some("stop")
        );
        match rendered.choices[0].message.content.as_ref().unwrap() {
            wire::MessageContent::Text(text) => assert_eq!(text, "pong"),
            other => panic!("expected text content, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_from_ir_renders_chunks_and_errors() {
        use crate::ir::stream::boxed;
        let frontend = OpenAiFrontend::new();
        let original = inbound(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "ping"}]
        }));
        let chunks = vec![
            StreamChunk::Start {
                sequence: 0,
                metadata: crate::ir::ResponseMetadata {
                    request_id: "req-1".to_string(),
                    ..Default::default()
                },
            },
            StreamChunk::Content {
                sequence: 1,
                delta: "po".to_string(),
                accumulated: None,
            },
            StreamChunk::Error {
                sequence: 2,
                code: "rate_limit".to_string(),
                message: "slow down".to_string(),
            },
        ];
        let out: Vec<_> = frontend
            .stream_from_ir(boxed(futures::stream::iter(chunks)), &original)
            .collect()
            .await;
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        let content = out[1].as_ref().unwrap();
        assert_eq!(
            content.choices[0].delta.content.as_deref(),
            Some("po")
        );
        assert_eq!(out[2].as_ref().unwrap_err().code(), "rate_limit");
    }
}
