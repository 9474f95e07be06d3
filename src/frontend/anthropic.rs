// Anthropic messages frontend: lifts inbound messages-API JSON into the IR
// and renders IR results back through the vendor's streaming event envelope.

use crate::adapter::{AdapterMetadata, Capabilities, DialectStream, Frontend};
use crate::error::GatewayError;
use crate::ir::stream::{ChunkStream, StreamChunk};
use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, FinishReason, ImageSource, Message,
    MessageContent, Role, ToolChoice, ToolDefinition, Usage,
};
use crate::wire::anthropic as wire;
use futures::StreamExt;

pub struct AnthropicFrontend {
    metadata: AdapterMetadata,
}

impl AnthropicFrontend {
    pub fn new() -> Self {
        Self {
            metadata: AdapterMetadata::new(
                "anthropic-frontend",
                "anthropic",
                Capabilities::default(),
            ),
        }
    }

    fn missing(field: &str) -> GatewayError {
        GatewayError::Validation {
            field: Some(field.to_string()),
            message: format!("missing required field '{}'", field),
        }
    }

    fn convert_block(block: &wire::ContentBlock) -> Option<ContentBlock> {
        match block {
            wire::ContentBlock::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
            wire::ContentBlock::Image { source } => Some(ContentBlock::Image {
                source: match (&source.data, &source.url) {
                    (Some(data), _) => ImageSource::Base64 {
                        media_type: source
                            .media_type
                            .clone()
                            .unwrap_or_else(|| "image/png".to_string()),
                        data: data.clone(),
                    },
                    (None, Some(url)) => ImageSource::Url { url: url.clone() },
                    (None, None) => return None,
                },
            }),
            wire::ContentBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            wire::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => Some(ContentBlock::ToolResult {
                tool_call_id: tool_use_id.clone(),
                content: content.clone(),
            }),
        }
    }

    fn convert_message(message: &wire::MessageParam) -> Result<Message, GatewayError> {
        let blocks = match &message.content {
            wire::MessageContent::Text(text) => {
                let role = if message.role == "assistant" {
                    Role::Assistant
                } else {
                    Role::User
                };
                return Ok(Message::text(role, text.clone()));
            }
            wire::MessageContent::Blocks(blocks) => blocks,
        };

        let converted: Vec<ContentBlock> =
            blocks.iter().filter_map(Self::convert_block).collect();
        // Tool results arrive inside user messages; in the IR they are a
        // distinct role.
        let all_tool_results = !converted.is_empty()
            && converted
                .iter()
                .all(|b| matches!(b, ContentBlock::ToolResult { .. }));
        let role = if all_tool_results {
            Role::Tool
        } else if message.role == "assistant" {
            Role::Assistant
        } else {
            Role::User
        };
        Ok(Message::new(role, MessageContent::Blocks(converted)))
    }

    fn stop_reason_str(reason: FinishReason) -> &'static str {
        match reason {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
            FinishReason::ContentFilter => "refusal",
            FinishReason::Error => "end_turn",
        }
    }

    fn render_blocks(message: &Message) -> Vec<wire::ContentBlock> {
        match &message.content {
            MessageContent::Text(text) => vec![wire::ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => {
                        Some(wire::ContentBlock::Text { text: text.clone() })
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        Some(wire::ContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        })
                    }
                    _ => None,
                })
                .collect(),
        }
    }

    fn render_response(
        response: &ChatResponse,
        original: &wire::CreateMessageRequest,
    ) -> wire::MessageResponse {
        wire::MessageResponse {
            id: format!("msg_{}", response.metadata.request_id),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Self::render_blocks(&response.message),
            model: original.model.clone(),
            stop_reason: Some(Self::stop_reason_str(response.finish_reason).to_string()),
            stop_sequence: None,
            usage: response
                .usage
                .map(|u| wire::UsageInfo {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        }
    }
}

impl Default for AnthropicFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontend for AnthropicFrontend {
    type Request = wire::CreateMessageRequest;
    type Response = wire::MessageResponse;
    type StreamItem = wire::StreamEvent;

    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    fn to_ir(&self, inbound: wire::CreateMessageRequest) -> Result<ChatRequest, GatewayError> {
        if inbound.model.trim().is_empty() {
            return Err(Self::missing("model"));
        }
        if inbound.messages.is_empty() {
            return Err(Self::missing("messages"));
        }

        let mut messages = Vec::with_capacity(inbound.messages.len() + 1);
        match &inbound.system {
            Some(wire::SystemPrompt::Text(text)) => messages.push(Message::system(text.clone())),
            Some(wire::SystemPrompt::Blocks(blocks)) => {
                for block in blocks {
                    messages.push(Message::system(block.text.clone()));
                }
            }
            None => {}
        }
        for message in &inbound.messages {
            messages.push(Self::convert_message(message)?);
        }

        let mut request = ChatRequest::new(messages);
        request.parameters.model = Some(inbound.model.clone());
        request.parameters.max_tokens = Some(inbound.max_tokens);
        request.parameters.temperature = inbound.temperature;
        request.parameters.top_p = inbound.top_p;
        request.parameters.top_k = inbound.top_k;
        request.parameters.stop_sequences = inbound.stop_sequences.clone().unwrap_or_default();
        request.tools = inbound.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.name.clone(),
                    description: t.description.clone().unwrap_or_default(),
                    parameters: t.input_schema.clone(),
                })
                .collect()
        });
        request.tool_choice = inbound.tool_choice.as_ref().map(|choice| match choice {
            wire::ToolChoiceParam::Auto => ToolChoice::Auto,
            wire::ToolChoiceParam::Any => ToolChoice::Required,
            wire::ToolChoiceParam::None => ToolChoice::None,
            wire::ToolChoiceParam::Tool { name } => ToolChoice::Tool { name: name.clone() },
        });
        request.stream = inbound.stream.unwrap_or(false);
        request.metadata.provenance.frontend = Some(self.metadata.name.clone());
        Ok(request)
    }

    fn from_ir(
        &self,
        response: ChatResponse,
        original: &wire::CreateMessageRequest,
    ) -> Result<wire::MessageResponse, GatewayError> {
        Ok(Self::render_response(&response, original))
    }

    fn stream_from_ir(
        &self,
        stream: ChunkStream,
        original: &wire::CreateMessageRequest,
    ) -> DialectStream<wire::StreamEvent> {
        let model = original.model.clone();
        Box::pin(async_stream::stream! {
            let mut stream = stream;
            let mut block_index: usize = 0;
            let mut block_open = false;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    StreamChunk::Start { metadata, .. } => {
                        yield wire::StreamEvent::MessageStart {
                            message: wire::MessageResponse {
                                id: format!("msg_{}", metadata.request_id),
                                response_type: "message".to_string(),
                                role: "assistant".to_string(),
                                content: Vec::new(),
                                model: model.clone(),
                                stop_reason: None,
                                stop_sequence: None,
                                usage: wire::UsageInfo::default(),
                            },
                        };
                    }
                    StreamChunk::Content { delta, .. } => {
                        if !block_open {
                            yield wire::StreamEvent::ContentBlockStart {
                                index: block_index,
                                content_block: wire::ContentBlock::Text {
                                    text: String::new(),
                                },
                            };
                            block_open = true;
                        }
                        yield wire::StreamEvent::ContentBlockDelta {
                            index: block_index,
                            delta: wire::ContentDelta::TextDelta { text: delta },
                        };
                    }
                    StreamChunk::ToolCallDelta {
                        id,
                        name,
                        input_delta,
                        ..
                    } => {
                        if let Some(name) = name {
                            if block_open {
                                yield wire::StreamEvent::ContentBlockStop {
                                    index: block_index,
                                };
                                block_index += 1;
                            }
                            yield wire::StreamEvent::ContentBlockStart {
                                index: block_index,
                                content_block: wire::ContentBlock::ToolUse {
                                    id,
                                    name,
                                    input: serde_json::json!({}),
                                },
                            };
                            block_open = true;
                        }
                        yield wire::StreamEvent::ContentBlockDelta {
                            index: block_index,
                            delta: wire::ContentDelta::InputJsonDelta {
                                partial_json: input_delta,
                            },
                        };
                    }
                    StreamChunk::Done {
                        finish_reason,
                        usage,
                        ..
                    } => {
                        if block_open {
                            yield wire::StreamEvent::ContentBlockStop { index: block_index };
                        }
                        yield wire::StreamEvent::MessageDelta {
                            delta: wire::MessageDeltaBody {
                                stop_reason: Some(
                                    Self::stop_reason_str(finish_reason).to_string(),
                                ),
                                stop_sequence: None,
                            },
                            usage: usage.map(|u| wire::UsageDelta {
                                output_tokens: u.completion_tokens,
                            }),
                        };
                        yield wire::StreamEvent::MessageStop;
                        return;
                    }
                    StreamChunk::Error { code, message, .. } => {
                        yield wire::StreamEvent::Error {
                            error: wire::ErrorBody {
                                kind: match code.as_str() {
                                    "authentication" => "authentication_error".to_string(),
                                    "authorization" => "permission_error".to_string(),
                                    "rate_limit" => "rate_limit_error".to_string(),
                                    "validation" => "invalid_request_error".to_string(),
                                    "aborted" => "request_cancelled".to_string(),
                                    _ => "api_error".to_string(),
                                },
                                message,
                            },
                        };
                        return;
                    }
                }
            }
        })
    }
}
