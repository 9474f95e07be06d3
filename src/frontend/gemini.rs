// Gemini generateContent frontend. Function calls on this dialect carry no
// call ids, so the frontend synthesizes them and keeps a name -> id map to
// relink function responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::adapter::{AdapterMetadata, Capabilities, DialectStream, Frontend};
use crate::error::GatewayError;
use crate::ir::stream::{ChunkStream, StreamChunk};
use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, FinishReason, ImageSource, Message,
    MessageContent, Role, ToolChoice, ToolDefinition,
};
use crate::wire::gemini as wire;
use futures::StreamExt;

pub struct GeminiFrontend {
    metadata: AdapterMetadata,
    call_counter: AtomicU64,
}

impl GeminiFrontend {
    pub fn new() -> Self {
        Self {
            metadata: AdapterMetadata::new("gemini-frontend", "gemini", Capabilities::default()),
            call_counter: AtomicU64::new(1),
        }
    }

    fn missing(field: &str) -> GatewayError {
        GatewayError::Validation {
            field: Some(field.to_string()),
            message: format!("missing required field '{}'", field),
        }
    }

    fn next_call_id(&self) -> String {
        format!(
            "gemini_call_{}",
            self.call_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn convert_content(
        &self,
        content: &wire::Content,
        ids_by_name: &mut HashMap<String, String>,
    ) -> Message {
        let is_tool_turn = content
            .parts
            .iter()
            .any(|p| p.function_response.is_some());
        if is_tool_turn {
            let blocks: Vec<ContentBlock> = content
                .parts
                .iter()
                .filter_map(|part| {
                    let response = part.function_response.as_ref()?;
                    let tool_call_id = ids_by_name
                        .get(&response.name)
                        .cloned()
                        .unwrap_or_else(|| response.name.clone());
                    Some(ContentBlock::ToolResult {
                        tool_call_id,
                        content: response.response.to_string(),
                    })
                })
                .collect();
            return Message::new(Role::Tool, MessageContent::Blocks(blocks));
        }

        let role = match content.role.as_deref() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut blocks: Vec<ContentBlock> = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                blocks.push(ContentBlock::Text { text: text.clone() });
            }
            if let Some(blob) = &part.inline_data {
                blocks.push(ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: blob.mime_type.clone(),
                        data: blob.data.clone(),
                    },
                });
            }
            if let Some(file) = &part.file_data {
                blocks.push(ContentBlock::Image {
                    source: ImageSource::Url {
                        url: file.file_uri.clone(),
                    },
                });
            }
            if let Some(call) = &part.function_call {
                let id = self.next_call_id();
                ids_by_name.insert(call.name.clone(), id.clone());
                blocks.push(ContentBlock::ToolUse {
                    id,
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
        }
        if blocks.len() == 1 {
            if let ContentBlock::Text { text } = &blocks[0] {
                return Message::text(role, text.clone());
            }
        }
        Message::new(role, MessageContent::Blocks(blocks))
    }

    fn finish_reason_str(reason: FinishReason) -> &'static str {
        match reason {
            FinishReason::Stop | FinishReason::ToolCalls | FinishReason::Error => "STOP",
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ContentFilter => "SAFETY",
        }
    }

    fn render_parts(message: &Message) -> Vec<wire::Part> {
        match &message.content {
            MessageContent::Text(text) => vec![wire::Part {
                text: Some(text.clone()),
                ..wire::Part::default()
            }],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(wire::Part {
                        text: Some(text.clone()),
                        ..wire::Part::default()
                    }),
                    ContentBlock::ToolUse { name, input, .. } => Some(wire::Part {
                        function_call: Some(wire::FunctionCall {
                            name: name.clone(),
                            args: input.clone(),
                        }),
                        ..wire::Part::default()
                    }),
                    _ => None,
                })
                .collect(),
        }
    }

    fn render_response(response: &ChatResponse) -> wire::GenerateContentResponse {
        wire::GenerateContentResponse {
            candidates: vec![wire::Candidate {
                content: Some(wire::Content {
                    role: Some("model".to_string()),
                    parts: Self::render_parts(&response.message),
                }),
                finish_reason: Some(Self::finish_reason_str(response.finish_reason).to_string()),
                index: Some(0),
            }],
            usage_metadata: response.usage.map(|u| wire::UsageMetadata {
                prompt_token_count: u.prompt_tokens,
                candidates_token_count: u.completion_tokens,
                total_token_count: u.total_tokens,
            }),
        }
    }
}

impl Default for GeminiFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontend for GeminiFrontend {
    type Request = wire::GenerateContentRequest;
    type Response = wire::GenerateContentResponse;
    type StreamItem = Result<wire::GenerateContentResponse, GatewayError>;

    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    fn to_ir(&self, inbound: wire::GenerateContentRequest) -> Result<ChatRequest, GatewayError> {
        if inbound.contents.is_empty() {
            return Err(Self::missing("contents"));
        }

        let mut ids_by_name = HashMap::new();
        let mut messages = Vec::with_capacity(inbound.contents.len() + 1);
        if let Some(instruction) = &inbound.system_instruction {
            let text: String = instruction
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n\n");
            if !text.is_empty() {
                messages.push(Message::system(text));
            }
        }
        for content in &inbound.contents {
            messages.push(self.convert_content(content, &mut ids_by_name));
        }

        let mut request = ChatRequest::new(messages);
        if let Some(config) = &inbound.generation_config {
            request.parameters.temperature = config.temperature;
            request.parameters.top_p = config.top_p;
            request.parameters.top_k = config.top_k;
            request.parameters.max_tokens = config.max_output_tokens;
            request.parameters.stop_sequences = config.stop_sequences.clone().unwrap_or_default();
            request.parameters.seed = config.seed;
            request.parameters.frequency_penalty = config.frequency_penalty;
            request.parameters.presence_penalty = config.presence_penalty;
        }
        request.tools = inbound.tools.as_ref().map(|tools| {
            tools
                .iter()
                .flat_map(|t| &t.function_declarations)
                .map(|f| ToolDefinition {
                    name: f.name.clone(),
                    description: f.description.clone(),
                    parameters: f.parameters.clone(),
                })
                .collect()
        });
        request.tool_choice = inbound.tool_config.as_ref().map(|config| {
            let fc = &config.function_calling_config;
            match (fc.mode.as_str(), &fc.allowed_function_names) {
                ("NONE", _) => ToolChoice::None,
                ("ANY", Some(names)) if names.len() == 1 => ToolChoice::Tool {
                    name: names[0].clone(),
                },
                ("ANY", _) => ToolChoice::Required,
                _ => ToolChoice::Auto,
            }
        });
        request.metadata.provenance.frontend = Some(self.metadata.name.clone());
        Ok(request)
    }

    fn from_ir(
        &self,
        response: ChatResponse,
        _original: &wire::GenerateContentRequest,
    ) -> Result<wire::GenerateContentResponse, GatewayError> {
        Ok(Self::render_response(&response))
    }

    fn stream_from_ir(
        &self,
        stream: ChunkStream,
        _original: &wire::GenerateContentRequest,
    ) -> DialectStream<Self::StreamItem> {
        Box::pin(async_stream::stream! {
            let mut stream = stream;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    StreamChunk::Start { .. } => {}
                    StreamChunk::Content { delta, .. } => {
                        yield Ok(wire::GenerateContentResponse {
                            candidates: vec![wire::Candidate {
                                content: Some(wire::Content {
                                    role: Some("model".to_string()),
                                    parts: vec![wire::Part {
                                        text: Some(delta),
                                        ..wire::Part::default()
                                    }],
                                }),
                                finish_reason: None,
                                index: Some(0),
                            }],
                            usage_metadata: None,
                        });
                    }
                    StreamChunk::ToolCallDelta { .. } => {
                        // Function calls surface whole in the final chunk on
                        // this dialect; argument deltas have no wire shape.
                    }
                    StreamChunk::Done {
                        finish_reason,
                        usage,
                        message,
                        ..
                    } => {
                        let response = ChatResponse {
                            message,
                            finish_reason,
                            usage,
                            metadata: crate::ir::ResponseMetadata::default(),
                            raw: None,
                        };
                        let mut rendered = Self::render_response(&response);
                        // The terminal chunk repeats only new state: finish
                        // reason, usage, and any function calls.
                        if let Some(candidate) = rendered.candidates.first_mut() {
                            if let Some(content) = &mut candidate.content {
                                content.parts.retain(|p| p.function_call.is_some());
                            }
                        }
                        yield Ok(rendered);
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
