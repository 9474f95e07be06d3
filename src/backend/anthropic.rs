// Anthropic backend: messages API over reqwest + SSE streaming.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{execute_json, open_sse, PricePer1K};
use crate::adapter::{
    AdapterMetadata, Backend, Capabilities, CostEstimate, ListModelsResult, ModelFilter,
    ModelInfo, ModelSource, SystemMessageStrategy,
};
use crate::error::GatewayError;
use crate::ir::stream::{boxed, ChunkStream, StreamChunk};
use crate::ir::{
    estimate_tokens, ChatRequest, ChatResponse, ContentBlock, FinishReason, ImageSource,
    Message, MessageContent, ResponseMetadata, Role, ToolChoice, Usage, Warning,
};
use crate::model_cache::{model_cache, CacheKey};
use crate::normalize::{normalize, SystemParameter};
use crate::wire::anthropic as wire;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    pricing: Option<PricePer1K>,
    metadata: AdapterMetadata,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>) -> Result<Self, GatewayError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "Anthropic API key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: ANTHROPIC_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            pricing: None,
            metadata: AdapterMetadata::new("anthropic-backend", "anthropic", Self::capabilities()),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_pricing(mut self, pricing: PricePer1K) -> Self {
        self.pricing = Some(pricing);
        self
    }

    fn capabilities() -> Capabilities {
        Capabilities {
            streaming: true,
            multi_modal: true,
            tools: true,
            max_context_tokens: 200_000,
            system_message_strategy: SystemMessageStrategy::SeparateParameter,
            supports_multiple_system_messages: false,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: false,
            supports_frequency_penalty: false,
            supports_presence_penalty: false,
            max_stop_sequences: 4,
        }
    }

    /// Lower an IR request onto the messages-API wire. System messages land
    /// in the `system` parameter.
    pub fn from_ir(
        &self,
        request: &ChatRequest,
    ) -> Result<(wire::CreateMessageRequest, Vec<Warning>), GatewayError> {
        let normalized = normalize(request.clone(), &self.metadata.capabilities);
        let ir = normalized.request;
        let system = normalized.system_parameter.map(|param| match param {
            SystemParameter::Single(text) => wire::SystemPrompt::Text(text),
            SystemParameter::Many(texts) => wire::SystemPrompt::Text(texts.join("\n\n")),
        });

        let mut messages = Vec::with_capacity(ir.messages.len());
        for message in &ir.messages {
            messages.push(self.convert_message(message)?);
        }

        let params = &ir.parameters;
        let wire_request = wire::CreateMessageRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            stop_sequences: (!params.stop_sequences.is_empty())
                .then(|| params.stop_sequences.clone()),
            stream: None,
            tools: ir.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| wire::ToolParam {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        input_schema: t.parameters.clone(),
                    })
                    .collect()
            }),
            tool_choice: ir.tool_choice.as_ref().map(|choice| match choice {
                ToolChoice::Auto => wire::ToolChoiceParam::Auto,
                ToolChoice::Required => wire::ToolChoiceParam::Any,
                ToolChoice::None => wire::ToolChoiceParam::None,
                ToolChoice::Tool { name } => wire::ToolChoiceParam::Tool { name: name.clone() },
            }),
            metadata: None,
        };
        Ok((wire_request, normalized.warnings))
    }

    fn convert_message(&self, message: &Message) -> Result<wire::MessageParam, GatewayError> {
        match message.role {
            Role::User | Role::System => Ok(wire::MessageParam {
                role: "user".to_string(),
                content: self.convert_content(&message.content),
            }),
            Role::Assistant => Ok(wire::MessageParam {
                role: "assistant".to_string(),
                content: self.convert_content(&message.content),
            }),
            // Tool results travel as user messages holding tool_result blocks.
            Role::Tool => {
                let MessageContent::Blocks(blocks) = &message.content else {
                    return Err(self.conversion_error("tool message without tool_result block"));
                };
                let results: Vec<wire::ContentBlock> = blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult {
                            tool_call_id,
                            content,
                        } => Some(wire::ContentBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: content.clone(),
                            is_error: None,
                        }),
                        _ => None,
                    })
                    .collect();
                if results.is_empty() {
                    return Err(self.conversion_error("tool message without tool_result block"));
                }
                Ok(wire::MessageParam {
                    role: "user".to_string(),
                    content: wire::MessageContent::Blocks(results),
                })
            }
        }
    }

    fn convert_content(&self, content: &MessageContent) -> wire::MessageContent {
        match content {
            MessageContent::Text(text) => wire::MessageContent::Text(text.clone()),
            MessageContent::Blocks(blocks) => {
                let converted: Vec<wire::ContentBlock> = blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(wire::ContentBlock::Text {
                            text: text.clone(),
                        }),
                        ContentBlock::Image { source } => Some(wire::ContentBlock::Image {
                            source: match source {
                                ImageSource::Base64 { media_type, data } => wire::ImageSource {
                                    source_type: "base64".to_string(),
                                    media_type: Some(media_type.clone()),
                                    data: Some(data.clone()),
                                    url: None,
                                },
                                ImageSource::Url { url } => wire::ImageSource {
                                    source_type: "url".to_string(),
                                    media_type: None,
                                    data: None,
                                    url: Some(url.clone()),
                                },
                            },
                        }),
                        ContentBlock::ToolUse { id, name, input } => {
                            Some(wire::ContentBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            })
                        }
                        ContentBlock::ToolResult {
                            tool_call_id,
                            content,
                        } => Some(wire::ContentBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: content.clone(),
                            is_error: None,
                        }),
                    })
                    .collect();
                wire::MessageContent::Blocks(converted)
            }
        }
    }

    fn conversion_error(&self, message: &str) -> GatewayError {
        GatewayError::Conversion {
            adapter: self.metadata.name.clone(),
            message: message.to_string(),
        }
    }

    /// Raise a messages-API response back into the IR.
    pub fn to_ir(
        &self,
        response: wire::MessageResponse,
        request: &ChatRequest,
        latency_ms: u64,
        warnings: Vec<Warning>,
    ) -> Result<ChatResponse, GatewayError> {
        let raw = serde_json::to_value(&response)?;
        let blocks: Vec<ContentBlock> = response
            .content
            .iter()
            .filter_map(|block| match block {
                wire::ContentBlock::Text { text } => Some(ContentBlock::Text {
                    text: text.clone(),
                }),
                wire::ContentBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect();

        let message = if blocks.len() == 1 {
            match &blocks[0] {
                ContentBlock::Text { text } => Message::assistant(text.clone()),
                _ => Message::new(Role::Assistant, MessageContent::Blocks(blocks)),
            }
        } else {
            Message::new(Role::Assistant, MessageContent::Blocks(blocks))
        };

        let mut metadata = ResponseMetadata::for_request(request);
        metadata.provenance.backend = Some(self.metadata.name.clone());
        metadata.warnings = warnings;
        metadata.latency_ms = Some(latency_ms);

        Ok(ChatResponse {
            message,
            finish_reason: map_stop_reason(response.stop_reason.as_deref()),
            usage: Some(convert_usage(response.usage)),
            metadata,
            raw: Some(raw),
        })
    }

    fn request_builder(&self, body: &wire::CreateMessageRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        Some(other) => {
            log::warn!("unknown anthropic stop reason '{}'", other);
            FinishReason::Stop
        }
        None => FinishReason::Stop,
    }
}

fn convert_usage(usage: wire::UsageInfo) -> Usage {
    Usage::new(usage.input_tokens, usage.output_tokens)
}

/// Map the vendor error taxonomy onto chunk codes for in-stream errors.
fn error_code(kind: &str) -> &'static str {
    match kind {
        "authentication_error" => "authentication",
        "permission_error" => "authorization",
        "rate_limit_error" => "rate_limit",
        "invalid_request_error" => "validation",
        "overloaded_error" | "api_error" => "provider",
        _ => "stream",
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let (wire_request, warnings) = self.from_ir(&request)?;
        let started = Instant::now();
        let response: wire::MessageResponse =
            execute_json(self.request_builder(&wire_request), "anthropic", &cancel).await?;
        self.to_ir(
            response,
            &request,
            started.elapsed().as_millis() as u64,
            warnings,
        )
    }

    async fn execute_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GatewayError> {
        let (mut wire_request, warnings) = self.from_ir(&request)?;
        wire_request.stream = Some(true);
        let events = open_sse(self.request_builder(&wire_request), "anthropic", &cancel).await?;

        let mut metadata = ResponseMetadata::for_request(&request);
        metadata.provenance.backend = Some(self.metadata.name.clone());
        metadata.warnings = warnings;

        Ok(boxed(async_stream::stream! {
            futures::pin_mut!(events);
            let mut sequence: u64 = 0;
            yield StreamChunk::Start { sequence, metadata };
            sequence += 1;

            let mut content = String::new();
            let mut tool_uses: Vec<ContentBlock> = Vec::new();
            // (id, name, accumulated input json, name announced yet)
            let mut current_tool: Option<(String, String, String, bool)> = None;
            let mut input_tokens: u32 = 0;
            let mut output_tokens: u32 = 0;
            let mut stop_reason: Option<String> = None;

            loop {
                let step = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = events.next() => Some(next),
                };
                let event = match step {
                    // Cancellation releases the reader and surfaces once.
                    None => {
                        yield StreamChunk::aborted(sequence);
                        return;
                    }
                    Some(None) => break,
                    Some(Some(event)) => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        yield StreamChunk::Error {
                            sequence,
                            code: "stream".to_string(),
                            message: format!("anthropic stream error: {}", err),
                        };
                        return;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }
                let parsed: wire::StreamEvent = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        log::warn!("unrecognized anthropic stream payload: {}", err);
                        continue;
                    }
                };

                match parsed {
                    wire::StreamEvent::MessageStart { message } => {
                        input_tokens = message.usage.input_tokens;
                    }
                    wire::StreamEvent::ContentBlockStart { content_block, .. } => {
                        if let wire::ContentBlock::ToolUse { id, name, .. } = content_block {
                            current_tool = Some((id, name, String::new(), false));
                        }
                    }
                    wire::StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                        wire::ContentDelta::TextDelta { text } => {
                            content.push_str(&text);
                            yield StreamChunk::Content {
                                sequence,
                                delta: text,
                                accumulated: None,
                            };
                            sequence += 1;
                        }
                        wire::ContentDelta::InputJsonDelta { partial_json } => {
                            if let Some((id, name, input, announced)) = &mut current_tool {
                                input.push_str(&partial_json);
                                let announced_name =
                                    (!*announced).then(|| name.clone());
                                *announced = true;
                                yield StreamChunk::ToolCallDelta {
                                    sequence,
                                    id: id.clone(),
                                    name: announced_name,
                                    input_delta: partial_json,
                                };
                                sequence += 1;
                            }
                        }
                    },
                    wire::StreamEvent::ContentBlockStop { .. } => {
                        if let Some((id, name, input, _)) = current_tool.take() {
                            tool_uses.push(ContentBlock::ToolUse {
                                id,
                                name,
                                input: serde_json::from_str(&input)
                                    .unwrap_or(serde_json::json!({})),
                            });
                        }
                    }
                    wire::StreamEvent::MessageDelta { delta, usage } => {
                        if delta.stop_reason.is_some() {
                            stop_reason = delta.stop_reason;
                        }
                        if let Some(usage) = usage {
                            output_tokens = usage.output_tokens;
                        }
                    }
                    wire::StreamEvent::MessageStop => break,
                    wire::StreamEvent::Ping => {}
                    wire::StreamEvent::Error { error } => {
                        yield StreamChunk::Error {
                            sequence,
                            code: error_code(&error.kind).to_string(),
                            message: error.message,
                        };
                        return;
                    }
                }
            }

            let message = if tool_uses.is_empty() {
                Message::assistant(std::mem::take(&mut content))
            } else {
                let mut blocks = Vec::with_capacity(tool_uses.len() + 1);
                if !content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: std::mem::take(&mut content),
                    });
                }
                blocks.append(&mut tool_uses);
                Message::new(Role::Assistant, MessageContent::Blocks(blocks))
            };
            yield StreamChunk::Done {
                sequence,
                finish_reason: map_stop_reason(stop_reason.as_deref()),
                usage: Some(Usage::new(input_tokens, output_tokens)),
                message,
            };
        }))
    }

    async fn list_models(
        &self,
        filter: Option<&ModelFilter>,
    ) -> Result<ListModelsResult, GatewayError> {
        let key = CacheKey::new(self.metadata.name.clone(), self.metadata.provider.clone());
        let result = model_cache()
            .get_or_fetch(key, || async {
                let builder = self
                    .client
                    .get(format!("{}/models", self.base_url))
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION);
                let list: wire::ModelList =
                    execute_json(builder, "anthropic", &CancellationToken::new()).await?;
                Ok(ListModelsResult {
                    models: list
                        .data
                        .into_iter()
                        .map(|entry| ModelInfo {
                            id: entry.id,
                            display_name: entry.display_name,
                            context_window: None,
                        })
                        .collect(),
                    source: ModelSource::Fetched,
                })
            })
            .await?;
        Ok(match filter {
            Some(filter) => result.filtered(filter),
            None => result,
        })
    }

    fn estimate_cost(&self, request: &ChatRequest) -> Option<CostEstimate> {
        let pricing = self.pricing?;
        let tokens: u32 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content.text()))
            .sum();
        Some(CostEstimate {
            estimated_prompt_tokens: tokens,
            estimated_usd: f64::from(tokens) / 1000.0 * pricing.prompt,
        })
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
