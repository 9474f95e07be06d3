// OpenAI backend: chat completions over reqwest + SSE streaming.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
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
use crate::normalize::normalize;
use crate::wire::openai as wire;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    pricing: Option<PricePer1K>,
    metadata: AdapterMetadata,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>) -> Result<Self, GatewayError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "OpenAI API key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: OPENAI_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            pricing: None,
            metadata: AdapterMetadata::new("openai-backend", "openai", Self::capabilities()),
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
            max_context_tokens: 128_000,
            system_message_strategy: SystemMessageStrategy::InMessages,
            supports_multiple_system_messages: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: false,
            supports_seed: true,
            supports_frequency_penalty: true,
            supports_presence_penalty: true,
            max_stop_sequences: 4,
        }
    }

    /// Lower an IR request onto the chat-completions wire.
    pub fn from_ir(
        &self,
        request: &ChatRequest,
    ) -> Result<(wire::ChatCompletionRequest, Vec<Warning>), GatewayError> {
        let normalized = normalize(request.clone(), &self.metadata.capabilities);
        let ir = normalized.request;

        let mut messages = Vec::with_capacity(ir.messages.len());
        for message in &ir.messages {
            messages.extend(self.convert_message(message)?);
        }

        let params = &ir.parameters;
        let wire_request = wire::ChatCompletionRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            stop: (!params.stop_sequences.is_empty()).then(|| params.stop_sequences.clone()),
            seed: params.seed,
            stream: None,
            stream_options: None,
            tools: ir.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| wire::Tool {
                        tool_type: "function".to_string(),
                        function: wire::Function {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            tool_choice: ir.tool_choice.as_ref().map(|choice| match choice {
                ToolChoice::Auto => wire::ToolChoice::Mode("auto".to_string()),
                ToolChoice::None => wire::ToolChoice::Mode("none".to_string()),
                ToolChoice::Required => wire::ToolChoice::Mode("required".to_string()),
                ToolChoice::Tool { name } => wire::ToolChoice::Named {
                    choice_type: "function".to_string(),
                    function: wire::NamedFunction { name: name.clone() },
                },
            }),
            response_format: params.custom.get("response_format").cloned(),
        };
        Ok((wire_request, normalized.warnings))
    }

    fn convert_message(&self, message: &Message) -> Result<Vec<wire::ChatMessage>, GatewayError> {
        match message.role {
            Role::System | Role::User => {
                let role = if message.role == Role::System {
                    "system"
                } else {
                    "user"
                };
                Ok(vec![wire::ChatMessage {
                    role: role.to_string(),
                    content: Some(self.convert_content(&message.content)),
                    tool_calls: None,
                    tool_call_id: None,
                }])
            }
            Role::Assistant => {
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
                Ok(vec![wire::ChatMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty()).then(|| wire::MessageContent::Text(text)),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                }])
            }
            Role::Tool => {
                let MessageContent::Blocks(blocks) = &message.content else {
                    return Err(self.conversion_error("tool message without tool_result block"));
                };
                let results: Vec<wire::ChatMessage> = blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult {
                            tool_call_id,
                            content,
                        } => Some(wire::ChatMessage {
                            role: "tool".to_string(),
                            content: Some(wire::MessageContent::Text(content.clone())),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id.clone()),
                        }),
                        _ => None,
                    })
                    .collect();
                if results.is_empty() {
                    return Err(self.conversion_error("tool message without tool_result block"));
                }
                Ok(results)
            }
        }
    }

    fn convert_content(&self, content: &MessageContent) -> wire::MessageContent {
        match content {
            MessageContent::Text(text) => wire::MessageContent::Text(text.clone()),
            MessageContent::Blocks(blocks) => {
                let parts: Vec<wire::ContentPart> = blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(wire::ContentPart::Text {
                            text: text.clone(),
                        }),
                        ContentBlock::Image { source } => Some(wire::ContentPart::ImageUrl {
                            image_url: wire::ImageUrl {
                                url: match source {
                                    ImageSource::Url { url } => url.clone(),
                                    ImageSource::Base64 { media_type, data } => {
                                        format!("data:{};base64,{}", media_type, data)
                                    }
                                },
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                wire::MessageContent::Parts(parts)
            }
        }
    }

    fn conversion_error(&self, message: &str) -> GatewayError {
        GatewayError::Conversion {
            adapter: self.metadata.name.clone(),
            message: message.to_string(),
        }
    }

    /// Raise a wire response back into the IR.
    pub fn to_ir(
        &self,
        response: wire::ChatCompletionResponse,
        request: &ChatRequest,
        latency_ms: u64,
        warnings: Vec<Warning>,
    ) -> Result<ChatResponse, GatewayError> {
        let raw = serde_json::to_value(&response)?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.conversion_error("response carried no choices"))?;

        let text = match &choice.message.content {
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
        let tool_calls = choice.message.tool_calls.unwrap_or_default();
        let message = assemble_message(text, parse_tool_calls(&tool_calls));

        let mut metadata = ResponseMetadata::for_request(request);
        metadata.provenance.backend = Some(self.metadata.name.clone());
        metadata.warnings = warnings;
        metadata.latency_ms = Some(latency_ms);

        Ok(ChatResponse {
            message,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage: response.usage.map(convert_usage),
            metadata,
            raw: Some(raw),
        })
    }

    fn request_builder(&self, body: &wire::ChatCompletionRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => {
            log::warn!("unknown openai finish reason '{}'", other);
            FinishReason::Stop
        }
        None => FinishReason::Stop,
    }
}

fn convert_usage(usage: wire::Usage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        },
    }
}

fn parse_tool_calls(calls: &[wire::ToolCall]) -> Vec<ContentBlock> {
    calls
        .iter()
        .map(|call| ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

fn assemble_message(text: String, tool_uses: Vec<ContentBlock>) -> Message {
    if tool_uses.is_empty() {
        Message::assistant(text)
    } else {
        let mut blocks = Vec::with_capacity(tool_uses.len() + 1);
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
        blocks.extend(tool_uses);
        Message::new(Role::Assistant, MessageContent::Blocks(blocks))
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
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
        let response: wire::ChatCompletionResponse =
            execute_json(self.request_builder(&wire_request), "openai", &cancel).await?;
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
        wire_request.stream_options = Some(wire::StreamOptions {
            include_usage: true,
        });
        let events = open_sse(self.request_builder(&wire_request), "openai", &cancel).await?;

        let mut metadata = ResponseMetadata::for_request(&request);
        metadata.provenance.backend = Some(self.metadata.name.clone());
        metadata.warnings = warnings;

        Ok(boxed(async_stream::stream! {
            futures::pin_mut!(events);
            let mut sequence: u64 = 0;
            yield StreamChunk::Start { sequence, metadata };
            sequence += 1;

            let mut content = String::new();
            // (id, name, accumulated argument json) per tool-call slot.
            let mut calls: Vec<(String, String, String)> = Vec::new();
            let mut slot_by_index: HashMap<usize, usize> = HashMap::new();
            let mut finish: Option<String> = None;
            let mut usage: Option<wire::Usage> = None;

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
                            message: format!("openai stream error: {}", err),
                        };
                        return;
                    }
                };

                if event.data.trim() == "[DONE]" {
                    break;
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                let chunk: wire::ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        log::warn!("unrecognized openai stream payload: {}", err);
                        continue;
                    }
                };

                if let Some(u) = chunk.usage {
                    usage = Some(u);
                }
                for choice in chunk.choices {
                    if let Some(reason) = choice.finish_reason {
                        finish = Some(reason);
                    }
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            content.push_str(&text);
                            yield StreamChunk::Content {
                                sequence,
                                delta: text,
                                accumulated: None,
                            };
                            sequence += 1;
                        }
                    }
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        let slot = *slot_by_index.entry(delta.index).or_insert_with(|| {
                            calls.push((String::new(), String::new(), String::new()));
                            calls.len() - 1
                        });
                        if let Some(id) = &delta.id {
                            calls[slot].0 = id.clone();
                        }
                        let mut announced_name = None;
                        let mut arguments = String::new();
                        if let Some(function) = delta.function {
                            if let Some(name) = function.name {
                                calls[slot].1 = name.clone();
                                announced_name = Some(name);
                            }
                            if let Some(args) = function.arguments {
                                arguments = args;
                            }
                        }
                        calls[slot].2.push_str(&arguments);
                        yield StreamChunk::ToolCallDelta {
                            sequence,
                            id: calls[slot].0.clone(),
                            name: announced_name,
                            input_delta: arguments,
                        };
                        sequence += 1;
                    }
                }
            }

            let tool_uses: Vec<ContentBlock> = calls
                .into_iter()
                .map(|(id, name, arguments)| ContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
                })
                .collect();
            let finish_reason = if !tool_uses.is_empty() {
                FinishReason::ToolCalls
            } else {
                map_finish_reason(finish.as_deref())
            };
            yield StreamChunk::Done {
                sequence,
                finish_reason,
                usage: usage.map(convert_usage),
                message: assemble_message(content, tool_uses),
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
                    .bearer_auth(&self.api_key);
                let list: wire::ModelList =
                    execute_json(builder, "openai", &CancellationToken::new()).await?;
                Ok(ListModelsResult {
                    models: list
                        .data
                        .into_iter()
                        .map(|entry| ModelInfo {
                            id: entry.id,
                            display_name: None,
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
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new("sk-test").unwrap()
    }

    #[test]
    fn rejects_empty_key() {
        assert!(OpenAiBackend::new("  ").is_err());
    }

    #[test]
    fn from_ir_keeps_system_in_messages() {
        let request = ChatRequest::new(vec![
            Message::system("be brief"),
            Message::user("ping"),
        ])
        .with_model("gpt-4o");
        let (wire_request, warnings) = backend().from_ir(&request).unwrap();
        assert_eq!(wire_request.model, "gpt-4o");
        assert_eq!(wire_request.messages.len(), 2);
        assert_eq!(wire_request.messages[0].role, "system");
        assert!(warnings.is_empty());
    }

    #[test]
    fn from_ir_truncates_stops_past_four() {
        let mut request = ChatRequest::new(vec![Message::user("ping")]);
        request.parameters.stop_sequences =
            (0..6).map(|i| format!("stop{}", i)).collect();
        let (wire_request, warnings) = backend().from_ir(&request).unwrap();
        assert_eq!(wire_request.stop.as_ref().unwrap().len(), 4);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn from_ir_maps_forced_tool_choice() {
        let mut request = ChatRequest::new(vec![Message::user("extract")]);
        request.tools = Some(vec![crate::ir::ToolDefinition {
            name: "extract".to_string(),
            description: "pull fields".to_string(),
            parameters: serde_json::json!({"type":"object"}),
        }]);
        request.tool_choice = Some(ToolChoice::Tool {
            name: "extract".to_string(),
        });
        let (wire_request, _) = backend().from_ir(&request).unwrap();
        match wire_request.tool_choice.unwrap() {
            wire::ToolChoice::Named { function, .. } => assert_eq!(function.name, "extract"),
            other => panic!("expected named tool choice, got {:?}", other),
        }
    }

    #[test]
    fn to_ir_maps_choice_and_usage() {
        let response: wire::ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "pong" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 }
        }))
        .unwrap();
        let request = ChatRequest::new(vec![Message::user("ping")]);
        let ir = backend().to_ir(response, &request, 12, Vec::new()).unwrap();
        assert_eq!(ir.message.content.text(), "pong");
        assert_eq!(ir.finish_reason, FinishReason::Stop);
        assert_eq!(ir.usage.unwrap().total_tokens, 4);
        assert_eq!(ir.metadata.request_id, request.metadata.request_id);
        assert_eq!(ir.metadata.latency_ms, Some(12));
    }

    #[test]
    fn to_ir_parses_tool_calls() {
        let response: wire::ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "extract", "arguments": "{\"name\":\"John\",\"age\":30}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        let request = ChatRequest::new(vec![Message::user("John is 30")]);
        let ir = backend().to_ir(response, &request, 5, Vec::new()).unwrap();
        assert_eq!(ir.finish_reason, FinishReason::ToolCalls);
        let uses = ir.message.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].2["age"], 30);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(
            map_finish_reason(Some("content_filter")),
            FinishReason::ContentFilter
        );
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }
}
