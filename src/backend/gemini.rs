// Gemini backend: generateContent over reqwest + SSE streaming. Function
// calls arrive whole (not as argument deltas), so each one becomes a single
// tool-call delta with a synthesized call id.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
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
use crate::wire::gemini as wire;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    pricing: Option<PricePer1K>,
    metadata: AdapterMetadata,
    call_counter: Arc<AtomicU64>,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Result<Self, GatewayError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "Gemini API key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: GEMINI_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            pricing: None,
            metadata: AdapterMetadata::new("gemini-backend", "gemini", Self::capabilities()),
            call_counter: Arc::new(AtomicU64::new(1)),
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
            max_context_tokens: 1_000_000,
            system_message_strategy: SystemMessageStrategy::SeparateParameter,
            supports_multiple_system_messages: false,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: true,
            supports_frequency_penalty: true,
            supports_presence_penalty: true,
            max_stop_sequences: 5,
        }
    }

    fn next_call_id(&self) -> String {
        let idx = self.call_counter.fetch_add(1, Ordering::SeqCst);
        format!("gemini_call_{}", idx)
    }

    /// Lower an IR request onto the generateContent wire. System messages
    /// become `systemInstruction`.
    pub fn from_ir(
        &self,
        request: &ChatRequest,
    ) -> Result<(wire::GenerateContentRequest, Vec<Warning>), GatewayError> {
        let normalized = normalize(request.clone(), &self.metadata.capabilities);
        let ir = normalized.request;
        let system_instruction = normalized.system_parameter.map(|param| {
            let text = match param {
                SystemParameter::Single(text) => text,
                SystemParameter::Many(texts) => texts.join("\n\n"),
            };
            wire::Content {
                role: None,
                parts: vec![wire::Part {
                    text: Some(text),
                    ..wire::Part::default()
                }],
            }
        });

        // functionResponse parts need the function name, which only the
        // originating tool_use block knows.
        let names_by_call_id: HashMap<String, String> = ir
            .messages
            .iter()
            .flat_map(|m| m.tool_uses())
            .map(|(id, name, _)| (id.to_string(), name.to_string()))
            .collect();

        let mut contents = Vec::with_capacity(ir.messages.len());
        for message in &ir.messages {
            contents.push(self.convert_message(message, &names_by_call_id)?);
        }

        let params = &ir.parameters;
        let generation_config = wire::GenerationConfig {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            max_output_tokens: params.max_tokens,
            stop_sequences: (!params.stop_sequences.is_empty())
                .then(|| params.stop_sequences.clone()),
            candidate_count: None,
            seed: params.seed,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
        };

        let wire_request = wire::GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: Some(generation_config),
            tools: ir.tools.as_ref().map(|tools| {
                vec![wire::Tool {
                    function_declarations: tools
                        .iter()
                        .map(|t| wire::FunctionDeclaration {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        })
                        .collect(),
                }]
            }),
            tool_config: ir.tool_choice.as_ref().map(|choice| wire::ToolConfig {
                function_calling_config: match choice {
                    ToolChoice::Auto => wire::FunctionCallingConfig {
                        mode: "AUTO".to_string(),
                        allowed_function_names: None,
                    },
                    ToolChoice::None => wire::FunctionCallingConfig {
                        mode: "NONE".to_string(),
                        allowed_function_names: None,
                    },
                    ToolChoice::Required => wire::FunctionCallingConfig {
                        mode: "ANY".to_string(),
                        allowed_function_names: None,
                    },
                    ToolChoice::Tool { name } => wire::FunctionCallingConfig {
                        mode: "ANY".to_string(),
                        allowed_function_names: Some(vec![name.clone()]),
                    },
                },
            }),
        };
        Ok((wire_request, normalized.warnings))
    }

    fn convert_message(
        &self,
        message: &Message,
        names_by_call_id: &HashMap<String, String>,
    ) -> Result<wire::Content, GatewayError> {
        let role = match message.role {
            Role::User | Role::System | Role::Tool => "user",
            Role::Assistant => "model",
        };
        let parts = match &message.content {
            MessageContent::Text(text) => vec![wire::Part {
                text: Some(text.clone()),
                ..wire::Part::default()
            }],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| self.convert_block(block, names_by_call_id))
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(wire::Content {
            role: Some(role.to_string()),
            parts,
        })
    }

    fn convert_block(
        &self,
        block: &ContentBlock,
        names_by_call_id: &HashMap<String, String>,
    ) -> Result<wire::Part, GatewayError> {
        Ok(match block {
            ContentBlock::Text { text } => wire::Part {
                text: Some(text.clone()),
                ..wire::Part::default()
            },
            ContentBlock::Image { source } => match source {
                ImageSource::Base64 { media_type, data } => wire::Part {
                    inline_data: Some(wire::Blob {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                    ..wire::Part::default()
                },
                ImageSource::Url { url } => wire::Part {
                    file_data: Some(wire::FileData {
                        mime_type: None,
                        file_uri: url.clone(),
                    }),
                    ..wire::Part::default()
                },
            },
            ContentBlock::ToolUse { name, input, .. } => wire::Part {
                function_call: Some(wire::FunctionCall {
                    name: name.clone(),
                    args: input.clone(),
                }),
                ..wire::Part::default()
            },
            ContentBlock::ToolResult {
                tool_call_id,
                content,
            } => {
                let name = names_by_call_id
                    .get(tool_call_id)
                    .cloned()
                    .unwrap_or_else(|| tool_call_id.clone());
                wire::Part {
                    function_response: Some(wire::FunctionResponse {
                        name,
                        response: serde_json::json!({ "result": content }),
                    }),
                    ..wire::Part::default()
                }
            }
        })
    }

    /// Raise a generateContent response back into the IR.
    pub fn to_ir(
        &self,
        response: wire::GenerateContentResponse,
        request: &ChatRequest,
        latency_ms: u64,
        warnings: Vec<Warning>,
    ) -> Result<ChatResponse, GatewayError> {
        let raw = serde_json::to_value(&response)?;
        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            GatewayError::Conversion {
                adapter: self.metadata.name.clone(),
                message: "response carried no candidates".to_string(),
            }
        })?;

        let mut blocks: Vec<ContentBlock> = Vec::new();
        let mut has_function_call = false;
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    blocks.push(ContentBlock::Text { text: text.clone() });
                }
                if let Some(call) = &part.function_call {
                    has_function_call = true;
                    blocks.push(ContentBlock::ToolUse {
                        id: self.next_call_id(),
                        name: call.name.clone(),
                        input: call.args.clone(),
                    });
                }
            }
        }

        let message = if blocks.len() == 1 {
            match &blocks[0] {
                ContentBlock::Text { text } => Message::assistant(text.clone()),
                _ => Message::new(Role::Assistant, MessageContent::Blocks(blocks)),
            }
        } else {
            Message::new(Role::Assistant, MessageContent::Blocks(blocks))
        };

        let finish_reason = if has_function_call {
            FinishReason::ToolCalls
        } else {
            map_finish_reason(candidate.finish_reason.as_deref())
        };

        let mut metadata = ResponseMetadata::for_request(request);
        metadata.provenance.backend = Some(self.metadata.name.clone());
        metadata.warnings = warnings;
        metadata.latency_ms = Some(latency_ms);

        Ok(ChatResponse {
            message,
            finish_reason,
            usage: response.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
            metadata,
            raw: Some(raw),
        })
    }

    fn model_for(&self, request: &ChatRequest) -> String {
        request
            .parameters
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT")
        | Some("SPII") => FinishReason::ContentFilter,
        Some(other) => {
            log::warn!("unknown gemini finish reason '{}'", other);
            FinishReason::Stop
        }
        None => FinishReason::Stop,
    }
}

#[async_trait]
impl Backend for GeminiBackend {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        let (wire_request, warnings) = self.from_ir(&request)?;
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url,
            self.model_for(&request),
            self.api_key
        );
        let started = Instant::now();
        let response: wire::GenerateContentResponse =
            execute_json(self.client.post(url).json(&wire_request), "gemini", &cancel).await?;
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
        let (wire_request, warnings) = self.from_ir(&request)?;
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url,
            self.model_for(&request),
            self.api_key
        );
        let events = open_sse(self.client.post(url).json(&wire_request), "gemini", &cancel).await?;

        let mut metadata = ResponseMetadata::for_request(&request);
        metadata.provenance.backend = Some(self.metadata.name.clone());
        metadata.warnings = warnings;
        let call_counter = self.call_counter.clone();

        Ok(boxed(async_stream::stream! {
            futures::pin_mut!(events);
            let mut sequence: u64 = 0;
            yield StreamChunk::Start { sequence, metadata };
            sequence += 1;

            let mut content = String::new();
            let mut tool_uses: Vec<ContentBlock> = Vec::new();
            let mut finish: Option<String> = None;
            let mut usage: Option<wire::UsageMetadata> = None;

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
                            message: format!("gemini stream error: {}", err),
                        };
                        return;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }
                let chunk: wire::GenerateContentResponse =
                    match serde_json::from_str(&event.data) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            log::warn!("unrecognized gemini stream payload: {}", err);
                            continue;
                        }
                    };

                if let Some(u) = chunk.usage_metadata {
                    usage = Some(u);
                }
                for candidate in chunk.candidates {
                    if let Some(reason) = candidate.finish_reason {
                        finish = Some(reason);
                    }
                    let Some(part_content) = candidate.content else { continue };
                    for part in part_content.parts {
                        if let Some(text) = part.text {
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
                        if let Some(call) = part.function_call {
                            let id = format!(
                                "gemini_call_{}",
                                call_counter.fetch_add(1, Ordering::SeqCst)
                            );
                            let input_delta = call.args.to_string();
                            tool_uses.push(ContentBlock::ToolUse {
                                id: id.clone(),
                                name: call.name.clone(),
                                input: call.args,
                            });
                            yield StreamChunk::ToolCallDelta {
                                sequence,
                                id,
                                name: Some(call.name),
                                input_delta,
                            };
                            sequence += 1;
                        }
                    }
                }
            }

            let had_tool_calls = !tool_uses.is_empty();
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
            let finish_reason = if had_tool_calls {
                FinishReason::ToolCalls
            } else {
                map_finish_reason(finish.as_deref())
            };
            yield StreamChunk::Done {
                sequence,
                finish_reason,
                usage: usage.map(|u| Usage {
                    prompt_tokens: u.prompt_token_count,
                    completion_tokens: u.candidates_token_count,
                    total_tokens: u.total_token_count,
                }),
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
                let url = format!("{}/models?key={}", self.base_url, self.api_key);
                let list: wire::ModelList =
                    execute_json(self.client.get(url), "gemini", &CancellationToken::new())
                        .await?;
                Ok(ListModelsResult {
                    models: list
                        .models
                        .into_iter()
                        .map(|entry| ModelInfo {
                            id: entry
                                .name
                                .strip_prefix("models/")
                                .unwrap_or(&entry.name)
                                .to_string(),
                            display_name: entry.display_name,
                            context_window: entry.input_token_limit,
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
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        self.client
            .get(url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> GeminiBackend {
        GeminiBackend::new("test-key").unwrap()
    }

    #[test]
    fn from_ir_builds_system_instruction() {
        let request = ChatRequest::new(vec![
            Message::system("Answer tersely."),
            Message::user("hi"),
        ]);
        let (wire_request, _) = backend().from_ir(&request).unwrap();
        assert_eq!(wire_request.contents.len(), 1);
        let instruction = wire_request.system_instruction.unwrap();
        assert_eq!(instruction.parts[0].text.as_deref(), Some("Answer tersely."));
    }

    #[test]
    fn tool_results_resolve_function_names() {
        let request = ChatRequest::new(vec![
            Message::user("weather?"),
            Message::new(
                Role::Assistant,
                MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "call_9".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({"city": "Tokyo"}),
                }]),
            ),
            Message::new(
                Role::Tool,
                MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_call_id: "call_9".to_string(),
                    content: "sunny".to_string(),
                }]),
            ),
        ]);
        let (wire_request, _) = backend().from_ir(&request).unwrap();
        let response = wire_request.contents[2].parts[0]
            .function_response
            .as_ref()
            .unwrap();
        assert_eq!(response.name, "get_weather");
    }

    #[test]
    fn forced_tool_choice_uses_any_mode() {
        let mut request = ChatRequest::new(vec![Message::user("extract")]);
        request.tool_choice = Some(ToolChoice::Tool {
            name: "extract".to_string(),
        });
        let (wire_request, _) = backend().from_ir(&request).unwrap();
        let config = wire_request.tool_config.unwrap().function_calling_config;
        assert_eq!(config.mode, "ANY");
        assert_eq!(config.allowed_function_names.unwrap(), vec!["extract"]);
    }

    #[test]
    fn to_ir_synthesizes_tool_call_ids() {
        let response: wire::GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "functionCall": { "name": "extract", "args": {"age": 30} } }
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 7, "totalTokenCount": 12 }
        }))
        .unwrap();
        let request = ChatRequest::new(vec![Message::user("John is 30")]);
        let ir = backend().to_ir(response, &request, 3, Vec::new()).unwrap();
        assert_eq!(ir.finish_reason, FinishReason::ToolCalls);
        let uses = ir.message.tool_uses();
        assert!(uses[0].0.starts_with("gemini_call_"));
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(
            map_finish_reason(Some("SAFETY")),
            FinishReason::ContentFilter
        );
    }
}
