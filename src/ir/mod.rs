// Vendor-neutral intermediate representation for chat requests and responses.
// Frontends lower their dialect into these types; backends raise them onto the
// provider wire. Values are treated as immutable once built: middleware that
// rewrites a request constructs a new value carrying the same request id.

pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

// ============================================================================
// Messages and content
// ============================================================================

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ImageSource {
    Url { url: String },
    Base64 { media_type: String, data: String },
}

/// A single content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The result of a prior tool invocation, correlated by id.
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

/// Message body: either plain text or an ordered block sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenate all text, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self { role, content }
    }

    /// A plain-text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// All `tool_use` blocks in this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.as_str(), name.as_str(), input))
                    }
                    _ => None,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Parameters, tools, schema
// ============================================================================

/// Generation parameters. Everything is optional; backends drop what they do
/// not support (recording a warning when the caller set the value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Parameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Opaque vendor passthrough (e.g. `response_format`).
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

/// Tool definition forwarded to providers that support function calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the accepted input.
    pub parameters: serde_json::Value,
}

/// Tool selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool { name: String },
}

/// Stream emission mode, see the accumulator in `crate::stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Each content chunk carries only the new delta.
    Delta,
    /// Each content chunk also carries the running concatenation so far.
    Accumulated,
}

/// How a structured-output request constrains the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Synthesize a single forced tool whose input is the schema.
    Tools,
    /// Prepend the schema as a system message and expect a raw JSON body.
    Json,
    /// `json` plus a `response_format` hint for providers that honor it.
    JsonSchema,
    /// `json` but the reply arrives inside a fenced ```json block.
    MdJson,
}

/// Schema constraint attached to a structured-output request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSpec {
    pub json_schema: serde_json::Value,
    pub mode: SchemaMode,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ============================================================================
// Metadata
// ============================================================================

/// Which adapters a request/response passed through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

/// Request metadata. The request id is assigned once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: String) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            provenance: Provenance::default(),
            custom: serde_json::Map::new(),
        }
    }
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-fatal note recorded while serving a request (truncated stop
/// sequences, dropped parameters, dropped system messages, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Warning codes emitted by the core.
pub mod warning {
    pub const TRUNCATED_STOP_SEQUENCES: &str = "truncated-stop-sequences";
    pub const UNSUPPORTED_PARAMETER: &str = "unsupported-parameter";
    pub const DROPPED_SYSTEM_MESSAGES: &str = "dropped-system-messages";
    pub const UNKNOWN_CHUNK: &str = "unknown-chunk";
    pub const ESTIMATED_USAGE: &str = "estimated-usage";
}

/// Response metadata; carries the request id through. The timestamp is set
/// when the response is built, so frontends can render time fields without
/// reading the clock themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl Default for ResponseMetadata {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            timestamp: Utc::now(),
            provenance: Provenance::default(),
            warnings: Vec::new(),
            latency_ms: None,
            custom: serde_json::Map::new(),
        }
    }
}

impl ResponseMetadata {
    /// Seed response metadata from the request it answers.
    pub fn for_request(request: &ChatRequest) -> Self {
        Self {
            request_id: request.metadata.request_id.clone(),
            provenance: request.metadata.provenance.clone(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Request / response
// ============================================================================

/// A vendor-neutral chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<StreamMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaSpec>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            parameters: Parameters::default(),
            tools: None,
            tool_choice: None,
            stream: false,
            stream_mode: None,
            schema: None,
            metadata: RequestMetadata::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.parameters.model = Some(model.into());
        self
    }

    /// Enforce the structural invariants: a non-empty message list, and every
    /// `tool_result` referring back to a prior assistant `tool_use`.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::Validation {
                field: Some("messages".to_string()),
                message: "messages must not be empty".to_string(),
            });
        }

        let mut seen_tool_use_ids: Vec<&str> = Vec::new();
        for message in &self.messages {
            if message.role == Role::Assistant {
                for (id, _, _) in message.tool_uses() {
                    seen_tool_use_ids.push(id);
                }
            }
            if let MessageContent::Blocks(blocks) = &message.content {
                for block in blocks {
                    if let ContentBlock::ToolResult { tool_call_id, .. } = block {
                        if !seen_tool_use_ids.contains(&tool_call_id.as_str()) {
                            return Err(GatewayError::Validation {
                                field: Some("messages".to_string()),
                                message: format!(
                                    "tool result '{}' has no matching tool_use",
                                    tool_call_id
                                ),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Total prompt characters, used by the token estimator.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.text().len()).sum()
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

/// Token accounting, when the provider reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A vendor-neutral chat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: Message,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub metadata: ResponseMetadata,
    /// Opaque provider payload, for callers that need vendor fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// The documented heuristic: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() + 3) / 4) as u32
}

/// Estimate usage for a request/response pair from content length.
pub fn estimate_usage(request: &ChatRequest, completion: &str) -> Usage {
    let prompt: u32 = request
        .messages
        .iter()
        .map(|m| estimate_tokens(&m.content.text()))
        .sum();
    Usage::new(prompt, estimate_tokens(completion))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_joins_blocks() {
        let msg = Message::new(
            Role::User,
            MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "Hello ".to_string(),
                },
                ContentBlock::Image {
                    source: ImageSource::Url {
                        url: "https://example.com/cat.png".to_string(),
                    },
                },
                ContentBlock::Text {
                    text: "world".to_string(),
                },
            ]),
        );
        assert_eq!(msg.content.text(), "Hello world");
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let request = ChatRequest::new(vec![]);
        let err = request.validate().unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn validate_requires_matching_tool_use() {
        let orphan = ChatRequest::new(vec![
            Message::user("hi"),
            Message::new(
                Role::Tool,
                MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_call_id: "call_1".to_string(),
                    content: "42".to_string(),
                }]),
            ),
        ]);
        assert!(orphan.validate().is_err());

        let linked = ChatRequest::new(vec![
            Message::user("hi"),
            Message::new(
                Role::Assistant,
                MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "call_1".to_string(),
                    name: "calc".to_string(),
                    input: serde_json::json!({"expression": "6*7"}),
                }]),
            ),
            Message::new(
                Role::Tool,
                MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_call_id: "call_1".to_string(),
                    content: "42".to_string(),
                }]),
            ),
        ]);
        assert!(linked.validate().is_ok());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = ChatRequest::new(vec![Message::user("x")]);
        let b = ChatRequest::new(vec![Message::user("x")]);
        assert_ne!(a.metadata.request_id, b.metadata.request_id);
    }

    #[test]
    fn content_block_wire_shape() {
        let block = ContentBlock::ToolResult {
            tool_call_id: "call_9".to_string(),
            content: "ok".to_string(),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["toolCallId"], "call_9");

        let image = ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: "image/png".to_string(),
                data: "aGk=".to_string(),
            },
        };
        let value = serde_json::to_value(&image).unwrap();
        assert_eq!(value["source"]["kind"], "base64");
        assert_eq!(value["source"]["mediaType"], "image/png");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
