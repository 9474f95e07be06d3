// Structured-output engine: constrain generation to a schema, extract the
// JSON payload per mode, validate it, and hand back a typed value. The
// streaming variant yields progressively deeper partials as deltas arrive.

pub mod partial;

use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::Backend;
use crate::error::GatewayError;
use crate::ir::stream::{ChunkStream, StreamChunk};
use crate::ir::{
    ChatRequest, ChatResponse, FinishReason, Message, ResponseMetadata, SchemaMode, SchemaSpec,
    ToolChoice, ToolDefinition, Warning,
};
use partial::{deep_merge, parse_partial};

/// How to constrain the model. `name` becomes the synthesized tool name in
/// `tools` mode and the `response_format` name in `json_schema` mode.
#[derive(Debug, Clone)]
pub struct ObjectOptions {
    pub mode: SchemaMode,
    pub name: String,
    pub description: Option<String>,
}

impl Default for ObjectOptions {
    fn default() -> Self {
        Self {
            mode: SchemaMode::Tools,
            name: "structured_output".to_string(),
            description: None,
        }
    }
}

impl ObjectOptions {
    pub fn with_mode(mut self, mode: SchemaMode) -> Self {
        self.mode = mode;
        self
    }
}

/// A validated structured-output result.
#[derive(Debug, Clone)]
pub struct ObjectResult<T> {
    pub data: T,
    /// The JSON value as extracted, before typed deserialization.
    pub raw: Value,
    pub warnings: Vec<Warning>,
    pub finish_reason: FinishReason,
    pub metadata: ResponseMetadata,
}

/// Events of a streaming structured-output call.
#[derive(Debug, Clone)]
pub enum ObjectStreamEvent<T> {
    /// A deeper partial than the last one.
    Partial(Value),
    /// The terminal, schema-validated object.
    Complete(ObjectResult<T>),
}

/// Derive the wire schema spec for a native type.
pub fn schema_spec_for<T: JsonSchema>(options: &ObjectOptions) -> Result<SchemaSpec, GatewayError> {
    let schema = schemars::schema_for!(T);
    let json_schema = serde_json::to_value(&schema)?;
    Ok(SchemaSpec {
        json_schema,
        mode: options.mode,
        name: options.name.clone(),
        description: options.description.clone(),
    })
}

/// Rewrite a request so the model is constrained per the schema mode.
pub fn build_request(mut request: ChatRequest, spec: &SchemaSpec) -> ChatRequest {
    match spec.mode {
        SchemaMode::Tools => {
            request.tools = Some(vec![ToolDefinition {
                name: spec.name.clone(),
                description: spec
                    .description
                    .clone()
                    .unwrap_or_else(|| "Produce the requested structured output.".to_string()),
                parameters: spec.json_schema.clone(),
            }]);
            request.tool_choice = Some(ToolChoice::Tool {
                name: spec.name.clone(),
            });
        }
        SchemaMode::Json | SchemaMode::JsonSchema => {
            request.messages.insert(0, Message::system(json_instruction(spec)));
            request.parameters.temperature =
                Some(request.parameters.temperature.unwrap_or(0.0).max(0.0));
            if spec.mode == SchemaMode::JsonSchema {
                request.parameters.custom.insert(
                    "response_format".to_string(),
                    serde_json::json!({
                        "type": "json_schema",
                        "json_schema": { "name": spec.name, "schema": spec.json_schema },
                    }),
                );
            }
        }
        SchemaMode::MdJson => {
            request
                .messages
                .insert(0, Message::system(md_json_instruction(spec)));
            request.parameters.temperature =
                Some(request.parameters.temperature.unwrap_or(0.0).max(0.0));
        }
    }
    request.schema = Some(spec.clone());
    request
}

fn json_instruction(spec: &SchemaSpec) -> String {
    format!(
        "Respond with a single JSON value and nothing else. \
         The value must conform to this JSON Schema:\n{}",
        spec.json_schema
    )
}

fn md_json_instruction(spec: &SchemaSpec) -> String {
    format!(
        "Respond with a single fenced ```json code block and nothing else. \
         The JSON inside must conform to this JSON Schema:\n{}",
        spec.json_schema
    )
}

/// Pull the JSON payload out of a unary response per the schema mode.
pub fn extract(response: &ChatResponse, spec: &SchemaSpec) -> Result<Value, GatewayError> {
    match spec.mode {
        SchemaMode::Tools => {
            let uses = response.message.tool_uses();
            uses.iter()
                .find(|(_, name, _)| *name == spec.name)
                .or_else(|| uses.first())
                .map(|(_, _, input)| (*input).clone())
                .ok_or_else(|| GatewayError::SchemaValidation {
                    message: format!("response carries no '{}' tool call", spec.name),
                })
        }
        SchemaMode::Json | SchemaMode::JsonSchema => {
            let text = response.message.content.text();
            Ok(serde_json::from_str(text.trim())?)
        }
        SchemaMode::MdJson => {
            let text = response.message.content.text();
            let source = extract_fenced(&text)
                .or_else(|| extract_balanced(&text))
                .ok_or_else(|| GatewayError::SchemaValidation {
                    message: "no JSON block found in response".to_string(),
                })?;
            Ok(serde_json::from_str(source)?)
        }
    }
}

/// First fenced ```json block, if any.
fn extract_fenced(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// First balanced `{...}` substring, string-aware.
fn extract_balanced(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn validate_and_parse<T: DeserializeOwned>(
    schema: &Value,
    value: Value,
) -> Result<T, GatewayError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| GatewayError::SchemaValidation {
            message: format!("invalid schema: {}", e),
        })?;
    if let Err(error) = validator.validate(&value) {
        return Err(GatewayError::SchemaValidation {
            message: error.to_string(),
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Turn a dispatched response into a typed, validated result.
/// Validation failure is fatal; there is no retry inside the engine.
pub fn finish<T>(spec: &SchemaSpec, response: ChatResponse) -> Result<ObjectResult<T>, GatewayError>
where
    T: DeserializeOwned,
{
    let raw = extract(&response, spec)?;
    let data = validate_and_parse::<T>(&spec.json_schema, raw.clone())?;
    Ok(ObjectResult {
        data,
        raw,
        warnings: response.metadata.warnings.clone(),
        finish_reason: response.finish_reason,
        metadata: response.metadata,
    })
}

/// Non-streaming structured output straight against a backend (the bridge
/// routes through its middleware chain instead and calls [`finish`]).
pub async fn generate_object<T>(
    backend: &dyn Backend,
    request: ChatRequest,
    options: ObjectOptions,
    cancel: CancellationToken,
) -> Result<ObjectResult<T>, GatewayError>
where
    T: DeserializeOwned + JsonSchema,
{
    let spec = schema_spec_for::<T>(&options)?;
    let prepared = build_request(request, &spec);
    let response = backend.execute(prepared, cancel).await?;
    finish::<T>(&spec, response)
}

/// Streaming structured output over an already-open IR chunk stream.
///
/// Deltas accumulate into a JSON buffer; after each delta the buffer is
/// partial-parsed and deep-merged into the running partial, which is yielded
/// whenever it deepens. The terminal `done` chunk validates the full buffer.
pub fn generate_object_stream<T>(
    stream: ChunkStream,
    spec: SchemaSpec,
) -> impl Stream<Item = Result<ObjectStreamEvent<T>, GatewayError>> + Send
where
    T: DeserializeOwned + JsonSchema + Send + 'static,
{
    async_stream::stream! {
        let mut stream = stream;
        let mut buffer = String::new();
        let mut running: Option<Value> = None;
        let mut metadata = ResponseMetadata::default();

        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Start { metadata: start_metadata, .. } => {
                    metadata = start_metadata;
                }
                StreamChunk::Content { delta, .. } => {
                    if spec.mode != SchemaMode::Tools {
                        buffer.push_str(&delta);
                        if let Some(event) = advance(&mut running, &buffer, spec.mode) {
                            yield Ok(event);
                        }
                    }
                }
                StreamChunk::ToolCallDelta { input_delta, .. } => {
                    if spec.mode == SchemaMode::Tools {
                        buffer.push_str(&input_delta);
                        if let Some(event) = advance(&mut running, &buffer, spec.mode) {
                            yield Ok(event);
                        }
                    }
                }
                StreamChunk::Done {
                    finish_reason,
                    message,
                    ..
                } => {
                    let outcome = final_value(&buffer, &message, &spec).and_then(|raw| {
                        let data = validate_and_parse::<T>(&spec.json_schema, raw.clone())?;
                        Ok(ObjectStreamEvent::Complete(ObjectResult {
                            data,
                            raw,
                            warnings: metadata.warnings.clone(),
                            finish_reason,
                            metadata: metadata.clone(),
                        }))
                    });
                    yield outcome;
                    return;
                }
                StreamChunk::Error { code, message, .. } => {
                    yield Err(GatewayError::from_chunk(&code, &message));
                    return;
                }
            }
        }

        yield Err(GatewayError::Stream {
            message: "structured stream ended without a terminal chunk".to_string(),
        });
    }
}

/// Parse the buffer, merge into the running partial, and report whether the
/// partial deepened.
fn advance<T>(
    running: &mut Option<Value>,
    buffer: &str,
    mode: SchemaMode,
) -> Option<ObjectStreamEvent<T>> {
    let source = partial_source(buffer, mode);
    let parsed = parse_partial(source)?;
    match running {
        Some(current) => {
            let mut merged = current.clone();
            deep_merge(&mut merged, parsed);
            if merged != *current {
                *current = merged.clone();
                Some(ObjectStreamEvent::Partial(merged))
            } else {
                None
            }
        }
        None => {
            *running = Some(parsed.clone());
            Some(ObjectStreamEvent::Partial(parsed))
        }
    }
}

/// The JSON-bearing slice of the accumulated buffer for a given mode.
fn partial_source(buffer: &str, mode: SchemaMode) -> &str {
    match mode {
        SchemaMode::MdJson => match buffer.find("```json") {
            Some(start) => {
                let rest = &buffer[start + "```json".len()..];
                let rest = rest.strip_prefix('\n').unwrap_or(rest);
                match rest.find("```") {
                    Some(end) => &rest[..end],
                    None => rest,
                }
            }
            None => buffer,
        },
        _ => buffer,
    }
}

fn final_value(
    buffer: &str,
    message: &Message,
    spec: &SchemaSpec,
) -> Result<Value, GatewayError> {
    if spec.mode == SchemaMode::Tools {
        // Prefer the assembled tool call from `done`; fall back to the
        // accumulated argument deltas.
        let uses = message.tool_uses();
        if let Some((_, _, input)) = uses
            .iter()
            .find(|(_, name, _)| *name == spec.name)
            .or_else(|| uses.first())
        {
            return Ok((*input).clone());
        }
    }
    let source = partial_source(buffer, spec.mode);
    parse_partial(source).ok_or_else(|| GatewayError::SchemaValidation {
        message: "stream did not produce parseable JSON".to_string(),
    })
}
