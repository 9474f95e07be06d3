// Capability normalizer: reshapes an IR request onto what a backend's
// capability set can express. Runs inside each backend's request conversion,
// after router selection, so the applied policy always matches the backend
// that actually serves the request.

use crate::adapter::{Capabilities, SystemMessageStrategy};
use crate::ir::{
    warning, ChatRequest, ContentBlock, Message, MessageContent, Role, Warning,
};

/// System text extracted for backends using a separate parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemParameter {
    Single(String),
    Many(Vec<String>),
}

/// The outcome of normalization: a reshaped request, the extracted system
/// parameter (when the strategy calls for one), and any warnings to surface
/// in response metadata.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub request: ChatRequest,
    pub system_parameter: Option<SystemParameter>,
    pub warnings: Vec<Warning>,
}

/// Apply the backend's system-message strategy and parameter support to a
/// request. The input value is consumed; the caller keeps its own copy when
/// it needs the original.
pub fn normalize(mut request: ChatRequest, caps: &Capabilities) -> NormalizedRequest {
    let mut warnings = Vec::new();

    let system_parameter = apply_system_strategy(&mut request, caps, &mut warnings);
    apply_parameter_support(&mut request, caps, &mut warnings);
    truncate_stop_sequences(&mut request, caps, &mut warnings);

    NormalizedRequest {
        request,
        system_parameter,
        warnings,
    }
}

fn system_texts(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.text())
        .collect()
}

fn apply_system_strategy(
    request: &mut ChatRequest,
    caps: &Capabilities,
    warnings: &mut Vec<Warning>,
) -> Option<SystemParameter> {
    let texts = system_texts(&request.messages);
    if texts.is_empty() {
        return None;
    }

    match caps.system_message_strategy {
        SystemMessageStrategy::InMessages => {
            if !caps.supports_multiple_system_messages && texts.len() > 1 {
                merge_consecutive_system(&mut request.messages);
            }
            None
        }
        SystemMessageStrategy::SeparateParameter => {
            request.messages.retain(|m| m.role != Role::System);
            if caps.supports_multiple_system_messages {
                Some(SystemParameter::Many(texts))
            } else {
                Some(SystemParameter::Single(texts.join("\n\n")))
            }
        }
        SystemMessageStrategy::PrependedToFirstUser => {
            request.messages.retain(|m| m.role != Role::System);
            let joined = texts.join("\n\n");
            match request.messages.iter_mut().find(|m| m.role == Role::User) {
                Some(user) => prepend_text(user, &joined),
                None => request.messages.insert(0, Message::user(joined)),
            }
            None
        }
        SystemMessageStrategy::Unsupported => {
            request.messages.retain(|m| m.role != Role::System);
            warnings.push(Warning::new(
                warning::DROPPED_SYSTEM_MESSAGES,
                format!(
                    "{} system message(s) dropped: backend has no system-message support",
                    texts.len()
                ),
            ));
            None
        }
    }
}

/// Collapse each run of consecutive system messages into one, joining their
/// text with a blank line.
fn merge_consecutive_system(messages: &mut Vec<Message>) {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages.drain(..) {
        if message.role == Role::System {
            if let Some(last) = merged.last_mut() {
                if last.role == Role::System {
                    let joined = format!("{}\n\n{}", last.content.text(), message.content.text());
                    last.content = MessageContent::Text(joined);
                    continue;
                }
            }
            merged.push(Message::system(message.content.text()));
        } else {
            merged.push(message);
        }
    }
    *messages = merged;
}

fn prepend_text(message: &mut Message, prefix: &str) {
    match &mut message.content {
        MessageContent::Text(text) => {
            *text = format!("{}\n\n{}", prefix, text);
        }
        MessageContent::Blocks(blocks) => {
            blocks.insert(
                0,
                ContentBlock::Text {
                    text: format!("{}\n\n", prefix),
                },
            );
        }
    }
}

fn apply_parameter_support(
    request: &mut ChatRequest,
    caps: &Capabilities,
    warnings: &mut Vec<Warning>,
) {
    let params = &mut request.parameters;
    let mut warn = |name: &str| {
        warnings.push(Warning::new(
            warning::UNSUPPORTED_PARAMETER,
            format!("parameter '{}' is not supported by this backend", name),
        ));
    };

    if !caps.supports_temperature && params.temperature.take().is_some() {
        warn("temperature");
    }
    if !caps.supports_top_p && params.top_p.take().is_some() {
        warn("topP");
    }
    if !caps.supports_top_k && params.top_k.take().is_some() {
        warn("topK");
    }
    if !caps.supports_seed && params.seed.take().is_some() {
        warn("seed");
    }
    if !caps.supports_frequency_penalty && params.frequency_penalty.take().is_some() {
        warn("frequencyPenalty");
    }
    if !caps.supports_presence_penalty && params.presence_penalty.take().is_some() {
        warn("presencePenalty");
    }
}

fn truncate_stop_sequences(
    request: &mut ChatRequest,
    caps: &Capabilities,
    warnings: &mut Vec<Warning>,
) {
    let stops = &mut request.parameters.stop_sequences;
    if stops.len() > caps.max_stop_sequences {
        let dropped = stops.len() - caps.max_stop_sequences;
        stops.truncate(caps.max_stop_sequences);
        warnings.push(Warning::new(
            warning::TRUNCATED_STOP_SEQUENCES,
            format!(
                "stop sequences truncated to {} ({} dropped)",
                caps.max_stop_sequences, dropped
            ),
        ));
    }
}
