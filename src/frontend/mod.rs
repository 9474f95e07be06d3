// Concrete frontends. Each lifts an external dialect into the IR and renders
// IR results back into that dialect, including its streaming envelope.

pub mod passthrough;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "openai")]
pub mod openai;
