// Vendor wire shapes, one module per dialect. Each vendor's frontend and
// backend share these serde types so the two directions of a dialect cannot
// drift apart.

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "openai")]
pub mod openai;
