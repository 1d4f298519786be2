//! Generation provider implementations for Luna Villa.
//!
//! All providers implement the `lunavilla_core::Provider` trait.
//! The router selects the correct provider based on configuration.

pub mod gemini;
pub mod openai_compat;
pub mod router;
mod sse;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use router::build_from_config;
