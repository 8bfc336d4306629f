//! OpenAI-compatible binding for the salience capabilities.
//!
//! [`OpenAiClient`] implements extraction, summarization, embeddings and
//! drift judging over HTTP, so a host can wire a whole engine with
//! [`salience_core::Capabilities::from_client`].

pub mod client;
pub mod config;
pub mod error;
pub mod prompts;

pub use client::OpenAiClient;
pub use config::OpenAiConfig;
pub use error::LlmError;
