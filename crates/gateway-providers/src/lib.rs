//! # Gateway Providers
//!
//! Provider wire-format transforms (OpenAI-compatible and Anthropic) and
//! the HTTP dispatcher that carries unified requests upstream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anthropic;
pub mod dispatch;
pub mod openai;

pub use dispatch::{split_merged_response, HttpDispatcher, ProviderDispatcher};
