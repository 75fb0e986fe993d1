//! # Gateway Core
//!
//! Core types and error handling for the AI Model Gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Unified request and response types
//! - The dispatch outcome contract shared with provider adapters
//! - Error types and handling
//! - Validated domain types (newtypes)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod request;
pub mod response;
pub mod types;

// Re-export commonly used types
pub use error::{GatewayError, GatewayResult};
pub use request::{ChatMessage, EmbeddingInput, GatewayRequest, MessageRole};
pub use response::{Choice, Dispatched, EmbeddingData, GatewayResponse, Usage};
pub use types::{ModelId, ProviderId, RequestId, SubjectKey};
