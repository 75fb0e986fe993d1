//! # Gateway Routing
//!
//! Provider catalog and cost-aware, breaker-filtered provider selection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;
pub mod selector;

pub use registry::{ModelEntry, ModelListing, Provider, ProviderRegistry};
pub use selector::{ProviderSelector, Selected};
