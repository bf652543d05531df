//! # lqbench-core
//!
//! Foundation types shared by the lqbench crates:
//!
//! - [`ids`]: branded identifiers (run id, correlation id, subscription handle)
//! - [`wire`]: outbound request and inbound frame envelopes
//! - [`classify`]: notification vs. response classification
//! - [`logging`]: subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod classify;
pub mod ids;
pub mod logging;
pub mod wire;

pub use classify::{MessageKind, classify, is_notification, is_response};
pub use ids::{CorrelationId, RunId, SubscriptionHandle};
pub use wire::{InboundMessage, RpcRequest};
