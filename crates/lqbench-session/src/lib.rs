//! # lqbench-session
//!
//! One benchmark session: sign in, select a scope, open a live
//! subscription, fire a write burst, and reconcile acknowledgements and
//! notifications before a deadline.
//!
//! - [`machine`]: event-driven protocol sequencer
//! - [`state`]: stages, session record, teardown
//! - [`timers`]: deadline, load-wait, and keepalive timers
//! - [`correlation`]: request id generation
//! - [`transcript`]: ordered event log for diagnostics
//! - [`driver`]: WebSocket loop and session reports

#![deny(unsafe_code)]

pub mod config;
pub mod correlation;
pub mod driver;
pub mod errors;
pub mod machine;
pub mod metrics;
pub mod state;
pub mod timers;
pub mod transcript;

pub use config::SessionConfig;
pub use correlation::CorrelationIdGenerator;
pub use driver::{SessionDriver, SessionReport, SessionStatus};
pub use errors::SessionError;
pub use machine::{ProtocolStateMachine, SessionEvent};
pub use state::{SessionState, SessionStats, Stage, TeardownKind};
pub use timers::{TimerFired, TimerId, TimerPurpose, TimerRegistry};
pub use transcript::{RecordedEvent, Transcript, TranscriptEntry};
