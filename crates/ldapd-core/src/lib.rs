//! Core types: shutdown state machine, tracing setup

pub mod shutdown;
pub mod tracing;

pub use shutdown::{ShutdownFlag, ShutdownReason};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
