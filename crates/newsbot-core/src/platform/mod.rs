//! Chat-platform abstractions. The Discord REST adapter lives in its own crate.

pub mod port;
pub mod throttled;
pub mod types;
