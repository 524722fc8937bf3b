//! Core of the news bot: virtual-role subscriptions, their configuration,
//! mass-mention broadcasting and forum housekeeping.
//!
//! This crate does not talk to any chat platform directly. The platform lives
//! behind the ports in [`platform::port`], implemented in adapter crates.

pub mod broadcast;
pub mod chunker;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod housekeeping;
pub mod logging;
pub mod mention;
pub mod panel;
pub mod persist;
pub mod platform;
pub mod role_config;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
