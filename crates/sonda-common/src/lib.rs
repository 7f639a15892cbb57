//! Common types and utilities for sonda
//!
//! This crate provides the functionality shared by the engine and network
//! crates:
//! - Core value types (Destination, Fingerprint, SessionId, sequence counters)
//! - Session configuration
//! - Logging infrastructure
//! - Error types

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::PingConfiguration;
pub use error::{Error, Result};
pub use types::{Destination, Fingerprint, SequenceCounters, SessionId, Timestamp};

/// Version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
