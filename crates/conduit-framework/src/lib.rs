//! Configuration and process-wide facade for the conduit event
//! substrate.
//!
//! [`Config`] layers defaults, `conduit.toml`, and `CONDUIT_`-prefixed
//! environment variables. [`EventFramework`] turns a loaded config
//! into a running substrate: a backend tier, its bus adapter, the
//! outbox and inbox ledgers, and the background drainer task.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod framework;

pub use config::Config;
pub use framework::{BackendTier, EventFramework};
