//! Test infrastructure and fixtures for deterministic conduit tests.
//!
//! Provides envelope builders, scripted event handlers, and embedded
//! database pools so integration tests stay reproducible without any
//! external broker.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod fixtures;
pub mod handlers;

pub use conduit_core::{Clock, SystemClock, TestClock};
pub use database::sqlite_test_pool;
pub use fixtures::EnvelopeBuilder;
pub use handlers::{CountingHandler, FailingHandler};
