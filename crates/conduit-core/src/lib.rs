//! Core types for the conduit event-delivery substrate.
//!
//! Provides the canonical event envelope, strongly-typed identifiers,
//! the shared error taxonomy, tenancy strategies, and topology value
//! types. Every other crate depends on these foundational types; this
//! crate itself performs no I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod tenancy;
pub mod time;
pub mod topology;

pub use envelope::{Envelope, EventId};
pub use error::{BusError, Result};
pub use tenancy::{
    HybridStrategy, NamespacedStrategy, PhysicalAddress, SharedTopicStrategy, TenancyStrategy,
    TenantContext, TenantTier,
};
pub use time::{Clock, SystemClock, TestClock};
pub use topology::{
    DriftIssue, DriftReport, DriftSeverity, DriftType, ExpectedTopic, ExpectedTopology,
    GroupFingerprint, TopicFingerprint, TopologyFingerprint,
};
