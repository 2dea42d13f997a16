//! Bus contract, shared consumer runtime, and backend adapters.
//!
//! The [`EventBus`] trait is the single contract application code sees.
//! Five adapters implement it with different persistence and
//! replication characteristics:
//!
//! - [`adapters::MemoryBus`] — in-process, no persistence, for tests
//!   and throwaway local runs.
//! - [`adapters::SqliteBus`] — embedded durable queue, survives
//!   process restart, no external infrastructure.
//! - [`adapters::PostgresBus`] — relational-database-as-broker for
//!   minimal-infrastructure deployments.
//! - [`adapters::RedisBus`] — Redis Streams.
//! - [`adapters::KafkaBus`] — log-structured partitioned topics
//!   (`kafka` cargo feature, links librdkafka).
//!
//! Selection between them is a deployment-time decision; application
//! code depends only on the trait. The consumer-loop lifecycle is
//! shared across adapters by [`runtime::ConsumerRuntime`] — adapters
//! plug in only the wire-level batch fetch.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapters;
pub mod bus;
pub mod dialect;
pub mod drift;
pub mod runtime;

pub use bus::{
    ConsumerInfo, DlqEvent, EventBus, EventHandler, HandlerError, NackReason, ReplayFilter,
    ReplayStream, TopicInfo,
};
pub use drift::{DriftConfig, TopologyDriftDetector, TopologyExtractor};
pub use runtime::{ConsumerRuntime, ConsumerTransport, RuntimeConfig};
