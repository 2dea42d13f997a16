//! Transactional outbox, inbox ledger, and idempotent consumption.
//!
//! The producer side writes publish intent in the caller's own
//! transaction ([`outbox`]) and a background [`drainer`] forwards it to
//! the bus with bounded retries. The consumer side records completion
//! per (event, group) in the [`inbox`] ledger, which the
//! [`consumer::IdempotentConsumer`] wrapper uses to collapse
//! redeliveries into no-ops. Together they make at-least-once delivery
//! exactly-once-effective.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod drainer;
pub mod error;
pub mod inbox;
pub mod outbox;

pub use consumer::IdempotentConsumer;
pub use drainer::{DrainerConfig, OutboxDrainer};
pub use error::{RelayError, Result};
pub use inbox::{InboxStore, PostgresInboxStore, SqliteInboxStore};
pub use outbox::{
    OutboxEntry, OutboxReport, OutboxStatus, OutboxStore, PostgresOutboxStore, SqliteOutboxStore,
};
