//! Backend adapters implementing the [`crate::EventBus`] contract.

pub mod memory;
pub mod postgres;
pub mod redis;
pub mod sqlite;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::{MemoryBus, MemoryBusConfig};
pub use postgres::PostgresBus;
pub use redis::{RedisBus, RedisBusConfig};
pub use sqlite::SqliteBus;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaBusConfig};
