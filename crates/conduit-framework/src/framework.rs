//! Process-wide facade over the event substrate.
//!
//! [`EventFramework::init`] resolves a backend tier, builds the
//! matching bus adapter, wires the outbox and inbox ledgers against
//! the tier's relational storage, and starts the background outbox
//! drainer. [`EventFramework::shutdown`] unwinds all of it: the
//! drainer is cancelled and awaited, every consumer loop is stopped,
//! then every pool is closed, before the call returns.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use conduit_bus::{
    adapters::{MemoryBus, MemoryBusConfig, PostgresBus, RedisBus, RedisBusConfig, SqliteBus},
    EventBus, EventHandler, TopologyDriftDetector, TopologyExtractor,
};
use conduit_core::topology::{DriftReport, ExpectedTopology};
use conduit_relay::{
    IdempotentConsumer, InboxStore, OutboxDrainer, OutboxEntry, OutboxReport, OutboxStore,
    PostgresInboxStore, PostgresOutboxStore, SqliteInboxStore, SqliteOutboxStore,
};
use sqlx::{
    postgres::PgPoolOptions,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    PgPool, SqlitePool,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

/// The physical backend a framework instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTier {
    /// In-process, non-durable.
    InMemory,
    /// Embedded SQLite file, single node.
    Embedded,
    /// PostgreSQL as the broker.
    Postgres,
    /// Redis Streams.
    Redis,
    /// Kafka partitioned topics.
    Kafka,
}

impl std::fmt::Display for BackendTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InMemory => "memory",
            Self::Embedded => "sqlite",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::Kafka => "kafka",
        };
        f.write_str(name)
    }
}

/// Where the outbox and inbox ledgers live.
///
/// Relational tiers host them next to the broker tables; every other
/// tier carries an embedded SQLite file for them.
enum RelayStorage {
    Sqlite {
        pool: SqlitePool,
        outbox: Arc<SqliteOutboxStore>,
        inbox: Arc<SqliteInboxStore>,
    },
    Postgres {
        pool: PgPool,
        outbox: Arc<PostgresOutboxStore>,
        inbox: Arc<PostgresInboxStore>,
    },
}

impl RelayStorage {
    async fn sqlite(pool: SqlitePool) -> Result<Self> {
        let outbox = Arc::new(SqliteOutboxStore::new(pool.clone()).await?);
        let inbox = Arc::new(SqliteInboxStore::new(pool.clone()).await?);
        Ok(Self::Sqlite { pool, outbox, inbox })
    }

    async fn postgres(pool: PgPool) -> Result<Self> {
        let outbox = Arc::new(PostgresOutboxStore::new(pool.clone()).await?);
        let inbox = Arc::new(PostgresInboxStore::new(pool.clone()).await?);
        Ok(Self::Postgres { pool, outbox, inbox })
    }

    fn outbox_store(&self) -> Arc<dyn OutboxStore> {
        match self {
            Self::Sqlite { outbox, .. } => outbox.clone(),
            Self::Postgres { outbox, .. } => outbox.clone(),
        }
    }

    fn inbox_store(&self) -> Arc<dyn InboxStore> {
        match self {
            Self::Sqlite { inbox, .. } => inbox.clone(),
            Self::Postgres { inbox, .. } => inbox.clone(),
        }
    }

    async fn close(&self) {
        match self {
            Self::Sqlite { pool, .. } => pool.close().await,
            Self::Postgres { pool, .. } => pool.close().await,
        }
    }
}

/// The assembled substrate: one bus, its relay stores, and the
/// background drainer.
///
/// Built once per process via [`EventFramework::init`] and torn down
/// via [`EventFramework::shutdown`], which consumes the instance.
pub struct EventFramework {
    tier: BackendTier,
    bus: Arc<dyn EventBus>,
    storage: RelayStorage,
    drainer: Arc<OutboxDrainer>,
    drainer_task: JoinHandle<()>,
    shutdown_token: CancellationToken,
    drift: TopologyDriftDetector,
    consumer_max_attempts: u32,
}

impl EventFramework {
    /// Builds the substrate for the configured backend tier.
    ///
    /// With `backend = "auto"` the reachable tiers are probed in order
    /// (Postgres, then Redis) and the embedded tier is the fallback.
    /// The chosen backend is health-checked before anything else is
    /// wired, so a misconfigured broker fails fast here rather than in
    /// the first publish.
    ///
    /// # Errors
    ///
    /// Fails when the tier cannot be resolved, the backend is
    /// unreachable, or the relay schema cannot be bootstrapped.
    pub async fn init(config: Config) -> Result<Self> {
        let tier = match config.backend_tier()? {
            Some(tier) => tier,
            None => Self::probe(&config).await,
        };
        info!(tier = %tier, "initializing event framework");

        let runtime = config.to_runtime_config();
        let (bus, storage): (Arc<dyn EventBus>, RelayStorage) = match tier {
            BackendTier::InMemory => {
                let bus = MemoryBus::with_config(MemoryBusConfig {
                    auto_create_topics: true,
                    runtime,
                });
                let pool = ephemeral_sqlite_pool().await?;
                (Arc::new(bus), RelayStorage::sqlite(pool).await?)
            },
            BackendTier::Embedded => {
                let pool = file_sqlite_pool(&config.sqlite_path).await?;
                let bus = SqliteBus::with_runtime(pool.clone(), runtime).await?;
                (Arc::new(bus), RelayStorage::sqlite(pool).await?)
            },
            BackendTier::Postgres => {
                let pool = postgres_pool(&config).await?;
                let bus = PostgresBus::with_runtime(pool.clone(), runtime).await?;
                (Arc::new(bus), RelayStorage::postgres(pool).await?)
            },
            BackendTier::Redis => {
                let bus = RedisBus::connect_with_config(
                    &config.redis_url,
                    RedisBusConfig { runtime, ..RedisBusConfig::default() },
                )
                .await
                .context("Failed to connect to Redis")?;
                let pool = file_sqlite_pool(&config.sqlite_path).await?;
                (Arc::new(bus), RelayStorage::sqlite(pool).await?)
            },
            #[cfg(feature = "kafka")]
            BackendTier::Kafka => {
                let bus = conduit_bus::adapters::KafkaBus::new(
                    conduit_bus::adapters::KafkaBusConfig {
                        brokers: config.kafka_brokers.clone(),
                        client_id: config.kafka_client_id.clone(),
                        runtime,
                        ..conduit_bus::adapters::KafkaBusConfig::default()
                    },
                )?;
                let pool = file_sqlite_pool(&config.sqlite_path).await?;
                (Arc::new(bus), RelayStorage::sqlite(pool).await?)
            },
            #[cfg(not(feature = "kafka"))]
            BackendTier::Kafka => {
                anyhow::bail!("backend 'kafka' requires building with the 'kafka' feature")
            },
        };

        bus.health_check().await.context("Backend health check failed")?;

        let drainer = Arc::new(OutboxDrainer::new(
            storage.outbox_store(),
            bus.clone(),
            config.to_drainer_config(),
        ));
        let shutdown_token = CancellationToken::new();
        let drainer_task = drainer.clone().spawn(shutdown_token.clone());

        info!(tier = %tier, "event framework ready");
        Ok(Self {
            tier,
            bus,
            storage,
            drainer,
            drainer_task,
            shutdown_token,
            drift: TopologyDriftDetector::new(config.to_drift_config()),
            consumer_max_attempts: config.consumer_max_attempts,
        })
    }

    /// Picks the richest reachable tier: Postgres, then Redis, then
    /// the embedded file.
    async fn probe(config: &Config) -> BackendTier {
        match postgres_pool(config).await {
            Ok(pool) => {
                pool.close().await;
                info!("probe: postgres reachable");
                return BackendTier::Postgres;
            },
            Err(e) => info!(error = %e, "probe: postgres unreachable"),
        }

        match RedisBus::connect(&config.redis_url).await {
            Ok(bus) => {
                if bus.health_check().await.is_ok() {
                    info!("probe: redis reachable");
                    return BackendTier::Redis;
                }
                info!("probe: redis connected but unhealthy");
            },
            Err(e) => info!(error = %e, "probe: redis unreachable"),
        }

        info!("probe: falling back to embedded tier");
        BackendTier::Embedded
    }

    /// The resolved backend tier.
    pub fn tier(&self) -> BackendTier {
        self.tier
    }

    /// The underlying bus, for direct publish/subscribe/introspection.
    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    /// The inbox ledger backing idempotent consumption.
    pub fn inbox(&self) -> Arc<dyn InboxStore> {
        self.storage.inbox_store()
    }

    /// The sqlite outbox store, when relay storage is sqlite-backed.
    ///
    /// Callers append publish intent through this store inside their
    /// own transaction.
    pub fn sqlite_outbox(&self) -> Option<Arc<SqliteOutboxStore>> {
        match &self.storage {
            RelayStorage::Sqlite { outbox, .. } => Some(outbox.clone()),
            RelayStorage::Postgres { .. } => None,
        }
    }

    /// The postgres outbox store, when relay storage is
    /// postgres-backed.
    pub fn postgres_outbox(&self) -> Option<Arc<PostgresOutboxStore>> {
        match &self.storage {
            RelayStorage::Sqlite { .. } => None,
            RelayStorage::Postgres { outbox, .. } => Some(outbox.clone()),
        }
    }

    /// Subscribes `handler` wrapped for exactly-once-effective
    /// processing: completed events are recorded in the inbox ledger,
    /// redeliveries of them become no-ops, and transient failures are
    /// retried up to the configured attempt budget before
    /// dead-lettering.
    ///
    /// # Errors
    ///
    /// Fails when the `(topic, group_id)` pair is already subscribed or
    /// the backend rejects the subscription.
    pub async fn subscribe_idempotent(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let wrapped = Arc::new(IdempotentConsumer::new(
            handler,
            self.storage.inbox_store(),
            group_id,
            self.consumer_max_attempts,
        ));
        self.bus.subscribe(topic, group_id, wrapped).await?;
        Ok(())
    }

    /// Runs one outbox sweep now, bounded by `timeout`, returning the
    /// number of rows published.
    ///
    /// The background drainer keeps sweeping regardless; this is for
    /// callers that want a synchronous flush.
    ///
    /// # Errors
    ///
    /// Propagates outbox storage failures.
    pub async fn drain_outbox(&self, timeout: Duration) -> Result<u64> {
        Ok(self.drainer.drain(timeout).await?)
    }

    /// Aggregate outbox counts and oldest pending age.
    ///
    /// # Errors
    ///
    /// Propagates outbox storage failures.
    pub async fn outbox_report(&self) -> Result<OutboxReport> {
        Ok(self.storage.outbox_store().report().await?)
    }

    /// Terminally failed outbox rows, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates outbox storage failures.
    pub async fn failed_outbox_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        Ok(self.storage.outbox_store().failed_entries(limit).await?)
    }

    /// Requeues one terminally failed outbox row for another round of
    /// publish attempts. Returns `false` when the row does not exist or
    /// is not failed.
    ///
    /// # Errors
    ///
    /// Propagates outbox storage failures.
    pub async fn requeue_failed_outbox(&self, id: i64) -> Result<bool> {
        Ok(self.storage.outbox_store().requeue_failed(id).await?)
    }

    /// Snapshots the live topology and diffs it against `expected`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors raised while introspecting topics.
    pub async fn drift_report(&self, expected: &ExpectedTopology) -> Result<DriftReport> {
        let actual = TopologyExtractor::extract(self.bus.as_ref()).await?;
        Ok(self.drift.compare(expected, &actual))
    }

    /// Verifies the backend is reachable.
    ///
    /// # Errors
    ///
    /// Propagates the backend's health failure.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.bus.health_check().await?)
    }

    /// Tears the substrate down: cancels the drainer, waits for its
    /// task, stops every consumer loop, then closes every pool. Returns
    /// only once all of that has completed.
    pub async fn shutdown(self) {
        info!(tier = %self.tier, "shutting down event framework");
        self.shutdown_token.cancel();
        if let Err(e) = self.drainer_task.await {
            warn!(error = %e, "drainer task did not shut down cleanly");
        }
        // Consumer loops must stop before their pools close underneath
        // them.
        if let Err(e) = self.bus.shutdown().await {
            warn!(error = %e, "bus did not shut down cleanly");
        }
        self.storage.close().await;
        info!("event framework shutdown complete");
    }
}

async fn postgres_pool(config: &Config) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!("Failed to connect to postgres at {}", config.database_url_masked())
        })
}

async fn file_sqlite_pool(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open sqlite database at {path}"))
}

async fn ephemeral_sqlite_pool() -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory sqlite database")
}

#[cfg(test)]
mod tests {
    use conduit_core::Envelope;
    use conduit_testing::CountingHandler;
    use serde_json::json;

    use super::*;

    fn memory_config() -> Config {
        Config { backend: "memory".to_string(), ..Config::default() }
    }

    #[tokio::test]
    async fn init_memory_tier_and_shutdown() {
        let framework = EventFramework::init(memory_config()).await.unwrap();
        assert_eq!(framework.tier(), BackendTier::InMemory);
        framework.health_check().await.unwrap();
        framework.shutdown().await;
    }

    #[tokio::test]
    async fn init_embedded_tier_with_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.db");
        let config = Config {
            backend: "sqlite".to_string(),
            sqlite_path: path.to_string_lossy().into_owned(),
            ..Config::default()
        };

        let framework = EventFramework::init(config).await.unwrap();
        assert_eq!(framework.tier(), BackendTier::Embedded);

        let published = framework
            .bus()
            .publish(Envelope::new("orders", "order.created", json!({"id": 1})))
            .await
            .unwrap();
        assert!(published.offset.is_some());

        framework.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_idempotent_delivers_once() {
        let framework = EventFramework::init(memory_config()).await.unwrap();
        let handler = Arc::new(CountingHandler::new());

        framework.subscribe_idempotent("orders", "billing", handler.clone()).await.unwrap();
        framework
            .bus()
            .publish(Envelope::new("orders", "order.created", json!({"id": 7})))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler never saw the event");
        assert_eq!(handler.count(), 1);

        framework.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let framework = EventFramework::init(memory_config()).await.unwrap();
        let handler = Arc::new(CountingHandler::new());

        framework.subscribe_idempotent("orders", "billing", handler.clone()).await.unwrap();
        let second = framework.subscribe_idempotent("orders", "billing", handler).await;
        assert!(second.is_err());

        framework.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_active_consumers() {
        let framework = EventFramework::init(memory_config()).await.unwrap();
        let handler = Arc::new(CountingHandler::new());
        framework.subscribe_idempotent("orders", "billing", handler.clone()).await.unwrap();

        let bus = framework.bus();
        framework.shutdown().await;

        // The consumer loop was stopped and deregistered, so the pair
        // is free again on the surviving bus handle.
        bus.subscribe("orders", "billing", handler).await.unwrap();
    }

    #[tokio::test]
    async fn outbox_report_starts_empty() {
        let framework = EventFramework::init(memory_config()).await.unwrap();
        let report = framework.outbox_report().await.unwrap();
        assert_eq!(report.pending, 0);
        assert_eq!(report.failed, 0);

        assert_eq!(framework.drain_outbox(Duration::from_secs(1)).await.unwrap(), 0);
        framework.shutdown().await;
    }
}
