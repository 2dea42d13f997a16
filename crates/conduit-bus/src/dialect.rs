//! Per-backend SQL statement building.
//!
//! The two relational backends disagree on placeholder markers and on
//! the insert-if-absent idiom. Those differences live here so adapter
//! and ledger logic never branches on backend identity mid-query.

use std::fmt::Write as _;

/// SQL dialect of a relational backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Embedded SQLite. Positional `?N` markers, `INSERT OR IGNORE`.
    Sqlite,
    /// PostgreSQL. Positional `$N` markers, `ON CONFLICT DO NOTHING`.
    Postgres,
}

impl SqlDialect {
    /// The marker for the `n`-th bind parameter (1-based).
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => format!("?{n}"),
            Self::Postgres => format!("${n}"),
        }
    }

    /// A comma-separated placeholder list for parameters `1..=count`.
    pub fn placeholders(self, count: usize) -> String {
        let mut out = String::new();
        for n in 1..=count {
            if n > 1 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}", self.placeholder(n));
        }
        out
    }

    /// An insert that silently does nothing when the conflict target
    /// already exists.
    pub fn insert_if_absent(
        self,
        table: &str,
        columns: &[&str],
        conflict_target: &[&str],
    ) -> String {
        let column_list = columns.join(", ");
        let values = self.placeholders(columns.len());
        match self {
            Self::Sqlite => {
                format!("INSERT OR IGNORE INTO {table} ({column_list}) VALUES ({values})")
            },
            Self::Postgres => format!(
                "INSERT INTO {table} ({column_list}) VALUES ({values}) \
                 ON CONFLICT ({}) DO NOTHING",
                conflict_target.join(", ")
            ),
        }
    }

    /// The auto-incrementing 64-bit primary key column definition.
    pub fn bigserial_pk(self, column: &str) -> String {
        match self {
            Self::Sqlite => format!("{column} INTEGER PRIMARY KEY AUTOINCREMENT"),
            Self::Postgres => format!("{column} BIGSERIAL PRIMARY KEY"),
        }
    }

    /// The timestamp column type.
    pub fn timestamp_type(self) -> &'static str {
        match self {
            Self::Sqlite => "TEXT",
            Self::Postgres => "TIMESTAMPTZ",
        }
    }
}

/// Prebuilt statements for the broker tables shared by the relational
/// adapters.
#[derive(Debug, Clone)]
pub struct BrokerStatements {
    /// Schema bootstrap, one statement per entry.
    pub create_tables: Vec<String>,
    /// Registers a topic if absent.
    pub insert_topic: String,
    /// Registers a consumer group row if absent.
    pub insert_group: String,
    /// Appends an event row.
    pub insert_event: String,
    /// Fetches undelivered events past the group cursor.
    pub poll_batch: String,
    /// Advances the group cursor, monotonically.
    pub advance_cursor: String,
    /// Parks an event in the DLQ.
    pub insert_dlq: String,
    /// Topic existence probe.
    pub topic_exists: String,
    /// All topics, sorted.
    pub list_topics: String,
    /// Events held by a topic.
    pub count_events: String,
    /// Dead letters held for a topic.
    pub count_dlq_for_topic: String,
    /// Consumer groups attached to a topic.
    pub groups_for_topic: String,
    /// Full scan of a topic in offset order, for replay.
    pub replay_scan: String,
    /// Lookup of one event by its event ID.
    pub select_event: String,
    /// One DLQ entry keyed by (event ID, group).
    pub select_dlq_entry: String,
    /// Deletes one DLQ entry keyed by (event ID, group).
    pub delete_dlq_entry: String,
    /// Cursor for one consumer group.
    pub select_cursor: String,
    /// Events past a cursor, for lag computation.
    pub count_events_after: String,
}

impl BrokerStatements {
    /// Builds the broker statement set for a dialect.
    pub fn new(dialect: SqlDialect) -> Self {
        let d = dialect;
        let ts = d.timestamp_type();
        Self {
            create_tables: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS bus_topics (\
                     topic TEXT PRIMARY KEY, created_at {ts} NOT NULL)"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS bus_events (\
                     {}, event_id TEXT NOT NULL, topic TEXT NOT NULL, \
                     event_type TEXT NOT NULL, key TEXT NOT NULL, \
                     payload TEXT NOT NULL, headers TEXT NOT NULL, \
                     created_at {ts} NOT NULL)",
                    d.bigserial_pk("id")
                ),
                "CREATE INDEX IF NOT EXISTS idx_bus_events_topic_id \
                 ON bus_events (topic, id)"
                    .to_string(),
                "CREATE INDEX IF NOT EXISTS idx_bus_events_event_id \
                 ON bus_events (event_id)"
                    .to_string(),
                format!(
                    "CREATE TABLE IF NOT EXISTS bus_groups (\
                     topic TEXT NOT NULL, group_id TEXT NOT NULL, \
                     cursor BIGINT NOT NULL DEFAULT 0, created_at {ts} NOT NULL, \
                     PRIMARY KEY (topic, group_id))"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS bus_dlq (\
                     event_id TEXT NOT NULL, topic TEXT NOT NULL, \
                     group_id TEXT NOT NULL, reason TEXT NOT NULL, \
                     envelope TEXT NOT NULL, failed_at {ts} NOT NULL, \
                     PRIMARY KEY (event_id, group_id))"
                ),
            ],
            insert_topic: d.insert_if_absent(
                "bus_topics",
                &["topic", "created_at"],
                &["topic"],
            ),
            insert_group: d.insert_if_absent(
                "bus_groups",
                &["topic", "group_id", "cursor", "created_at"],
                &["topic", "group_id"],
            ),
            insert_event: format!(
                "INSERT INTO bus_events \
                 (event_id, topic, event_type, key, payload, headers, created_at) \
                 VALUES ({})",
                d.placeholders(7)
            ),
            poll_batch: format!(
                "SELECT e.id, e.event_id, e.event_type, e.key, e.payload, e.headers, \
                 e.created_at \
                 FROM bus_events e \
                 WHERE e.topic = {p1} AND e.id > \
                 (SELECT g.cursor FROM bus_groups g \
                  WHERE g.topic = {p1} AND g.group_id = {p2}) \
                 ORDER BY e.id ASC LIMIT {p3}",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
            ),
            advance_cursor: format!(
                "UPDATE bus_groups SET cursor = {p3} \
                 WHERE topic = {p1} AND group_id = {p2} AND cursor < {p3}",
                p1 = d.placeholder(1),
                p2 = d.placeholder(2),
                p3 = d.placeholder(3),
            ),
            // Insert-if-absent so a redelivered permanent nack for the
            // same (event, group) settles instead of erroring.
            insert_dlq: d.insert_if_absent(
                "bus_dlq",
                &["event_id", "topic", "group_id", "reason", "envelope", "failed_at"],
                &["event_id", "group_id"],
            ),
            topic_exists: format!(
                "SELECT COUNT(*) FROM bus_topics WHERE topic = {}",
                d.placeholder(1)
            ),
            list_topics: "SELECT topic FROM bus_topics ORDER BY topic".to_string(),
            count_events: format!(
                "SELECT COUNT(*) FROM bus_events WHERE topic = {}",
                d.placeholder(1)
            ),
            count_dlq_for_topic: format!(
                "SELECT COUNT(*) FROM bus_dlq WHERE topic = {}",
                d.placeholder(1)
            ),
            groups_for_topic: format!(
                "SELECT group_id FROM bus_groups WHERE topic = {} ORDER BY group_id",
                d.placeholder(1)
            ),
            replay_scan: format!(
                "SELECT id, event_id, event_type, key, payload, headers, created_at \
                 FROM bus_events WHERE topic = {} ORDER BY id ASC",
                d.placeholder(1)
            ),
            select_event: format!(
                "SELECT id, event_id, topic, event_type, key, payload, headers, created_at \
                 FROM bus_events WHERE event_id = {} ORDER BY id ASC LIMIT 1",
                d.placeholder(1)
            ),
            select_dlq_entry: format!(
                "SELECT envelope, topic, reason, failed_at FROM bus_dlq \
                 WHERE event_id = {} AND group_id = {}",
                d.placeholder(1),
                d.placeholder(2),
            ),
            delete_dlq_entry: format!(
                "DELETE FROM bus_dlq WHERE event_id = {} AND group_id = {}",
                d.placeholder(1),
                d.placeholder(2),
            ),
            select_cursor: format!(
                "SELECT cursor FROM bus_groups WHERE topic = {} AND group_id = {}",
                d.placeholder(1),
                d.placeholder(2),
            ),
            count_events_after: format!(
                "SELECT COUNT(*) FROM bus_events WHERE topic = {} AND id > {}",
                d.placeholder(1),
                d.placeholder(2),
            ),
        }
    }

    /// DLQ listing with optional topic/group filters, newest first.
    ///
    /// Bind order follows the filters that are present: topic first,
    /// then group, then the limit.
    pub fn select_dlq(dialect: SqlDialect, topic: bool, group: bool) -> String {
        let mut sql = String::from(
            "SELECT event_id, topic, group_id, reason, envelope, failed_at FROM bus_dlq",
        );
        let mut n = 0;
        if topic {
            n += 1;
            let _ = write!(sql, " WHERE topic = {}", dialect.placeholder(n));
        }
        if group {
            n += 1;
            let clause = if topic { "AND" } else { "WHERE" };
            let _ = write!(sql, " {clause} group_id = {}", dialect.placeholder(n));
        }
        let _ = write!(sql, " ORDER BY failed_at DESC LIMIT {}", dialect.placeholder(n + 1));
        sql
    }

    /// DLQ deletion with an optional topic scope.
    pub fn delete_dlq(dialect: SqlDialect, topic: bool) -> String {
        if topic {
            format!("DELETE FROM bus_dlq WHERE topic = {}", dialect.placeholder(1))
        } else {
            "DELETE FROM bus_dlq".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_markers_differ_by_dialect() {
        assert_eq!(SqlDialect::Sqlite.placeholder(3), "?3");
        assert_eq!(SqlDialect::Postgres.placeholder(3), "$3");
        assert_eq!(SqlDialect::Postgres.placeholders(3), "$1, $2, $3");
    }

    #[test]
    fn insert_if_absent_uses_native_idiom() {
        let sqlite = SqlDialect::Sqlite.insert_if_absent("t", &["a", "b"], &["a"]);
        assert!(sqlite.starts_with("INSERT OR IGNORE INTO t"));

        let postgres = SqlDialect::Postgres.insert_if_absent("t", &["a", "b"], &["a"]);
        assert!(postgres.contains("ON CONFLICT (a) DO NOTHING"));
        assert!(postgres.contains("$1, $2"));
    }

    #[test]
    fn dlq_insert_tolerates_duplicate_parkings() {
        let sqlite = BrokerStatements::new(SqlDialect::Sqlite);
        assert!(sqlite.insert_dlq.starts_with("INSERT OR IGNORE INTO bus_dlq"));

        let postgres = BrokerStatements::new(SqlDialect::Postgres);
        assert!(postgres.insert_dlq.contains("ON CONFLICT (event_id, group_id) DO NOTHING"));
    }

    #[test]
    fn dlq_listing_composes_filters_in_bind_order() {
        let both = BrokerStatements::select_dlq(SqlDialect::Postgres, true, true);
        assert!(both.contains("WHERE topic = $1 AND group_id = $2"));
        assert!(both.contains("LIMIT $3"));

        let group_only = BrokerStatements::select_dlq(SqlDialect::Sqlite, false, true);
        assert!(group_only.contains("WHERE group_id = ?1"));
        assert!(group_only.contains("LIMIT ?2"));
    }
}
