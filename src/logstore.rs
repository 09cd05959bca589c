//! C7: the centralized log and metric store — a single append-only SQLite
//! database shared by every managed service's structured logs plus the
//! orchestrator's own historical resource samples.
use crate::{constants::LOG_INGEST_MAX_BATCH, constants::LOG_QUERY_MAX_LIMIT, error::LogStoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Severity of a log entry, ordered so a `level >= threshold` query filter
/// can compare numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    fn parse_str(s: &str) -> Option<Self> {
        match s {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse_str(&s.to_uppercase()).ok_or(())
    }
}

/// One log line submitted by a managed service, before an `id` is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryInput {
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub process_id: Option<u32>,
}

/// A persisted log entry, as returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub hostname: String,
    pub process_id: Option<u32>,
}

/// A single named metric reading, persisted for historical charting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub service_name: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub tags: serde_json::Value,
}

/// Filters accepted by a log query. Every field is optional; an absent field
/// is not applied as a constraint.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub service_name: Option<String>,
    pub min_level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl LogQuery {
    pub fn new() -> Self {
        LogQuery {
            limit: LOG_QUERY_MAX_LIMIT,
            offset: 0,
            ..Default::default()
        }
    }
}

/// Owns the single SQLite connection backing the log and metric tables.
/// Writes are serialized through an internal mutex; reads take the same lock
/// since `rusqlite::Connection` is not `Sync`.
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    /// Opens (creating if absent) the database at `path` and ensures schema
    /// and indexes exist.
    pub fn open(path: &Path) -> Result<Self, LogStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = LogStore { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Opens an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, LogStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = LogStore { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), LogStoreError> {
        let conn = self.conn.lock().expect("log store mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                service_name TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                context TEXT NOT NULL,
                trace_id TEXT,
                user_id TEXT,
                hostname TEXT NOT NULL,
                process_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp ON log_entries (timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_log_entries_service_timestamp ON log_entries (service_name, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_log_entries_level_timestamp ON log_entries (level, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_log_entries_trace_id ON log_entries (trace_id);
            CREATE INDEX IF NOT EXISTS idx_log_entries_user_id ON log_entries (user_id);

            CREATE TABLE IF NOT EXISTS metric_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                tags TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metric_samples_service_timestamp ON metric_samples (service_name, timestamp DESC);",
        )?;
        Ok(())
    }

    /// Inserts a batch of log entries in a single transaction. The entire
    /// batch is rejected (no partial insert) if any entry fails validation
    /// or the batch exceeds the configured maximum size.
    pub fn ingest(&self, entries: &[LogEntryInput]) -> Result<usize, LogStoreError> {
        if entries.len() > LOG_INGEST_MAX_BATCH {
            return Err(LogStoreError::MalformedEntry {
                index: LOG_INGEST_MAX_BATCH,
                reason: format!("batch of {} exceeds the maximum of {LOG_INGEST_MAX_BATCH}", entries.len()),
            });
        }
        for (index, entry) in entries.iter().enumerate() {
            if entry.service_name.trim().is_empty() {
                return Err(LogStoreError::MalformedEntry {
                    index,
                    reason: "service_name must not be empty".to_string(),
                });
            }
            if entry.message.trim().is_empty() {
                return Err(LogStoreError::MalformedEntry {
                    index,
                    reason: "message must not be empty".to_string(),
                });
            }
        }

        let mut conn = self.conn.lock().expect("log store mutex poisoned");
        let tx = conn.transaction()?;
        for entry in entries {
            tx.execute(
                "INSERT INTO log_entries
                 (timestamp, service_name, level, message, context, trace_id, user_id, hostname, process_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.timestamp.to_rfc3339(),
                    entry.service_name,
                    entry.level.as_str(),
                    entry.message,
                    entry.context.to_string(),
                    entry.trace_id,
                    entry.user_id,
                    entry.hostname,
                    entry.process_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Persists a batch of metric samples, e.g. one resource-sampler tick's
    /// cpu/rss readings for every managed service.
    pub fn record_metrics(&self, samples: &[MetricPoint]) -> Result<(), LogStoreError> {
        let mut conn = self.conn.lock().expect("log store mutex poisoned");
        let tx = conn.transaction()?;
        for sample in samples {
            tx.execute(
                "INSERT INTO metric_samples (service_name, timestamp, metric_name, value, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sample.service_name,
                    sample.timestamp.to_rfc3339(),
                    sample.metric_name,
                    sample.value,
                    sample.tags.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns every metric sample recorded for a service, optionally
    /// bounded by a time range, newest first.
    pub fn query_metrics(
        &self,
        service_name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricPoint>, LogStoreError> {
        let mut sql = String::from(
            "SELECT service_name, timestamp, metric_name, value, tags FROM metric_samples WHERE service_name = ?1",
        );
        let mut binds: Vec<rusqlite::types::Value> = vec![service_name.to_string().into()];
        if let Some(since) = since {
            sql.push_str(&format!(" AND timestamp >= ?{}", binds.len() + 1));
            binds.push(since.to_rfc3339().into());
        }
        if let Some(until) = until {
            sql.push_str(&format!(" AND timestamp <= ?{}", binds.len() + 1));
            binds.push(until.to_rfc3339().into());
        }
        sql.push_str(" ORDER BY timestamp DESC");

        let conn = self.conn.lock().expect("log store mutex poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), |row| {
            let timestamp: String = row.get(1)?;
            let tags: String = row.get(4)?;
            Ok(MetricPoint {
                service_name: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                metric_name: row.get(2)?,
                value: row.get(3)?,
                tags: serde_json::from_str(&tags).unwrap_or(serde_json::Value::Null),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LogStoreError::from)
    }

    /// Runs a filtered, paginated query over the log table, newest first.
    pub fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>, LogStoreError> {
        if query.limit > LOG_QUERY_MAX_LIMIT {
            return Err(LogStoreError::LimitTooLarge(query.limit));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, service_name, level, message, context, trace_id, user_id, hostname, process_id
             FROM log_entries WHERE 1 = 1",
        );
        let mut binds: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(service_name) = &query.service_name {
            sql.push_str(" AND service_name = ?");
            binds.push(service_name.clone().into());
        }
        if let Some(min_level) = query.min_level {
            sql.push_str(" AND level IN (");
            let levels: Vec<&str> = [LogLevel::Debug, LogLevel::Info, LogLevel::Warning, LogLevel::Error, LogLevel::Critical]
                .into_iter()
                .filter(|l| *l >= min_level)
                .map(LogLevel::as_str)
                .collect();
            let placeholders: Vec<String> = levels.iter().map(|_| "?".to_string()).collect();
            sql.push_str(&placeholders.join(", "));
            sql.push(')');
            for level in levels {
                binds.push(level.to_string().into());
            }
        }
        if let Some(since) = query.since {
            sql.push_str(" AND timestamp >= ?");
            binds.push(since.to_rfc3339().into());
        }
        if let Some(until) = query.until {
            sql.push_str(" AND timestamp <= ?");
            binds.push(until.to_rfc3339().into());
        }
        if let Some(trace_id) = &query.trace_id {
            sql.push_str(" AND trace_id = ?");
            binds.push(trace_id.clone().into());
        }
        if let Some(user_id) = &query.user_id {
            sql.push_str(" AND user_id = ?");
            binds.push(user_id.clone().into());
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
        binds.push(query.limit.into());
        binds.push(query.offset.into());

        let conn = self.conn.lock().expect("log store mutex poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LogStoreError::from)
    }

    /// Deletes every log entry older than `horizon_days`. Returns the number
    /// of rows removed. This is the only mutation permitted on the log table
    /// besides insertion.
    pub fn enforce_retention(&self, horizon_days: i64) -> Result<usize, LogStoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(horizon_days);
        let conn = self.conn.lock().expect("log store mutex poisoned");
        let removed = conn.execute("DELETE FROM log_entries WHERE timestamp < ?1", params![cutoff.to_rfc3339()])?;
        Ok(removed)
    }

    /// Fetches a single entry by id, used by tests and targeted lookups.
    pub fn get(&self, id: i64) -> Result<Option<LogEntry>, LogStoreError> {
        let conn = self.conn.lock().expect("log store mutex poisoned");
        conn.query_row(
            "SELECT id, timestamp, service_name, level, message, context, trace_id, user_id, hostname, process_id
             FROM log_entries WHERE id = ?1",
            params![id],
            row_to_entry,
        )
        .optional()
        .map_err(LogStoreError::from)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
    let timestamp: String = row.get(1)?;
    let level: String = row.get(3)?;
    let context: String = row.get(5)?;
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        service_name: row.get(2)?,
        level: level.parse().unwrap_or(LogLevel::Info),
        message: row.get(4)?,
        context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
        trace_id: row.get(6)?,
        user_id: row.get(7)?,
        hostname: row.get(8)?,
        process_id: row.get(9)?,
    })
}
