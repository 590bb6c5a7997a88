//! `aq_store` - `DuckDB` row store access for the anomaly query service
//!
//! This crate provides:
//! - A single long-lived `DuckDB` connection with serialized access
//! - Reconnect with one backoff retry
//! - Typed parameter binding for every query value
//! - Schema migrations and row ingestion helpers

use aq_config::StoreConfig;
use chrono::NaiveDateTime;
use duckdb::types::{ToSql, ToSqlOutput};
use duckdb::{AccessMode, Config, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub mod migrations;
pub mod schema;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Row store unreachable after {attempts} attempts: {reason}")]
    ConnectionError { attempts: u32, reason: String },

    #[error("Query rejected by row store: {0}")]
    QueryError(#[from] duckdb::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Row store connection is not open")]
    NotConnected,
}

impl StoreError {
    /// Whether the failure means the store could not be reached at all
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionError { .. } | StoreError::NotConnected
        )
    }
}

/// One observation of the anomaly detector output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: NaiveDateTime,
    pub variable: String,
    pub actual: f64,
    pub predicted: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub residual: f64,
    pub outside_interval: bool,
    pub high_residual: bool,
    pub is_anomaly: bool,
    pub anomaly_score: Option<f64>,
    pub prediction_error_pct: f64,
}

impl Row {
    /// Build an observation from a prediction and its confidence interval.
    ///
    /// `is_anomaly` starts as `outside_interval`; no score is attached.
    pub fn new(
        timestamp: NaiveDateTime,
        variable: impl Into<String>,
        actual: f64,
        predicted: f64,
        lower_bound: f64,
        upper_bound: f64,
    ) -> Self {
        let residual = actual - predicted;
        let outside_interval = actual < lower_bound || actual > upper_bound;
        let prediction_error_pct = if predicted.abs() > f64::EPSILON {
            (residual / predicted * 100.0).abs()
        } else {
            0.0
        };
        Self {
            timestamp,
            variable: variable.into(),
            actual,
            predicted,
            lower_bound,
            upper_bound,
            residual,
            outside_interval,
            high_residual: false,
            is_anomaly: outside_interval,
            anomaly_score: None,
            prediction_error_pct,
        }
    }

    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.anomaly_score = Some(score);
        self
    }

    /// Mark the residual trigger; the anomaly flag follows both triggers.
    #[must_use]
    pub fn with_high_residual(mut self, high_residual: bool) -> Self {
        self.high_residual = high_residual;
        self.is_anomaly = self.outside_interval || high_residual;
        self
    }

    fn from_duckdb(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            timestamp: row.get(0)?,
            variable: row.get(1)?,
            actual: row.get(2)?,
            predicted: row.get(3)?,
            lower_bound: row.get(4)?,
            upper_bound: row.get(5)?,
            residual: row.get(6)?,
            outside_interval: row.get(7)?,
            high_residual: row.get(8)?,
            is_anomaly: row.get(9)?,
            anomaly_score: row.get(10)?,
            prediction_error_pct: row.get(11)?,
        })
    }
}

/// A typed query parameter; values never become part of the SQL text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlParam {
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(v) => v.to_sql(),
            SqlParam::Float(v) => v.to_sql(),
            SqlParam::Int(v) => v.to_sql(),
            SqlParam::Bool(v) => v.to_sql(),
            SqlParam::Timestamp(v) => v.to_sql(),
        }
    }
}

/// A parameterized query: SQL with `?` placeholders plus bound values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// The only seam through which the service reaches the row store.
///
/// Implementations block on I/O; callers run them off the async runtime.
pub trait RowStore: Send + Sync {
    /// Run a parameterized row query
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionError`] when the store cannot be reached
    /// and [`StoreError::QueryError`] when it rejects the query.
    fn execute(&self, request: &QueryRequest) -> Result<Vec<Row>, StoreError>;

    /// Release the underlying connection
    fn close(&self) {}
}

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Memory,
    File(PathBuf),
}

/// Connection tuning
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub read_only: bool,
    pub threads: u32,
    pub memory_limit: String,
    pub retry_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for StoreOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            read_only: config.read_only,
            threads: config.threads,
            memory_limit: config.memory_limit.clone(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Connection manager for the anomaly table.
///
/// Holds at most one open connection. Every `execute` and every reconnect
/// happens under the same mutex, so the connection is never used by two
/// operations at once.
pub struct AnomalyStore {
    conn: Mutex<Option<Connection>>,
    target: StoreTarget,
    options: StoreOptions,
    connects: AtomicU64,
}

impl AnomalyStore {
    /// Open or create the database at `path`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionError`] if the database cannot be opened
    /// after one retry.
    #[instrument(skip(options))]
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        info!(path = %path.display(), "Opening DuckDB database");
        Self::connect_target(StoreTarget::File(path.to_path_buf()), options)
    }

    /// Open the database described by the store configuration
    ///
    /// # Errors
    ///
    /// See [`AnomalyStore::open`].
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open(&config.db_path, StoreOptions::from(config))
    }

    /// Open in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if in-memory database setup or migrations fail.
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::connect_target(StoreTarget::Memory, StoreOptions::default())
    }

    fn connect_target(target: StoreTarget, options: StoreOptions) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(None),
            target,
            options,
            connects: AtomicU64::new(0),
        };
        {
            let mut slot = store.conn.lock().unwrap_or_else(PoisonError::into_inner);
            store.ensure_connected(&mut slot)?;
        }
        Ok(store)
    }

    /// Number of connections opened over the lifetime of this store
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Whether a connection is currently held
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[must_use]
    pub fn target(&self) -> &StoreTarget {
        &self.target
    }

    /// Insert observations into the anomaly table
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or an insert fails.
    pub fn insert_rows(&self, rows: &[Row]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = self.ensure_connected(&mut slot)?;
        let mut stmt = conn.prepare(schema::INSERT_ROW)?;

        for row in rows {
            stmt.execute(duckdb::params![
                row.timestamp,
                row.variable,
                row.actual,
                row.predicted,
                row.lower_bound,
                row.upper_bound,
                row.residual,
                row.outside_interval,
                row.high_residual,
                row.is_anomaly,
                row.anomaly_score,
                row.prediction_error_pct,
            ])?;
        }

        debug!(rows = rows.len(), "Inserted anomaly rows");
        Ok(rows.len())
    }

    fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> Result<&'a Connection, StoreError> {
        if slot.is_none() {
            *slot = Some(self.connect_with_retry()?);
        }
        slot.as_ref().ok_or(StoreError::NotConnected)
    }

    fn connect_with_retry(&self) -> Result<Connection, StoreError> {
        match self.connect_once() {
            Ok(conn) => Ok(conn),
            Err(first) => {
                warn!(
                    error = %first,
                    backoff_ms = self.options.retry_backoff.as_millis() as u64,
                    "Row store connection failed, retrying once"
                );
                std::thread::sleep(self.options.retry_backoff);
                self.connect_once()
                    .map_err(|err| StoreError::ConnectionError {
                        attempts: 2,
                        reason: err.to_string(),
                    })
            }
        }
    }

    fn connect_once(&self) -> Result<Connection, StoreError> {
        let conn = match &self.target {
            StoreTarget::Memory => Connection::open_in_memory()?,
            StoreTarget::File(path) => {
                if self.options.read_only {
                    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
                    Connection::open_with_flags(path, config)?
                } else {
                    if let Some(parent) = path.parent()
                        && !parent.as_os_str().is_empty()
                    {
                        std::fs::create_dir_all(parent)?;
                    }
                    Connection::open(path)?
                }
            }
        };

        conn.execute_batch(&format!(
            "PRAGMA threads={}; PRAGMA memory_limit='{}';",
            self.options.threads,
            escape_sql_literal(&self.options.memory_limit)
        ))?;

        if !self.options.read_only {
            migrations::run_all(&conn)?;
        }

        let n = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connects = n, "Row store connection established");
        Ok(conn)
    }
}

impl RowStore for AnomalyStore {
    #[instrument(skip(self, request), fields(params = request.params.len()))]
    fn execute(&self, request: &QueryRequest) -> Result<Vec<Row>, StoreError> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let conn = self.ensure_connected(&mut slot)?;
        match run_query(conn, request).map_err(|err| classify(err, 1)) {
            Ok(results) => {
                debug!(rows = results.len(), "Row query executed");
                return Ok(results);
            }
            Err(err) if !err.is_connection() => return Err(err),
            Err(err) => {
                warn!(error = %err, "Row store connection failed mid-query, reconnecting");
                slot.take();
            }
        }

        let conn = self.ensure_connected(&mut slot)?;
        match run_query(conn, request).map_err(|err| classify(err, 2)) {
            Ok(results) => {
                info!(rows = results.len(), "Row query succeeded after reconnect");
                Ok(results)
            }
            Err(err) => {
                if err.is_connection() {
                    slot.take();
                }
                Err(err)
            }
        }
    }

    fn close(&self) {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            info!("Row store connection closed");
        }
    }
}

fn run_query(conn: &Connection, request: &QueryRequest) -> duckdb::Result<Vec<Row>> {
    let mut stmt = conn.prepare(&request.sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(request.params.iter()))?;

    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(Row::from_duckdb(row)?);
    }
    Ok(results)
}

/// Message fragments `DuckDB` uses when the database itself has failed rather
/// than the statement. The catalog only reads the anomaly table, so an I/O
/// error always concerns the database file.
const CONNECTION_FAILURE_MARKERS: &[&str] = &[
    "IO Error",
    "FATAL Error",
    "Connection Error",
    "database has been invalidated",
];

fn is_connection_failure(message: &str) -> bool {
    CONNECTION_FAILURE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Split `DuckDB` errors into dead-connection failures and query rejections
fn classify(err: duckdb::Error, attempts: u32) -> StoreError {
    let reason = err.to_string();
    if is_connection_failure(&reason) {
        StoreError::ConnectionError { attempts, reason }
    } else {
        StoreError::QueryError(err)
    }
}

/// Escape a trusted configuration value for a SQL string literal.
///
/// Only used for pragmas, which cannot take bound parameters.
#[must_use]
pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}
