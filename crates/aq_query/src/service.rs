//! `QueryService`: one async call per catalog entry.
//!
//! Each call validates its parameters, resolves rows through the result
//! cache (fetching from the row store off the async runtime when needed) and
//! runs the matching aggregation over the cached rows.

use aq_config::AqConfig;
use aq_store::{AnomalyStore, RowStore};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::QueryError;
use crate::aggregate::{
    self, Alert, DailyBucket, HeatmapMatrix, HourlyBucket, ScoreHistogram, VariableRanking,
    VariableSummary,
};
use crate::cache::{CacheStatsSnapshot, CachedRows, EntryState, ResultCache};
use crate::catalog;
use crate::query_spec::QuerySpec;
use crate::rowset::RowSet;
use crate::severity::SeverityThresholds;

/// Source of "now" for trailing windows; timezone-naive local time
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// A result plus how it was obtained
#[derive(Debug, Clone, Serialize)]
pub struct Served<T> {
    pub data: T,
    /// Served from an expired entry because the refresh failed
    pub degraded: bool,
    pub fetched_at: NaiveDateTime,
    /// Integrity problems found in the underlying rows
    pub warnings: Vec<String>,
}

impl<T> Served<T> {
    fn from_cached(cached: &CachedRows, data: T) -> Self {
        Self {
            data,
            degraded: cached.degraded,
            fetched_at: cached.rows.fetched_at,
            warnings: cached.rows.warnings(),
        }
    }
}

pub struct QueryService {
    store: Arc<dyn RowStore>,
    cache: ResultCache,
    thresholds: SeverityThresholds,
    clock: Clock,
}

impl QueryService {
    pub fn new(store: Arc<dyn RowStore>, config: &AqConfig) -> Self {
        Self {
            store,
            cache: ResultCache::new(config.cache.clone()),
            thresholds: SeverityThresholds::from(&config.severity),
            clock: Arc::new(|| Local::now().naive_local()),
        }
    }

    /// Connect to the configured `DuckDB` store
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Connection`] if the store cannot be opened.
    pub fn open(config: &AqConfig) -> Result<Self, QueryError> {
        let store = AnomalyStore::from_config(&config.store)?;
        info!(store = ?store.target(), "Query service ready");
        Ok(Self::new(Arc::new(store), config))
    }

    /// [`QueryService::open`] run off the async runtime, since the connect
    /// retry sleeps the calling thread
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Connection`] if the store cannot be opened.
    pub async fn connect(config: &AqConfig) -> Result<Self, QueryError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::open(&config))
            .await
            .map_err(|err| QueryError::Internal(err.to_string()))?
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn thresholds(&self) -> &SeverityThresholds {
        &self.thresholds
    }

    async fn rows(&self, spec: &QuerySpec) -> Result<CachedRows, QueryError> {
        let spec = spec.clone();
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);

        self.cache
            .get_or_fetch(spec.cache_key(), move || async move {
                let now = clock();
                let request = catalog::build_request(&spec, now);
                let rows = tokio::task::spawn_blocking(move || store.execute(&request))
                    .await
                    .map_err(|err| QueryError::Internal(err.to_string()))??;
                Ok::<_, QueryError>(RowSet::validated(spec, now, rows))
            })
            .await
    }

    /// Top anomalies of the trailing window with `score >= min_score`
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidParameters`] before touching the store, or
    /// the fetch error when no stale result can be served.
    #[instrument(skip(self))]
    pub async fn recent_anomalies(
        &self,
        hours: u32,
        min_score: f64,
        limit: u32,
    ) -> Result<Served<Vec<Alert>>, QueryError> {
        let spec = QuerySpec::recent_anomalies(hours, min_score, limit)?;
        let cached = self.rows(&spec).await?;
        let alerts = aggregate::rank_anomalies(&cached.rows.rows, &self.thresholds, limit as usize);
        Ok(Served::from_cached(&cached, alerts))
    }

    /// Anomalies at or above the critical severity threshold
    ///
    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn critical_alerts(
        &self,
        hours: u32,
        limit: u32,
    ) -> Result<Served<Vec<Alert>>, QueryError> {
        let spec = QuerySpec::critical_alerts(hours, self.thresholds.critical, limit)?;
        let cached = self.rows(&spec).await?;
        let alerts = aggregate::rank_anomalies(&cached.rows.rows, &self.thresholds, limit as usize);
        Ok(Served::from_cached(&cached, alerts))
    }

    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn per_variable_summary(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Served<Vec<VariableSummary>>, QueryError> {
        let spec = QuerySpec::per_variable_summary(from, to)?;
        let cached = self.rows(&spec).await?;
        let summary = aggregate::per_variable_summary(&cached.rows.rows);
        Ok(Served::from_cached(&cached, summary))
    }

    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn timeline_daily(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        variable: Option<&str>,
    ) -> Result<Served<Vec<DailyBucket>>, QueryError> {
        let spec = QuerySpec::timeline_daily(from, to, variable)?;
        let cached = self.rows(&spec).await?;
        let timeline = aggregate::timeline_daily(&cached.rows.rows);
        Ok(Served::from_cached(&cached, timeline))
    }

    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn timeline_hourly(
        &self,
        hours_back: u32,
    ) -> Result<Served<Vec<HourlyBucket>>, QueryError> {
        let spec = QuerySpec::timeline_hourly(hours_back)?;
        let cached = self.rows(&spec).await?;
        let timeline = aggregate::timeline_hourly(&cached.rows.rows);
        Ok(Served::from_cached(&cached, timeline))
    }

    /// Dense variable x day anomaly-rate matrix over `[from, to]`
    ///
    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn heatmap(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Served<HeatmapMatrix>, QueryError> {
        let spec = QuerySpec::heatmap_matrix(from, to)?;
        let cached = self.rows(&spec).await?;
        let matrix = aggregate::heatmap(&cached.rows.rows, &spec.params.window.days());
        Ok(Served::from_cached(&cached, matrix))
    }

    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn score_histogram(
        &self,
        variable: Option<&str>,
    ) -> Result<Served<ScoreHistogram>, QueryError> {
        let spec = QuerySpec::score_histogram(variable)?;
        let cached = self.rows(&spec).await?;
        let histogram = aggregate::score_histogram(&cached.rows.rows, &self.thresholds);
        Ok(Served::from_cached(&cached, histogram))
    }

    /// Raw observations of one variable, oldest first
    ///
    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn variable_trend(
        &self,
        variable: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Served<Arc<RowSet>>, QueryError> {
        let spec = QuerySpec::variable_trend(variable, from, to)?;
        let cached = self.rows(&spec).await?;
        let rows = Arc::clone(&cached.rows);
        Ok(Served::from_cached(&cached, rows))
    }

    /// Variables with the most anomalies in the trailing window
    ///
    /// # Errors
    ///
    /// See [`QueryService::recent_anomalies`].
    #[instrument(skip(self))]
    pub async fn top_variables(
        &self,
        hours: u32,
        n: u32,
    ) -> Result<Served<Vec<VariableRanking>>, QueryError> {
        let spec = QuerySpec::top_variables(hours, n)?;
        let cached = self.rows(&spec).await?;
        let ranking = aggregate::top_variables(&cached.rows.rows, n as usize);
        Ok(Served::from_cached(&cached, ranking))
    }

    pub fn invalidate(&self, spec: &QuerySpec) -> bool {
        self.cache.invalidate(&spec.cache_key())
    }

    pub fn invalidate_all(&self) -> usize {
        self.cache.invalidate_all()
    }

    #[must_use]
    pub fn cache_state(&self, spec: &QuerySpec) -> EntryState {
        self.cache.state(&spec.cache_key())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Drop cached results and release the store connection
    pub fn shutdown(&self) {
        let dropped = self.cache.invalidate_all();
        self.store.close();
        info!(dropped, "Query service shut down");
    }
}
