//! Query identities and their typed, validated parameters

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::QueryError;

/// Catalog entries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QueryId {
    RecentAnomalies,
    PerVariableSummary,
    TimelineDaily,
    TimelineHourly,
    HeatmapMatrix,
    ScoreHistogram,
    CriticalAlerts,
    VariableTrend,
    TopVariables,
}

impl QueryId {
    pub const ALL: [QueryId; 9] = [
        QueryId::RecentAnomalies,
        QueryId::PerVariableSummary,
        QueryId::TimelineDaily,
        QueryId::TimelineHourly,
        QueryId::HeatmapMatrix,
        QueryId::ScoreHistogram,
        QueryId::CriticalAlerts,
        QueryId::VariableTrend,
        QueryId::TopVariables,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryId::RecentAnomalies => "recent_anomalies",
            QueryId::PerVariableSummary => "per_variable_summary",
            QueryId::TimelineDaily => "timeline_daily",
            QueryId::TimelineHourly => "timeline_hourly",
            QueryId::HeatmapMatrix => "heatmap_matrix",
            QueryId::ScoreHistogram => "score_histogram",
            QueryId::CriticalAlerts => "critical_alerts",
            QueryId::VariableTrend => "variable_trend",
            QueryId::TopVariables => "top_variables",
        }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueryId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_lowercase();
        QueryId::ALL
            .into_iter()
            .find(|id| id.as_str() == value)
            .ok_or_else(|| format!("unknown query id: {value}"))
    }
}

/// Time filter of a query.
///
/// Trailing windows are resolved against the clock when the fetch runs, so
/// the same request keeps the same cache key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeWindow {
    All,
    /// Inclusive calendar days
    Between { from: NaiveDate, to: NaiveDate },
    TrailingHours { hours: u32 },
}

impl TimeWindow {
    /// Resolve to a half-open `[start, end)` timestamp range
    #[must_use]
    pub fn resolve(&self, now: NaiveDateTime) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
        match *self {
            TimeWindow::All => (None, None),
            TimeWindow::Between { from, to } => (
                Some(from.and_time(NaiveTime::MIN)),
                to.succ_opt().map(|next| next.and_time(NaiveTime::MIN)),
            ),
            TimeWindow::TrailingHours { hours } => {
                let start = now
                    .checked_sub_signed(TimeDelta::hours(i64::from(hours)))
                    .unwrap_or(NaiveDateTime::MIN);
                (Some(start), None)
            }
        }
    }

    /// Calendar days covered by a `Between` window, ascending
    #[must_use]
    pub fn days(&self) -> Vec<NaiveDate> {
        match *self {
            TimeWindow::Between { from, to } => {
                from.iter_days().take_while(|day| *day <= to).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::All => f.write_str("all"),
            TimeWindow::Between { from, to } => write!(f, "{from}..={to}"),
            TimeWindow::TrailingHours { hours } => write!(f, "last {hours}h"),
        }
    }
}

/// A score threshold in `[0, 100]`, comparable and hashable by value
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreBound(f64);

impl ScoreBound {
    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] outside `[0, 100]` or for NaN.
    pub fn new(value: f64) -> Result<Self, QueryError> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(QueryError::invalid(format!(
                "min_score must be within [0, 100], got {value}"
            )));
        }
        // -0.0 and 0.0 must hash alike
        Ok(Self(if value == 0.0 { 0.0 } else { value }))
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for ScoreBound {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for ScoreBound {}

impl Hash for ScoreBound {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// Filters shared by every catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueryParams {
    pub window: TimeWindow,
    pub variable: Option<String>,
    pub min_score: Option<ScoreBound>,
    pub limit: Option<u32>,
}

impl QueryParams {
    fn window(window: TimeWindow) -> Self {
        Self {
            window,
            variable: None,
            min_score: None,
            limit: None,
        }
    }
}

/// A catalog entry plus its parameters.
///
/// Build it through the validating constructors below; the service never
/// hands an unchecked spec to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QuerySpec {
    pub query_id: QueryId,
    pub params: QueryParams,
}

/// Structural cache identity of a [`QuerySpec`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(QuerySpec);

impl CacheKey {
    #[must_use]
    pub fn spec(&self) -> &QuerySpec {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl QuerySpec {
    /// Anomalies with `score >= min_score` in the last `hours`, best first
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] for a zero window or limit or
    /// a score outside `[0, 100]`.
    pub fn recent_anomalies(hours: u32, min_score: f64, limit: u32) -> Result<Self, QueryError> {
        Self::ranked(QueryId::RecentAnomalies, hours, min_score, limit)
    }

    /// Anomalies at or above the critical threshold in the last `hours`
    ///
    /// # Errors
    /// See [`QuerySpec::recent_anomalies`].
    pub fn critical_alerts(
        hours: u32,
        critical_threshold: f64,
        limit: u32,
    ) -> Result<Self, QueryError> {
        Self::ranked(QueryId::CriticalAlerts, hours, critical_threshold, limit)
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] when `from > to`.
    pub fn per_variable_summary(from: NaiveDate, to: NaiveDate) -> Result<Self, QueryError> {
        Ok(Self {
            query_id: QueryId::PerVariableSummary,
            params: QueryParams::window(between(from, to)?),
        })
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] when `from > to` or the
    /// variable filter is blank.
    pub fn timeline_daily(
        from: NaiveDate,
        to: NaiveDate,
        variable: Option<&str>,
    ) -> Result<Self, QueryError> {
        let mut params = QueryParams::window(between(from, to)?);
        params.variable = variable.map(normalize_variable).transpose()?;
        Ok(Self {
            query_id: QueryId::TimelineDaily,
            params,
        })
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] for a zero window.
    pub fn timeline_hourly(hours_back: u32) -> Result<Self, QueryError> {
        Ok(Self {
            query_id: QueryId::TimelineHourly,
            params: QueryParams::window(trailing(hours_back)?),
        })
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] when `from > to`.
    pub fn heatmap_matrix(from: NaiveDate, to: NaiveDate) -> Result<Self, QueryError> {
        Ok(Self {
            query_id: QueryId::HeatmapMatrix,
            params: QueryParams::window(between(from, to)?),
        })
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] for a blank variable filter.
    pub fn score_histogram(variable: Option<&str>) -> Result<Self, QueryError> {
        let mut params = QueryParams::window(TimeWindow::All);
        params.variable = variable.map(normalize_variable).transpose()?;
        Ok(Self {
            query_id: QueryId::ScoreHistogram,
            params,
        })
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] when `from > to` or the
    /// variable is blank.
    pub fn variable_trend(
        variable: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Self, QueryError> {
        let mut params = QueryParams::window(between(from, to)?);
        params.variable = Some(normalize_variable(variable)?);
        Ok(Self {
            query_id: QueryId::VariableTrend,
            params,
        })
    }

    /// # Errors
    /// Returns [`QueryError::InvalidParameters`] for a zero window or `n`.
    pub fn top_variables(hours: u32, n: u32) -> Result<Self, QueryError> {
        let mut params = QueryParams::window(trailing(hours)?);
        params.limit = Some(positive_limit(n)?);
        Ok(Self {
            query_id: QueryId::TopVariables,
            params,
        })
    }

    fn ranked(query_id: QueryId, hours: u32, min_score: f64, limit: u32) -> Result<Self, QueryError> {
        let mut params = QueryParams::window(trailing(hours)?);
        params.min_score = Some(ScoreBound::new(min_score)?);
        params.limit = Some(positive_limit(limit)?);
        Ok(Self { query_id, params })
    }

    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey(self.clone())
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}", self.query_id, self.params.window)?;
        if let Some(variable) = &self.params.variable {
            write!(f, ", variable={variable}")?;
        }
        if let Some(min_score) = self.params.min_score {
            write!(f, ", min_score={}", min_score.value())?;
        }
        if let Some(limit) = self.params.limit {
            write!(f, ", limit={limit}")?;
        }
        f.write_str("]")
    }
}

fn between(from: NaiveDate, to: NaiveDate) -> Result<TimeWindow, QueryError> {
    if from > to {
        return Err(QueryError::invalid(format!(
            "date_from ({from}) must not be after date_to ({to})"
        )));
    }
    Ok(TimeWindow::Between { from, to })
}

fn trailing(hours: u32) -> Result<TimeWindow, QueryError> {
    if hours == 0 {
        return Err(QueryError::invalid("hours must be > 0"));
    }
    Ok(TimeWindow::TrailingHours { hours })
}

fn positive_limit(limit: u32) -> Result<u32, QueryError> {
    if limit == 0 {
        return Err(QueryError::invalid("limit must be > 0"));
    }
    Ok(limit)
}

fn normalize_variable(variable: &str) -> Result<String, QueryError> {
    let trimmed = variable.trim();
    if trimmed.is_empty() {
        return Err(QueryError::invalid("variable filter must not be blank"));
    }
    Ok(trimmed.to_string())
}
