//! Pure derivations over fetched rows.
//!
//! Nothing here performs I/O or looks at the clock; every function is a
//! deterministic function of its input slice. Empty input yields an empty
//! result, never an error.

use aq_store::Row;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::severity::{SeverityLevel, SeverityThresholds};

/// An anomalous observation ready for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: NaiveDateTime,
    pub variable: String,
    pub actual: f64,
    pub predicted: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub anomaly_score: f64,
    pub prediction_error_pct: f64,
    pub severity: SeverityLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub variable: String,
    pub total_points: u64,
    pub anomalies: u64,
    /// `anomalies / total_points`
    pub anomaly_rate: f64,
    pub mean_score: Option<f64>,
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub day: NaiveDate,
    pub points: u64,
    pub anomalies: u64,
    pub mean_score: Option<f64>,
    pub max_score: Option<f64>,
    pub distinct_variables: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub day: NaiveDate,
    pub hour: u32,
    pub anomalies: u64,
    pub mean_score: Option<f64>,
}

/// Dense variable x day matrix of anomaly rates (percent, 2 decimals)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapMatrix {
    pub variables: Vec<String>,
    pub days: Vec<NaiveDate>,
    /// `cells[i][j]` is the rate of `variables[i]` on `days[j]`
    pub cells: Vec<Vec<f64>>,
}

impl HeatmapMatrix {
    #[must_use]
    pub fn get(&self, variable: &str, day: NaiveDate) -> Option<f64> {
        let row = self.variables.iter().position(|v| v == variable)?;
        let col = self.days.iter().position(|d| *d == day)?;
        Some(self.cells[row][col])
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBin {
    pub score: f64,
    pub frequency: u64,
    pub anomalies: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreHistogram {
    pub bins: Vec<ScoreBin>,
    pub severity: BTreeMap<SeverityLevel, u64>,
}

/// A variable's standing among those with recent anomalies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRanking {
    pub variable: String,
    pub anomalies: u64,
    pub mean_score: Option<f64>,
    pub max_score: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ScoreStats {
    count: u64,
    sum: f64,
    max: Option<f64>,
}

impl ScoreStats {
    fn add(&mut self, score: Option<f64>) {
        if let Some(score) = score {
            self.count += 1;
            self.sum += score;
            self.max = Some(self.max.map_or(score, |m| m.max(score)));
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

fn score_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    b.unwrap_or(f64::NEG_INFINITY)
        .total_cmp(&a.unwrap_or(f64::NEG_INFINITY))
}

/// Anomalous rows with a score, best first (score desc, then most recent),
/// capped at `limit`.
#[must_use]
pub fn rank_anomalies(rows: &[Row], thresholds: &SeverityThresholds, limit: usize) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = rows
        .iter()
        .filter(|row| row.is_anomaly)
        .filter_map(|row| {
            let score = row.anomaly_score?;
            Some(Alert {
                timestamp: row.timestamp,
                variable: row.variable.clone(),
                actual: row.actual,
                predicted: row.predicted,
                lower_bound: row.lower_bound,
                upper_bound: row.upper_bound,
                anomaly_score: score,
                prediction_error_pct: row.prediction_error_pct,
                severity: thresholds.classify(score),
            })
        })
        .collect();

    alerts.sort_by(|a, b| {
        b.anomaly_score
            .total_cmp(&a.anomaly_score)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
    alerts.truncate(limit);
    alerts
}

/// Per-variable totals. Scores are averaged over anomalous rows only and
/// variables without anomalies are left out.
#[must_use]
pub fn per_variable_summary(rows: &[Row]) -> Vec<VariableSummary> {
    let mut groups: HashMap<&str, (u64, u64, ScoreStats)> = HashMap::new();
    for row in rows {
        let entry = groups.entry(row.variable.as_str()).or_default();
        entry.0 += 1;
        if row.is_anomaly {
            entry.1 += 1;
            entry.2.add(row.anomaly_score);
        }
    }

    let mut summaries: Vec<VariableSummary> = groups
        .into_iter()
        .filter(|(_, (_, anomalies, _))| *anomalies > 0)
        .map(|(variable, (total, anomalies, stats))| VariableSummary {
            variable: variable.to_string(),
            total_points: total,
            anomalies,
            anomaly_rate: anomalies as f64 / total as f64,
            mean_score: stats.mean(),
            max_score: stats.max,
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.anomalies
            .cmp(&a.anomalies)
            .then_with(|| score_desc(a.max_score, b.max_score))
            .then_with(|| a.variable.cmp(&b.variable))
    });
    summaries
}

/// One bucket per calendar day that has data, ascending
#[must_use]
pub fn timeline_daily(rows: &[Row]) -> Vec<DailyBucket> {
    let mut days: BTreeMap<NaiveDate, (u64, u64, ScoreStats, BTreeSet<&str>)> = BTreeMap::new();
    for row in rows {
        let entry = days.entry(row.timestamp.date()).or_default();
        entry.0 += 1;
        if row.is_anomaly {
            entry.1 += 1;
        }
        entry.2.add(row.anomaly_score);
        entry.3.insert(row.variable.as_str());
    }

    days.into_iter()
        .map(|(day, (points, anomalies, stats, variables))| DailyBucket {
            day,
            points,
            anomalies,
            mean_score: stats.mean(),
            max_score: stats.max,
            distinct_variables: variables.len(),
        })
        .collect()
}

/// Anomalies grouped by (day, hour), ascending
#[must_use]
pub fn timeline_hourly(rows: &[Row]) -> Vec<HourlyBucket> {
    let mut hours: BTreeMap<(NaiveDate, u32), (u64, ScoreStats)> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.is_anomaly) {
        let entry = hours
            .entry((row.timestamp.date(), row.timestamp.hour()))
            .or_default();
        entry.0 += 1;
        entry.1.add(row.anomaly_score);
    }

    hours
        .into_iter()
        .map(|((day, hour), (anomalies, stats))| HourlyBucket {
            day,
            hour,
            anomalies,
            mean_score: stats.mean(),
        })
        .collect()
}

/// Pivot rows into a dense rate matrix.
///
/// Columns are `days` when given, otherwise every day between the first and
/// last row. Missing cells are 0.
#[must_use]
pub fn heatmap(rows: &[Row], days: &[NaiveDate]) -> HeatmapMatrix {
    let days: Vec<NaiveDate> = if days.is_empty() {
        match (
            rows.iter().map(|r| r.timestamp.date()).min(),
            rows.iter().map(|r| r.timestamp.date()).max(),
        ) {
            (Some(first), Some(last)) => first.iter_days().take_while(|d| *d <= last).collect(),
            _ => Vec::new(),
        }
    } else {
        days.to_vec()
    };

    let mut counts: HashMap<(&str, NaiveDate), (u64, u64)> = HashMap::new();
    let mut variables: BTreeSet<&str> = BTreeSet::new();
    for row in rows {
        variables.insert(row.variable.as_str());
        let entry = counts
            .entry((row.variable.as_str(), row.timestamp.date()))
            .or_default();
        entry.0 += 1;
        if row.is_anomaly {
            entry.1 += 1;
        }
    }

    let cells: Vec<Vec<f64>> = variables
        .iter()
        .map(|variable| {
            days.iter()
                .map(|day| match counts.get(&(*variable, *day)) {
                    Some(&(total, anomalies)) if total > 0 => {
                        let rate = anomalies as f64 * 100.0 / total as f64;
                        (rate * 100.0).round() / 100.0
                    }
                    _ => 0.0,
                })
                .collect()
        })
        .collect();

    HeatmapMatrix {
        variables: variables.into_iter().map(str::to_string).collect(),
        days,
        cells,
    }
}

/// Count of scored rows in each severity band; every band is present
#[must_use]
pub fn severity_distribution(
    rows: &[Row],
    thresholds: &SeverityThresholds,
) -> BTreeMap<SeverityLevel, u64> {
    let mut dist: BTreeMap<SeverityLevel, u64> =
        SeverityLevel::ALL.into_iter().map(|level| (level, 0)).collect();
    for score in rows.iter().filter_map(|row| row.anomaly_score) {
        *dist.entry(thresholds.classify(score)).or_default() += 1;
    }
    dist
}

/// Frequency of each exact score value, ascending
#[must_use]
pub fn score_histogram(rows: &[Row], thresholds: &SeverityThresholds) -> ScoreHistogram {
    let mut bins: HashMap<u64, ScoreBin> = HashMap::new();
    for row in rows {
        let Some(score) = row.anomaly_score else {
            continue;
        };
        // -0.0 and 0.0 share a bin
        let score = if score == 0.0 { 0.0 } else { score };
        let bin = bins.entry(score.to_bits()).or_insert(ScoreBin {
            score,
            frequency: 0,
            anomalies: 0,
        });
        bin.frequency += 1;
        if row.is_anomaly {
            bin.anomalies += 1;
        }
    }

    let mut bins: Vec<ScoreBin> = bins.into_values().collect();
    bins.sort_by(|a, b| a.score.total_cmp(&b.score));

    ScoreHistogram {
        bins,
        severity: severity_distribution(rows, thresholds),
    }
}

/// Variables ranked by anomaly count, then max score, then name; first `n`
#[must_use]
pub fn top_variables(rows: &[Row], n: usize) -> Vec<VariableRanking> {
    let mut groups: HashMap<&str, (u64, ScoreStats)> = HashMap::new();
    for row in rows.iter().filter(|row| row.is_anomaly) {
        let entry = groups.entry(row.variable.as_str()).or_default();
        entry.0 += 1;
        entry.1.add(row.anomaly_score);
    }

    let mut ranking: Vec<VariableRanking> = groups
        .into_iter()
        .map(|(variable, (anomalies, stats))| VariableRanking {
            variable: variable.to_string(),
            anomalies,
            mean_score: stats.mean(),
            max_score: stats.max,
        })
        .collect();

    ranking.sort_by(|a, b| {
        b.anomalies
            .cmp(&a.anomalies)
            .then_with(|| score_desc(a.max_score, b.max_score))
            .then_with(|| a.variable.cmp(&b.variable))
    });
    ranking.truncate(n);
    ranking
}
