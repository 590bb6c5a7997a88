//! `aq_cli` - CLI commands for the anomaly query service
//!
//! This crate provides:
//! - clap-based command definitions, one subcommand per catalog query
//! - JSON envelope output
//! - Config inspection

use aq_config::AqConfig;
use aq_query::QueryService;
use chrono::{Local, NaiveDate, TimeDelta};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub mod envelope;

pub use envelope::QueryEnvelope;

/// CLI errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Config error: {0}")]
    ConfigError(#[from] aq_config::ConfigError),

    #[error("Query error: {0}")]
    QueryError(#[from] aq_query::QueryError),
}

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputFormat {
    /// Compact JSON, one document per line
    Json,
    /// Indented JSON
    Text,
}

/// Main CLI application
#[derive(Parser, Debug)]
#[command(name = "aq")]
#[command(author, version, about = "Time-series anomaly query service")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for commands
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Most severe recent anomalies
    Recent {
        /// Trailing window in hours
        #[arg(long, default_value = "24")]
        hours: u32,

        /// Minimum anomaly score (0-100)
        #[arg(long, default_value = "75")]
        min_score: f64,

        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },

    /// Per-variable anomaly totals and rates
    Summary {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Daily point and anomaly counts
    Daily {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Restrict to one variable
        #[arg(long)]
        variable: Option<String>,
    },

    /// Hourly anomaly counts over a trailing window
    Hourly {
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Variable x day anomaly-rate matrix
    Heatmap {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Score frequencies and severity distribution
    Histogram {
        #[arg(long)]
        variable: Option<String>,
    },

    /// Anomalies at or above the critical threshold
    Alerts {
        #[arg(long, default_value = "24")]
        hours: u32,

        #[arg(short = 'n', long, default_value = "50")]
        limit: u32,
    },

    /// Actual vs predicted series for one variable
    Trend {
        #[arg(long)]
        variable: String,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Variables requiring attention
    Top {
        #[arg(long, default_value = "24")]
        hours: u32,

        #[arg(short = 'n', long, default_value = "10")]
        n: u32,
    },

    /// Cache counters and settings
    Stats,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
}

/// Days covered by a range whose bounds were not given
const DEFAULT_RANGE_DAYS: i64 = 7;

impl Cli {
    /// Run the CLI
    ///
    /// # Errors
    ///
    /// Returns a [`CliError`] if configuration, the store or the query fails.
    pub async fn run(self) -> Result<(), CliError> {
        let config = self.load_config()?;
        self.run_with_config(config).await
    }

    /// Load the file named by `--config`, or discover one, with env overrides
    ///
    /// # Errors
    ///
    /// Returns [`CliError::ConfigError`] if the file is unreadable or invalid.
    pub fn load_config(&self) -> Result<AqConfig, CliError> {
        Ok(match self.config.as_deref() {
            Some(path) => AqConfig::load_with_env(path)?,
            None => AqConfig::discover_with_env()?,
        })
    }

    /// Run with an already loaded configuration
    ///
    /// # Errors
    ///
    /// Returns a [`CliError`] if the store or the query fails.
    pub async fn run_with_config(self, config: AqConfig) -> Result<(), CliError> {
        let format = self.format;

        if let Commands::Config {
            command: ConfigCommands::Show,
        } = &self.command
        {
            print_output(&QueryEnvelope::new("config", &config), format);
            return Ok(());
        }

        let service = QueryService::connect(&config).await?;
        let result = execute(&service, &config, self.command, format).await;
        service.shutdown();
        result
    }
}

/// Run one query command against an open service and print the result
///
/// # Errors
///
/// Returns a [`CliError`] if the query fails or its arguments are invalid.
pub async fn execute(
    service: &QueryService,
    config: &AqConfig,
    command: Commands,
    format: OutputFormat,
) -> Result<(), CliError> {
    debug!(?command, "Executing command");
    match command {
        Commands::Recent {
            hours,
            min_score,
            limit,
        } => {
            let served = service.recent_anomalies(hours, min_score, limit).await?;
            print_output(&QueryEnvelope::served("recent_anomalies", served), format);
        }
        Commands::Summary { from, to } => {
            let (from, to) = date_range(from, to);
            let served = service.per_variable_summary(from, to).await?;
            print_output(&QueryEnvelope::served("per_variable_summary", served), format);
        }
        Commands::Daily { from, to, variable } => {
            let (from, to) = date_range(from, to);
            let served = service
                .timeline_daily(from, to, variable.as_deref())
                .await?;
            print_output(&QueryEnvelope::served("timeline_daily", served), format);
        }
        Commands::Hourly { hours } => {
            let served = service.timeline_hourly(hours).await?;
            print_output(&QueryEnvelope::served("timeline_hourly", served), format);
        }
        Commands::Heatmap { from, to } => {
            let (from, to) = date_range(from, to);
            let served = service.heatmap(from, to).await?;
            print_output(&QueryEnvelope::served("heatmap_matrix", served), format);
        }
        Commands::Histogram { variable } => {
            let served = service.score_histogram(variable.as_deref()).await?;
            print_output(&QueryEnvelope::served("score_histogram", served), format);
        }
        Commands::Alerts { hours, limit } => {
            let served = service.critical_alerts(hours, limit).await?;
            print_output(&QueryEnvelope::served("critical_alerts", served), format);
        }
        Commands::Trend { variable, from, to } => {
            let (from, to) = date_range(from, to);
            let served = service.variable_trend(&variable, from, to).await?;
            let served = aq_query::Served {
                data: served.data.rows.clone(),
                degraded: served.degraded,
                fetched_at: served.fetched_at,
                warnings: served.warnings,
            };
            print_output(&QueryEnvelope::served("variable_trend", served), format);
        }
        Commands::Top { hours, n } => {
            let served = service.top_variables(hours, n).await?;
            print_output(&QueryEnvelope::served("top_variables", served), format);
        }
        Commands::Stats => {
            let data = serde_json::json!({
                "cache": service.cache_stats(),
                "default_ttl_secs": config.cache.default_ttl_secs,
                "max_entries": config.cache.max_entries,
                "ttl_overrides": config.cache.ttl_overrides,
                "severity": service.thresholds(),
            });
            print_output(&QueryEnvelope::new("cache_stats", data), format);
        }
        Commands::Config { .. } => {
            print_output(&QueryEnvelope::new("config", config), format);
        }
    }
    Ok(())
}

/// Fill missing bounds: `to` defaults to today, `from` to a week before `to`
fn date_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
    let to = to.unwrap_or_else(|| Local::now().date_naive());
    let from = from.unwrap_or_else(|| {
        to.checked_sub_signed(TimeDelta::days(DEFAULT_RANGE_DAYS - 1))
            .unwrap_or(NaiveDate::MIN)
    });
    (from, to)
}

fn print_output<T: Serialize>(value: &T, format: OutputFormat) {
    let json = match format {
        OutputFormat::Json => serde_json::to_string(value),
        OutputFormat::Text => serde_json::to_string_pretty(value),
    }
    .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {e}"}}"#));
    println!("{json}");
}
