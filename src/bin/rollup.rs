//! Metrics Rollup command line
//!
//! Runs one aggregation against a JSON fixture of records loaded into the
//! in-memory remote store, and prints the result as JSON.
//!
//! # Configuration
//!
//! The tool reads configuration from:
//! 1. `--config` (path to TOML file)
//! 2. `ROLLUP_CONFIG` environment variable
//! 3. Default configuration
//!
//! `ROLLUP_*` environment variables and `RUST_LOG` override file values.
//!
//! # Example Usage
//!
//! ```bash
//! # Count score results in one hour, printing each 15-minute bucket
//! rollup aggregate --records records.json --account acct-1 --kind scoreResults \
//!   --start 2024-05-01T10:00:00Z --end 2024-05-01T11:00:00Z --progress
//!
//! # Validate a configuration file
//! rollup --config rollup.toml check-config
//! ```

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use metrics_rollup::{
    AggregationRequest, AggregatorBuilder, Config, InMemoryRemote, RawRecord, RecordKind,
    SubFilters,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "rollup")]
#[command(version)]
#[command(about = "Hierarchical time-bucketed metrics aggregation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides ROLLUP_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate records from a fixture file
    Aggregate {
        /// JSON file holding an object of `account -> kind -> [records]`
        /// or a plain array of records for `--account`/`--kind`
        #[arg(short, long)]
        records: PathBuf,

        /// Account to query
        #[arg(short, long)]
        account: String,

        /// Record kind (items, tasks, scoreResults, feedbackItems)
        #[arg(short, long)]
        kind: RecordKind,

        /// Window start, RFC 3339
        #[arg(long)]
        start: DateTime<Utc>,

        /// Window end, RFC 3339
        #[arg(long)]
        end: DateTime<Utc>,

        /// Only records of this scorecard
        #[arg(long)]
        scorecard: Option<String>,

        /// Only records of this score
        #[arg(long)]
        score: Option<String>,

        /// Only records of this subtype
        #[arg(long)]
        subtype: Option<String>,

        /// Print a line per top-level bucket as it completes
        #[arg(long)]
        progress: bool,

        /// Append Prometheus metrics to the output
        #[arg(long)]
        metrics: bool,
    },

    /// Validate configuration and print the effective values
    CheckConfig,
}

/// Fixture layouts accepted by `--records`
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Fixture {
    Flat(Vec<RawRecord>),
    Nested(BTreeMap<String, BTreeMap<String, Vec<RawRecord>>>),
}

fn load_config(path: Option<&Path>) -> metrics_rollup::Result<Config> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("ROLLUP_CONFIG").ok().map(PathBuf::from));

    match path {
        Some(path) => Config::from_file_with_env(path),
        None => Ok(Config::from_env()),
    }
}

fn load_records(
    path: &Path,
    account: &str,
    kind: RecordKind,
) -> Result<InMemoryRemote, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let remote = InMemoryRemote::new();

    match serde_json::from_str::<Fixture>(&raw)? {
        Fixture::Flat(records) => {
            debug!(records = records.len(), "Loaded flat fixture");
            remote.insert(account, kind, records);
        }
        Fixture::Nested(accounts) => {
            for (account_id, kinds) in accounts {
                for (kind, records) in kinds {
                    let kind: RecordKind = kind.parse()?;
                    debug!(account = %account_id, kind = %kind, records = records.len(), "Loaded fixture records");
                    remote.insert(&account_id, kind, records);
                }
            }
        }
    }

    Ok(remote)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            info!("Configuration is valid");
            Ok(())
        }
        Commands::Aggregate {
            records,
            account,
            kind,
            start,
            end,
            scorecard,
            score,
            subtype,
            progress,
            metrics,
        } => {
            metrics_rollup::metrics::init();

            let remote = load_records(&records, &account, kind)?;
            let aggregator = AggregatorBuilder::new()
                .with_remote(remote)
                .with_config(config)
                .build()?;

            let request = AggregationRequest::new(account, kind, start, end)?.with_filters(
                SubFilters {
                    scorecard_id: scorecard,
                    score_id: score,
                    subtype,
                },
            );

            let result = aggregator
                .get_aggregated_metrics_with_progress(&request, |p| {
                    if progress {
                        eprintln!(
                            "[{}/{}] {} .. {}  count={} running={}",
                            p.bucket_index + 1,
                            p.total_buckets,
                            p.bucket_start.to_rfc3339(),
                            p.bucket_end.to_rfc3339(),
                            p.bucket_metrics.count,
                            p.running_total.count
                        );
                    }
                })
                .await;

            let output = json!({
                "result": result,
                "cache": aggregator.get_cache_stats(),
                "stats": aggregator.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);

            if metrics {
                println!("{}", metrics_rollup::metrics::gather_metrics()?);
            }
            Ok(())
        }
    }
}
