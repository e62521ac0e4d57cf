//! meterrisk CLI - water-meter failure-risk and subcounting scoring

#![deny(warnings)]

// Global invariants enforced:
// - Deterministic output ordering
// - Identical input yields byte-for-byte identical output
// - Nothing is written unless the whole run succeeded

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use meterrisk_core::aggregate::AggregationFrequency;
use meterrisk_core::anomaly::DistanceMetric;
use meterrisk_core::config::{self, ResolvedConfig};
use meterrisk_core::degradation::DegradationNormalization;
use meterrisk_core::inputs::{self, DEFAULT_SQLITE_TABLE};
use meterrisk_core::pipeline::{self, cluster_map, PipelineInputs};
use meterrisk_core::report;
use meterrisk_core::types::ConsumptionRecord;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "meterrisk")]
#[command(about = "Failure-risk and subcounting scoring for water meter fleets")]
#[command(version)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score every meter and emit the risk table
    Score {
        #[command(flatten)]
        consumption: ConsumptionSource,

        /// Latent vector table (meter_id, z_1..z_d)
        #[arg(long)]
        latent: PathBuf,

        /// Cluster assignment table (meter_id, cluster_id)
        #[arg(long)]
        clusters: PathBuf,

        /// Physical feature table (meter_id, age, canya)
        #[arg(long)]
        physical: PathBuf,

        /// Directory for risk.csv, cluster_summary.csv and subcounting.csv
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Output format for stdout
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Also print the per-cluster summary (text format)
        #[arg(long)]
        summary: bool,

        #[command(flatten)]
        view: TopView,

        #[command(flatten)]
        overrides: Overrides,

        /// Path to config file (default: auto-discover)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Compute subcounting metrics only (no latent or physical inputs needed)
    Subcount {
        #[command(flatten)]
        consumption: ConsumptionSource,

        /// Cluster assignments (required with --use-cluster-peers)
        #[arg(long)]
        clusters: Option<PathBuf>,

        /// Write the metrics table to this CSV file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output format for stdout
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        #[command(flatten)]
        view: TopView,

        #[command(flatten)]
        overrides: Overrides,

        /// Path to config file (default: auto-discover)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a config file without scoring
    Validate {
        /// Path to config file (default: auto-discover from current directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show the resolved configuration (merged defaults + config file)
    Show {
        /// Path to config file (default: auto-discover from current directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

/// Daily consumption comes from a CSV file or a SQLite table
#[derive(Args)]
struct ConsumptionSource {
    /// Daily consumption CSV (meter_id, date, volume)
    #[arg(long)]
    consumption: Option<PathBuf>,

    /// SQLite database holding daily consumption
    #[arg(long, conflicts_with = "consumption")]
    consumption_db: Option<PathBuf>,

    /// Table name inside --consumption-db
    #[arg(long, default_value = DEFAULT_SQLITE_TABLE)]
    consumption_table: String,
}

#[derive(Args)]
struct TopView {
    /// Show only the top N rows (overrides config file)
    #[arg(long, conflicts_with = "top_percent")]
    top: Option<usize>,

    /// Show only the top P percent of rows
    #[arg(long)]
    top_percent: Option<f64>,
}

/// CLI flags that override config file values
#[derive(Args)]
struct Overrides {
    /// Cap on the subcounting contribution, in [0, 1]
    #[arg(long)]
    gamma: Option<f64>,

    /// Weight of anomaly_score in the base risk
    #[arg(long)]
    w1: Option<f64>,

    /// Weight of cluster_degradation in the base risk
    #[arg(long)]
    w2: Option<f64>,

    /// Weight of age in cluster degradation
    #[arg(long)]
    alpha: Option<f64>,

    /// Weight of canya in cluster degradation
    #[arg(long)]
    beta: Option<f64>,

    /// Distance to the cluster centroid: euclidean or mahalanobis
    #[arg(long)]
    distance_metric: Option<DistanceMetric>,

    /// Where age and canya are normalised: per_meter or cluster_mean
    #[arg(long)]
    degradation_normalization: Option<DegradationNormalization>,

    /// Aggregation period: monthly or weekly
    #[arg(long)]
    frequency: Option<AggregationFrequency>,

    /// Normalise against cluster peers instead of the whole fleet
    #[arg(long)]
    use_cluster_peers: bool,

    /// Skip subcounting; risk is driven by anomaly and degradation only
    #[arg(long)]
    disable_subcounting: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl Overrides {
    fn apply(&self, resolved: &mut ResolvedConfig) -> anyhow::Result<()> {
        if let Some(v) = self.gamma {
            resolved.combination.gamma = v;
        }
        if let Some(v) = self.w1 {
            resolved.combination.w1 = v;
        }
        if let Some(v) = self.w2 {
            resolved.combination.w2 = v;
        }
        if let Some(v) = self.alpha {
            resolved.degradation.alpha = v;
        }
        if let Some(v) = self.beta {
            resolved.degradation.beta = v;
        }
        if let Some(m) = self.distance_metric {
            resolved.anomaly.distance_metric = m;
        }
        if let Some(n) = self.degradation_normalization {
            resolved.degradation.normalization = n;
        }
        if let Some(f) = self.frequency {
            resolved.subcounting.frequency = f;
        }
        if self.use_cluster_peers {
            resolved.subcounting.use_cluster_peers = true;
        }
        if self.disable_subcounting {
            resolved.subcounting.enabled = false;
        }
        resolved
            .validate()
            .context("invalid value in command-line overrides")
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn load_config(
    config_path: Option<&Path>,
    overrides: &Overrides,
) -> anyhow::Result<ResolvedConfig> {
    let root = std::env::current_dir()?;
    let mut resolved =
        config::load_and_resolve(&root, config_path).context("failed to load configuration")?;
    if let Some(p) = &resolved.config_path {
        log::info!("using config: {}", p.display());
    }
    overrides.apply(&mut resolved)?;
    Ok(resolved)
}

fn load_consumption(source: &ConsumptionSource) -> anyhow::Result<Vec<ConsumptionRecord>> {
    match (&source.consumption, &source.consumption_db) {
        (Some(csv), _) => Ok(inputs::load_consumption_csv(csv)?),
        (None, Some(db)) => Ok(inputs::load_consumption_sqlite(db, &source.consumption_table)?),
        (None, None) => anyhow::bail!("one of --consumption or --consumption-db is required"),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Score {
            consumption,
            latent,
            clusters,
            physical,
            output_dir,
            format,
            summary,
            view,
            overrides,
            config: config_path,
        } => {
            let resolved = load_config(config_path.as_deref(), &overrides)?;

            // Every input is loaded before scoring starts
            let pipeline_inputs = PipelineInputs {
                consumption: if resolved.subcounting.enabled {
                    load_consumption(&consumption)?
                } else {
                    Vec::new()
                },
                clusters: inputs::load_cluster_assignments(&clusters)?,
                latent: inputs::load_latent_vectors(&latent)?,
                physical: inputs::load_physical_features(&physical)?,
            };

            let table = pipeline::run(&pipeline_inputs, &resolved)?;
            if !table.fallbacks.is_empty() {
                log::warn!(
                    "{} low-confidence meter(s), {} cluster(s) scored with Euclidean fallback",
                    table.fallbacks.count_insufficient_data(),
                    table.fallbacks.count_singular_covariance()
                );
            }

            if let Some(dir) = output_dir {
                report::write_risk_csv(&dir.join("risk.csv"), &table.records, &resolved.status)?;
                report::write_summary_csv(&dir.join("cluster_summary.csv"), &table.summaries)?;
                if resolved.subcounting.enabled {
                    let metrics = report::sort_subcounting(table.subcounting.clone());
                    report::write_subcounting_csv(&dir.join("subcounting.csv"), &metrics)?;
                }
                log::info!("wrote results to {}", dir.display());
            }

            let top = view.top.or(resolved.top_n);
            let n = report::top_count(table.records.len(), top, view.top_percent);
            let shown = &table.records[..n];
            match format {
                OutputFormat::Text => {
                    print!("{}", report::render_text(shown, &resolved.status));
                    if summary {
                        println!();
                        print!("{}", report::render_summary_text(&table.summaries));
                    }
                }
                OutputFormat::Json => {
                    println!("{}", report::render_json(shown, &resolved.status));
                }
                OutputFormat::Csv => {
                    print!("{}", report::risk_csv(shown, &resolved.status)?);
                }
            }
        }
        Commands::Subcount {
            consumption,
            clusters,
            output,
            format,
            view,
            overrides,
            config: config_path,
        } => {
            let mut resolved = load_config(config_path.as_deref(), &overrides)?;
            // The standalone run always computes subcounting
            resolved.subcounting.enabled = true;

            let records = load_consumption(&consumption)?;
            let assignments = match &clusters {
                Some(path) => Some(cluster_map(&inputs::load_cluster_assignments(path)?)?),
                None => None,
            };

            let (metrics, fallbacks) =
                pipeline::run_subcounting(&records, assignments.as_ref(), &resolved.subcounting)?;
            if !fallbacks.is_empty() {
                log::warn!(
                    "{} low-confidence meter(s)",
                    fallbacks.count_insufficient_data()
                );
            }
            let metrics = report::sort_subcounting(metrics);

            if let Some(path) = output {
                report::write_subcounting_csv(&path, &metrics)?;
                log::info!("wrote subcounting metrics to {}", path.display());
            }

            let top = view.top.or(resolved.top_n);
            let shown = &metrics[..report::top_count(metrics.len(), top, view.top_percent)];
            match format {
                OutputFormat::Text => print!("{}", report::render_subcounting_text(shown)),
                OutputFormat::Json => println!("{}", report::render_subcounting_json(shown)),
                OutputFormat::Csv => print!("{}", report::subcounting_csv(shown)?),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Validate { path } => {
                let root = std::env::current_dir()?;
                let resolved = config::load_and_resolve(&root, path.as_deref());

                match resolved {
                    Ok(config) => {
                        if let Some(ref p) = config.config_path {
                            println!("Config valid: {}", p.display());
                        } else {
                            println!("No config file found. Using defaults.");
                        }
                    }
                    Err(e) => {
                        eprintln!("Config validation failed: {:#}", e);
                        std::process::exit(1);
                    }
                }
            }
            ConfigAction::Show { path } => {
                let root = std::env::current_dir()?;
                let resolved = config::load_and_resolve(&root, path.as_deref())
                    .context("failed to load configuration")?;
                print!("{}", render_config(&resolved));
            }
        },
    }

    Ok(())
}

fn render_config(resolved: &ResolvedConfig) -> String {
    let s = &resolved.subcounting;
    let ind = &s.indicators;
    let mut out = String::new();

    out.push_str("Configuration:\n");
    match resolved.config_path {
        Some(ref p) => out.push_str(&format!("  Source: {}\n", p.display())),
        None => out.push_str("  Source: defaults (no config file found)\n"),
    }
    out.push('\n');
    out.push_str("Subcounting:\n");
    out.push_str(&format!("  enabled: {}\n", s.enabled));
    out.push_str(&format!("  frequency: {}\n", s.frequency.as_str()));
    out.push_str(&format!("  use_cluster_peers: {}\n", s.use_cluster_peers));
    out.push_str(&format!(
        "  windows: min_periods={} baseline={} recent={} min_trend={}\n",
        ind.min_periods, ind.baseline_window, ind.recent_window, ind.min_trend_periods
    ));
    out.push_str(&format!(
        "  weights: ratio={} trend={} slope_change={}\n",
        s.weights.ratio, s.weights.trend, s.weights.slope_change
    ));
    out.push_str(&format!(
        "  reinforcement: threshold={} floor={} min_signals={}\n",
        s.reinforcement.threshold, s.reinforcement.floor, s.reinforcement.min_signals
    ));
    for (name, ramp) in [
        ("ratio", ind.ratio),
        ("trend", ind.trend),
        ("slope_change", ind.slope_change),
    ] {
        out.push_str(&format!(
            "  {}_thresholds: full={} none={}\n",
            name, ramp.full, ramp.none
        ));
    }
    out.push('\n');
    out.push_str("Anomaly:\n");
    out.push_str(&format!(
        "  distance_metric: {}\n",
        resolved.anomaly.distance_metric.as_str()
    ));
    out.push('\n');
    out.push_str("Degradation:\n");
    out.push_str(&format!("  alpha: {}\n", resolved.degradation.alpha));
    out.push_str(&format!("  beta: {}\n", resolved.degradation.beta));
    out.push_str(&format!(
        "  normalization: {}\n",
        resolved.degradation.normalization.as_str()
    ));
    out.push('\n');
    out.push_str("Combination:\n");
    out.push_str(&format!("  w1: {}\n", resolved.combination.w1));
    out.push_str(&format!("  w2: {}\n", resolved.combination.w2));
    out.push_str(&format!("  gamma: {}\n", resolved.combination.gamma));
    out.push('\n');
    out.push_str("Status thresholds:\n");
    out.push_str(&format!("  warning: {}\n", resolved.status.warning));
    out.push_str(&format!("  alert: {}\n", resolved.status.alert));
    out.push('\n');
    out.push_str(&format!(
        "Top: {}\n",
        resolved
            .top_n
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string())
    ));
    out
}
