//! hfts-pipeline - batch entry point
//!
//! Wires configuration, the series database and the archive into the batch
//! reprocessor, plus record export and a synthetic-signal run of the live
//! pipeline for checking an installation end to end.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hfts_common::config::{resolve_root_folder, ChannelConfig, PipelineConfig};
use hfts_pipeline::pipeline::{Orchestrator, DATABASE_FILE};
use hfts_pipeline::reprocess::{BatchReprocessor, ReprocessPhases, ReprocessRequest};
use hfts_pipeline::series::SeriesStore;
use hfts_pipeline::solver::PropagationSolver;
use hfts_pipeline::synthetic::{SyntheticMinute, SyntheticStation};

/// Command-line arguments for hfts-pipeline
#[derive(Parser, Debug)]
#[command(name = "hfts-pipeline")]
#[command(about = "HF time-standard clock offset pipeline")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "HFTS_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the archive, series database and products
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rerun analysis and/or products over an archived range
    Reprocess {
        #[arg(long)]
        channel: String,
        /// RFC 3339 time or Unix seconds
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Version to write
        #[arg(long)]
        version: String,
        #[arg(long, value_enum, default_value = "both")]
        phases: PhaseArg,
        /// Owner token of an interrupted run to resume
        #[arg(long)]
        owner: Option<uuid::Uuid>,
        /// Seal the version when done
        #[arg(long)]
        seal: bool,
    },
    /// Write a version's records as JSON lines
    Export {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        version: String,
        /// Output file (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List a channel's series versions with grade statistics
    Status {
        #[arg(long)]
        channel: String,
    },
    /// Feed synthetic minutes through the live pipeline
    Simulate {
        #[arg(long)]
        channel: String,
        #[arg(long, default_value = "10.0")]
        frequency_mhz: f64,
        #[arg(long, default_value = "8000")]
        sample_rate: u32,
        /// RFC 3339 time or Unix seconds of the first minute
        #[arg(long)]
        start: String,
        #[arg(long, default_value = "10")]
        minutes: u32,
        /// Receiver clock offset at the first minute
        #[arg(long, default_value = "5.0")]
        offset_ms: f64,
        /// Offset change per minute
        #[arg(long, default_value = "0.0")]
        drift_ms: f64,
        #[arg(long, default_value = "1")]
        seed: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PhaseArg {
    Analysis,
    Products,
    Both,
}

impl From<PhaseArg> for ReprocessPhases {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Analysis => ReprocessPhases::Analysis,
            PhaseArg::Products => ReprocessPhases::Products,
            PhaseArg::Both => ReprocessPhases::Both,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    // Initialize tracing
    let default_filter = format!(
        "hfts_pipeline={level},hfts_common={level}",
        level = config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root = resolve_root_folder(args.root_folder.as_deref(), &config);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create root folder {}", root.display()))?;
    info!("Root folder: {}", root.display());

    match args.command {
        Command::Reprocess {
            channel,
            start,
            end,
            version,
            phases,
            owner,
            seal,
        } => {
            let store = open_store(&root).await?;
            let reprocessor = BatchReprocessor::new(config, &root, store)
                .context("Invalid configuration")?;
            let mut request =
                ReprocessRequest::new(&channel, parse_time(&start)?, parse_time(&end)?, &version);
            request.phases = phases.into();
            request.owner = owner;
            request.seal = seal;
            let summary = reprocessor
                .run(&request)
                .await
                .context("Reprocessing failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Export {
            channel,
            version,
            output,
        } => {
            let store = open_store(&root).await?;
            let count = match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let mut writer = std::io::BufWriter::new(file);
                    let count = store.export_jsonl(&channel, &version, &mut writer).await?;
                    writer.flush()?;
                    count
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    store.export_jsonl(&channel, &version, &mut lock).await?
                }
            };
            info!("Exported {} records for {}/{}", count, channel, version);
        }
        Command::Status { channel } => {
            let store = open_store(&root).await?;
            let staleness = config.series.staleness_window_s();
            for info in store.versions(&channel).await? {
                let series = store.load(&channel, &info.version, staleness).await?;
                let grades = series.grade_distribution(None);
                println!(
                    "{} {} measurements={} sealed={} A/B={:.1}% created={}",
                    info.channel,
                    info.version,
                    info.measurement_count,
                    info.sealed,
                    grades.fraction_ab() * 100.0,
                    info.created_at
                );
            }
        }
        Command::Simulate {
            channel,
            frequency_mhz,
            sample_rate,
            start,
            minutes,
            offset_ms,
            drift_ms,
            seed,
        } => {
            if config.channel(&channel).is_none() {
                config.channels.push(ChannelConfig {
                    name: channel.clone(),
                    frequency_mhz,
                    sample_rate,
                });
            }
            let channel_config = config
                .channel(&channel)
                .cloned()
                .context("Channel missing after insertion")?;
            let receiver = config.receiver.location().context("Invalid receiver location")?;
            let solver = PropagationSolver::new(
                receiver,
                channel_config.frequency_mhz,
                config.solver.clone(),
            );
            let stations: Vec<SyntheticStation> = channel_config
                .candidate_stations()
                .into_iter()
                .enumerate()
                .filter_map(|(i, station)| {
                    let solution = solver.solve(station).ok()?;
                    let amplitude = if i == 0 { 0.3 } else { 0.1 };
                    Some(SyntheticStation::new(
                        station,
                        solution.propagation_delay_ms,
                        amplitude,
                    ))
                })
                .collect();
            if stations.is_empty() {
                bail!("No station reachable from the receiver on {}", channel);
            }

            let first = hfts_common::time::minute_floor(parse_time(&start)? as f64);
            let orchestrator = Orchestrator::open(config, &root)
                .await
                .context("Failed to open pipeline")?;
            let handle = orchestrator.start_channel(&channel).await?;
            for k in 0..minutes as i64 {
                let mut minute = SyntheticMinute::new(
                    first + k * hfts_common::time::SECONDS_PER_MINUTE,
                    channel_config.sample_rate,
                    offset_ms + drift_ms * k as f64,
                )
                .with_seed(seed.wrapping_add(k as u64));
                for station in &stations {
                    minute = minute.with_station(station.clone());
                }
                handle.push_block(minute.minute_block())?;
            }
            let status = handle.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn open_store(root: &std::path::Path) -> Result<SeriesStore> {
    let db_path = root.join(DATABASE_FILE);
    info!("Database: {}", db_path.display());
    SeriesStore::open(&db_path)
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))
}

/// RFC 3339 or integer Unix seconds
fn parse_time(value: &str) -> Result<i64> {
    if let Ok(seconds) = value.parse::<i64>() {
        return Ok(seconds);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp())
        .with_context(|| format!("Invalid time {:?}", value))
}
