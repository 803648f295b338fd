//! CLI entry point for the Peppermint measurement console.
//!
//! # Usage
//!
//! List run tables and inspect data:
//! ```bash
//! peppermint tables
//! peppermint tail sweep_1 -n 20
//! peppermint stats monitor ls336_A_temperature --window 128
//! ```
//!
//! Run the simulated pipeline end to end:
//! ```bash
//! peppermint demo --hold-secs 3
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peppermint::chart::{ChangeWatcher, LogChart, RenderLoop, StreamingChartSink};
use peppermint::config::ConsoleConfig;
use peppermint::core::SweepRange;
use peppermint::instrument::{MockSourceMeter, MockTemperatureController, SharedParameter};
use peppermint::measurement::{Measurement, Monitor, Setter, Sweep1D, SweepDriver};
use peppermint::sequence::ActionSequence;
use peppermint::state::ConsoleState;
use peppermint::stats::{RollingStatistics, DEFAULT_WINDOW};
use peppermint::store::TimeSeriesStore;
use peppermint::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "peppermint")]
#[command(about = "Laboratory measurement console", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/peppermint.toml")]
    config: PathBuf,

    /// Override the database path from the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for OutputFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Pretty => OutputFormat::Pretty,
            LogFormat::Compact => OutputFormat::Compact,
            LogFormat::Json => OutputFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List run tables in the store
    Tables,

    /// Print the last rows of a table as JSON
    Tail {
        table: String,

        #[arg(short = 'n', long, default_value_t = 10)]
        rows: usize,
    },

    /// Rolling statistics over one column
    Stats {
        table: String,
        column: String,

        #[arg(long, default_value_t = DEFAULT_WINDOW)]
        window: usize,

        /// Sample interval used for gradient and acceleration
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Run a simulated sequence with live chart logging
    Demo {
        /// How long to hold the final setpoint before stopping
        #[arg(long, default_value_t = 2)]
        hold_secs: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConsoleConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }

    let tracing_config = TracingConfig::from_console_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format.into());
    tracing_setup::init(tracing_config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Tables => list_tables(&config),
        Commands::Tail { table, rows } => tail(&config, &table, rows),
        Commands::Stats {
            table,
            column,
            window,
            interval_ms,
        } => stats(&config, &table, &column, window, Duration::from_millis(interval_ms)),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo { hold_secs } => run_demo(config, Duration::from_secs(hold_secs)),
    }
}

fn list_tables(config: &ConsoleConfig) -> Result<()> {
    let store = TimeSeriesStore::from_config(&config.storage)?;
    for table in store.get_tables()? {
        let columns = store.get_columns(&table)?;
        println!("{table}\t{}", columns.join(", "));
    }
    Ok(())
}

fn tail(config: &ConsoleConfig, table: &str, rows: usize) -> Result<()> {
    let store = TimeSeriesStore::from_config(&config.storage)?;
    let data = store.get_tail_values(table, rows)?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn stats(
    config: &ConsoleConfig,
    table: &str,
    column: &str,
    window: usize,
    interval: Duration,
) -> Result<()> {
    let store = TimeSeriesStore::from_config(&config.storage)?;
    let values = store
        .get_column_values(table, column)?
        .ok_or_else(|| anyhow!("table '{table}' has no column '{column}'"))?;

    let mut rolling = RollingStatistics::new(window, interval);
    rolling.extend(values.iter().filter_map(|v| v.as_f64()));
    println!("{}", serde_json::to_string_pretty(&rolling.snapshot())?);
    Ok(())
}

fn run_demo(config: ConsoleConfig, hold: Duration) -> Result<()> {
    info!("Starting {} demo", config.application.name);
    let state = Arc::new(ConsoleState::from_config(config.clone())?);
    let store = state.store();

    let smu = Arc::new(MockSourceMeter::new("k2450").with_point_interval(Duration::from_millis(50)));
    let ls = Arc::new(MockTemperatureController::new("ls336", 300.0));
    state.set_detected_resources(vec!["SIM::k2450::INSTR".into(), "SIM::ls336::INSTR".into()]);
    state.connect_instrument(smu.clone())?;
    state.connect_instrument(ls.clone())?;

    let temperature_a = ls.temperature("A").context("channel A")?;
    let temperature_b = ls.temperature("B").context("channel B")?;
    let setpoint = ls.setpoint(1).context("output 1")?;
    state.add_read_parameter(temperature_a.clone())?;
    state.add_read_parameter(temperature_b)?;
    state.add_write_parameter(setpoint.clone())?;

    let interval = config.logger.poll_interval();
    let monitored: Vec<SharedParameter> = state.read_parameters();
    let measurements: Vec<Box<dyn Measurement>> = vec![
        Box::new(
            Monitor::new(store.clone(), "monitor", monitored, Duration::from_secs(2))?
                .with_poll_interval(interval),
        ),
        Box::new(
            Sweep1D::new(
                store.clone(),
                "iv_sweep",
                SweepDriver::Buffered(smu.clone()),
                SweepRange::new(-1.0, 1.0, 41)?,
            )?
            .with_poll_interval(interval),
        ),
        Box::new(
            Sweep1D::new(
                store.clone(),
                "cooldown",
                SweepDriver::Stepped {
                    source: setpoint.clone(),
                    sense: vec![temperature_a as SharedParameter],
                    dwell: Duration::from_millis(100),
                },
                SweepRange::new(300.0, 280.0, 11)?,
            )?
            .with_poll_interval(interval),
        ),
        Box::new(Setter::new(store.clone(), "hold", setpoint, 4.2)?.with_poll_interval(interval)),
    ];
    let hold_index = measurements.len() - 1;

    let (mut render, render_handle) = RenderLoop::new();
    let watcher = ChangeWatcher::for_store(&store, &config.chart)?;
    let sinks = measurements
        .iter()
        .map(|m| {
            StreamingChartSink::attach(
                store.clone(),
                m.table(),
                LogChart::new(m.table()),
                &watcher,
                render_handle.clone(),
                &config.chart,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let sequence = ActionSequence::with_config(measurements, &config.sequence);
    sequence.start();

    let mut hold_started: Option<Instant> = None;
    while !sequence.wait_for_completion(Some(Duration::from_millis(100))) {
        render.run_pending();
        let (_, index, _) = sequence.status();
        if index == Some(hold_index) {
            let started = *hold_started.get_or_insert_with(Instant::now);
            if started.elapsed() >= hold {
                info!("Hold time elapsed, stopping sequence");
                sequence.stop()?;
            }
        }
    }

    for sink in &sinks {
        sink.refresh()?;
    }
    render.run_pending();

    let (completed, total) = sequence.get_progress();
    info!(completed, total, state = ?sequence.state(), "Demo finished");
    for table in store.get_tables()? {
        println!("{table}: {} rows", store.get_table_values(&table)?.len());
    }
    Ok(())
}
