// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{error::Error, fs::File, path::PathBuf, sync::Arc, time::Duration};

use clap::{crate_version, Parser, Subcommand};
use duration_string::DurationString;
use sonisync::{
    config::{dispatcher, SonificationConfig, SyncConfig, TransportConfig},
    sync::process::{worker::start_from_epoch, worker_main},
    Replayer, StreamSpec, Table,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A real-time multi-stream synchronizer for data sonification."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the configured player or synchronizer.
    Listen {
        /// The path to the run configuration.
        config: PathBuf,
    },
    /// Replays recorded CSV data through the configured sonification.
    Replay {
        /// The CSV file to replay.
        csv: PathBuf,
        /// The run configuration providing the sonification and transport.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Static frame rate of the data. Rows are timed by the time label column if unset.
        #[arg(short, long)]
        fps: Option<f64>,
        /// The column holding row timestamps in seconds.
        #[arg(short, long, default_value = "timestamp")]
        time_label: String,
        /// The playback rate. Negative rates play backwards from the end.
        #[arg(short, long, default_value_t = 1.0, allow_hyphen_values = true)]
        rate: f64,
    },
    /// Renders recorded CSV data into an offline score, written as JSON.
    Export {
        /// The CSV file to render.
        csv: PathBuf,
        /// Where to write the score.
        out: PathBuf,
        /// The run configuration providing the sonification.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Static frame rate of the data. Rows are timed by the time label column if unset.
        #[arg(short, long)]
        fps: Option<f64>,
        /// The column holding row timestamps in seconds.
        #[arg(short, long, default_value = "timestamp")]
        time_label: String,
        /// The rendering rate, must be positive.
        #[arg(short, long, default_value_t = 1.0)]
        rate: f64,
        /// Time between the last row and the closing command.
        #[arg(short, long, default_value = "100ms")]
        end_delay: String,
    },
    /// Runs one process-isolated stream. Started by the process synchronizer.
    #[command(hide = true)]
    StreamWorker {
        /// The stream spec as JSON.
        #[arg(long)]
        spec: String,
        /// The shared block file.
        #[arg(long)]
        block: PathBuf,
        /// The run start in seconds since the unix epoch.
        #[arg(long)]
        start: f64,
    },
}

/// Logs go to stderr: stdout of a stream worker is its control channel.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// Loads a run configuration, or the defaults: a log transport and a field mapping.
fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(SyncConfig::load(path)?),
        None => Ok(serde_json::from_str::<SyncConfig>("{}")?),
    }
}

async fn elapse(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn listen(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = SyncConfig::load(&path)?;
    let duration = config.duration()?;
    let runner = Arc::new(config.build()?);

    runner.listen()?;
    let ended = {
        let runner = runner.clone();
        tokio::task::spawn_blocking(move || runner.wait())
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = elapse(duration) => info!("Run duration elapsed"),
        _ = ended => info!("Run ended"),
    }

    match runner.close() {
        Ok(()) | Err(sonisync::Error::NotListening) => {}
        Err(e) => return Err(e.into()),
    }
    runner.wait();
    let stats = runner.stats();
    println!("Dispatched {} records, {} late.", stats.ticks(), stats.late());

    if let Some(e) = runner.take_failure() {
        return Err(e.into());
    }
    Ok(())
}

async fn replay(
    csv: PathBuf,
    config: Option<PathBuf>,
    fps: Option<f64>,
    time_label: String,
    rate: f64,
) -> Result<(), Box<dyn Error>> {
    let table = Table::from_csv(&csv)?;
    let last = table.len().saturating_sub(1);
    let replayer = Arc::new(Replayer::new(
        load_config(config.as_ref())?.dispatcher()?,
    ));
    replayer.load(table, fps, &time_label)?;
    replayer.set_rate(rate)?;
    if rate < 0.0 {
        replayer.seek(last)?;
    }

    replayer.play()?;
    let ended = {
        let replayer = replayer.clone();
        tokio::task::spawn_blocking(move || replayer.wait())
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = ended => info!("Replay ended"),
    }
    if let Err(e) = replayer.pause() {
        info!(err = e.to_string(), "Replay already over");
    }

    if let Some(e) = replayer.take_failure() {
        return Err(e.into());
    }
    println!("Replayed up to row {}.", replayer.position());
    Ok(())
}

fn export(
    csv: PathBuf,
    out: PathBuf,
    config: Option<PathBuf>,
    fps: Option<f64>,
    time_label: String,
    rate: f64,
    end_delay: String,
) -> Result<(), Box<dyn Error>> {
    let end_delay: Duration = DurationString::from_string(end_delay)?.into();
    let run_config = load_config(config.as_ref())?;
    // Nothing is sent while exporting.
    let replayer = Replayer::new(dispatcher(
        &SonificationConfig::default(),
        &TransportConfig::Log,
    )?);
    replayer.load(Table::from_csv(&csv)?, fps, &time_label)?;

    let mut sonification = run_config.sonification().build();
    let score = replayer.export(&mut sonification, rate, end_delay)?;
    serde_json::to_writer_pretty(File::create(&out)?, &score)?;
    println!("Wrote {} bundles to {}.", score.len(), out.display());
    Ok(())
}

fn stream_worker(spec: &str, block: PathBuf, start: f64) -> Result<(), Box<dyn Error>> {
    let spec: StreamSpec = serde_json::from_str(spec)?;
    worker_main(&spec, &block, start_from_epoch(start)?)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen { config } => listen(config).await?,
        Commands::Replay {
            csv,
            config,
            fps,
            time_label,
            rate,
        } => replay(csv, config, fps, time_label, rate).await?,
        Commands::Export {
            csv,
            out,
            config,
            fps,
            time_label,
            rate,
            end_delay,
        } => export(csv, out, config, fps, time_label, rate, end_delay)?,
        Commands::StreamWorker { spec, block, start } => stream_worker(&spec, block, start)?,
    }

    Ok(())
}
