//! Command-line entry point for the streampix acquisition pipeline.

use clap::{Parser, Subcommand};
use log::info;
use streampix_core::{AcquisitionConfig, CalibrationTable, RunMode};
use streampix_io::{
    replay_file, replay_folder, FolderReplay, LiveSession, MappedCapture, Pipeline, SessionExit,
};
use streampix_tpx::{scan_chunks, PacketKind, Tpx3Packet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] streampix_core::Error),

    #[error("session error: {0}")]
    Session(#[from] streampix_io::Error),
}

impl CliError {
    /// Exit code per the session contract.
    fn code(&self) -> i32 {
        match self {
            Self::Session(err) => SessionExit::from_error(err).code(),
            Self::Core(_) | Self::Settings(_) => SessionExit::ConfigError.code(),
            Self::Io(_) => SessionExit::MalformedFatal.code(),
        }
    }
}

/// Streaming coincidence acquisition for TPX3 detectors.
#[derive(Parser)]
#[command(name = "streampix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Shared acquisition options.
#[derive(clap::Args)]
struct AcquisitionArgs {
    /// Settings file (JSON) overriding the built-in defaults
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Calibration table (JSON); defaults to $STREAMPIX_CALIBRATION
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Run mode: 0 focus, 1 coincidence, 2 spectral image
    #[arg(long)]
    mode: Option<u16>,

    /// Coincidence delay in nanoseconds
    #[arg(long)]
    delay_ns: Option<i64>,

    /// Coincidence width in nanoseconds
    #[arg(long)]
    width_ns: Option<i64>,

    /// Photon correlation half-window in nanoseconds
    #[arg(long)]
    g2_width_ns: Option<i64>,
}

impl AcquisitionArgs {
    fn build(&self) -> Result<(AcquisitionConfig, CalibrationTable)> {
        let mut config = match &self.settings {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => AcquisitionConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = RunMode::from_u16(mode)?;
        }
        if let Some(delay_ns) = self.delay_ns {
            config.delay_ps = delay_ns * 1_000;
        }
        if let Some(width_ns) = self.width_ns {
            config.width_ps = width_ns * 1_000;
        }
        if let Some(g2_width_ns) = self.g2_width_ns {
            config.g2_width_ps = Some(g2_width_ns * 1_000);
        }
        config.validate()?;

        let calibration_path = self
            .calibration
            .clone()
            .or_else(|| std::env::var("STREAMPIX_CALIBRATION").ok().map(PathBuf::from));
        let calibration = match calibration_path {
            Some(path) => CalibrationTable::load(path)?,
            None => CalibrationTable::default(),
        };
        Ok((config, calibration))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a live acquisition session against the detector
    Serve {
        /// Detector host:port; defaults to $STREAMPIX_UPSTREAM
        #[arg(long)]
        upstream: Option<String>,

        /// Listen host:port for one downstream client; defaults to
        /// $STREAMPIX_LISTEN, no client when unset
        #[arg(long)]
        listen: Option<String>,

        /// Directory for analysis artifacts
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        acquisition: AcquisitionArgs,
    },

    /// Stream a raw capture file or folder through the pipeline
    Replay {
        /// Capture file (.tpx3) or folder of sequence captures
        input: PathBuf,

        /// Output directory for analysis artifacts
        #[arg(short, long)]
        output: PathBuf,

        /// Synthesize a TDC1 rising trigger between folder files at
        /// this interval (milliseconds)
        #[arg(long)]
        synthetic_tdc_ms: Option<u64>,

        #[command(flatten)]
        acquisition: AcquisitionArgs,
    },

    /// Show packet statistics of a raw capture
    Info {
        /// Capture file (.tpx3)
        input: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(err.code());
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve {
            upstream,
            listen,
            output,
            acquisition,
        } => {
            let upstream = upstream
                .or_else(|| std::env::var("STREAMPIX_UPSTREAM").ok())
                .ok_or_else(|| {
                    streampix_core::Error::ConfigError(
                        "no upstream address (--upstream or $STREAMPIX_UPSTREAM)".into(),
                    )
                })?;
            let listen = listen.or_else(|| std::env::var("STREAMPIX_LISTEN").ok());

            let (config, calibration) = acquisition.build()?;
            let mut session = LiveSession::new(config, calibration);
            if let Some(dir) = output {
                session = session.with_output_dir(dir);
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let report = session.run(listen.as_deref(), upstream, shutdown)?;
            println!("{}", report.summary());
        }

        Commands::Replay {
            input,
            output,
            synthetic_tdc_ms,
            acquisition,
        } => {
            let (config, calibration) = acquisition.build()?;
            let mut pipeline = Pipeline::new(config, calibration)?;

            let report = if input.is_dir() {
                let mut replay = FolderReplay::open(&input)?;
                if let Some(ms) = synthetic_tdc_ms {
                    replay = replay.with_synthetic_tdc(ms * 1_000_000_000);
                }
                info!("replaying {} capture files", replay.file_count());
                replay_folder(&mut pipeline, &mut replay, &output)?
            } else {
                replay_file(&mut pipeline, &input, &output)?
            };
            println!("{}", report.summary());
        }

        Commands::Info { input } => {
            let capture = MappedCapture::open(&input)?;
            print_info(capture.as_bytes());
        }
    }
    Ok(())
}

fn print_info(data: &[u8]) {
    let spans = scan_chunks(data);
    let mut per_chip = [0usize; 4];
    let mut electrons = 0usize;
    let mut tdcs = 0usize;
    let mut timers = 0usize;
    let mut other = 0usize;

    for span in &spans {
        per_chip[(span.chip & 0x3) as usize] += span.payload_bytes / 8;
        let payload = &data[span.payload_start..span.payload_start + span.payload_bytes];
        for bytes in payload.chunks_exact(8) {
            let packet = Tpx3Packet::from_wire(bytes.try_into().unwrap());
            match packet.kind() {
                PacketKind::Electron => electrons += 1,
                PacketKind::Tdc => tdcs += 1,
                PacketKind::GlobalTime => timers += 1,
                PacketKind::Ignored(_) => other += 1,
            }
        }
    }

    println!("capture: {} bytes, {} chunks", data.len(), spans.len());
    println!(
        "packets: {} electrons, {} tdcs, {} timers, {} other",
        electrons, tdcs, timers, other
    );
    for (chip, count) in per_chip.iter().enumerate() {
        if *count > 0 {
            println!("chip {chip}: {count} packets");
        }
    }
}
