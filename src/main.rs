//! Rectiflow: image sequence in, surface-rectified image sequence out

use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use rectiflow::capture::ImageSequenceSource;
use rectiflow::detect::ReplayDetector;
use rectiflow::pipeline::ImageSequenceSink;
use rectiflow::{Config, Pipeline};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of input frames (overrides capture.input_dir)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory rectified frames are written to (overrides output.output_dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Recorded marker detections, JSON lines (overrides detector.replay)
    #[arg(short, long)]
    markers: Option<PathBuf>,

    /// Process frames as fast as they load instead of at capture.fps
    #[arg(long)]
    no_pace: bool,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rectiflow=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    info!("Rectiflow launching...");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.capture.input_dir = input;
    }
    if let Some(output) = args.output {
        config.output.output_dir = output;
    }
    if let Some(markers) = args.markers {
        config.detector.replay = Some(markers);
    }
    if args.no_pace {
        config.capture.pace = false;
    }

    let replay = config
        .detector
        .replay
        .as_deref()
        .ok_or_else(|| eyre!("No marker detector configured, set detector.replay or --markers"))?;

    let source = ImageSequenceSource::new(&config.capture)?;
    let detector = ReplayDetector::open(replay)?;
    info!(
        dictionary = %config.calibration.dictionary,
        marker_size = config.calibration.marker_size,
        lens_correction = config.calibration.lens_model().is_some(),
        "Calibration loaded"
    );
    let sink = ImageSequenceSink::new(&config.output)?;

    let pipeline = Pipeline::spawn(&config, source, detector, sink)?;

    let coordinator = pipeline.coordinator().clone();
    if let Err(e) = ctrlc::set_handler(move || coordinator.request_stop()) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }

    let errors = pipeline.join();
    if let Some(first) = errors.into_iter().next() {
        error!("Rectiflow stopped with errors");
        return Err(first);
    }

    info!("Rectiflow shutting down");
    Ok(())
}
