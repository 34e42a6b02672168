//! splatmap CLI entrypoint.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::{ConfigError, ConfigLoader, EngineConfig};
use crate::core::camera::Projection;
use crate::fusion::{ChannelOrder, ColorImage, DepthImage, FusionOutcome, SensorFrame};
use crate::io::map_file::{read_map, MapFileError, MapSummary};
use crate::pipeline::SplatEngine;
use crate::synthetic::{create_synthetic_color, orbit_views, render_wall_depth};

/// splatmap command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "splatmap", version, about = "Point-splat map builder and inspector")]
struct CliArgs {
    /// Path to a YAML or TOML engine configuration.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevel>,
    /// Log format (text/json).
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuse a synthetic wall scene along an orbit and save the map.
    Synth {
        /// Output map file.
        #[arg(long, value_name = "FILE")]
        output: PathBuf,
        /// Number of frames along the orbit.
        #[arg(long, default_value_t = 30)]
        frames: usize,
        /// Depth image width in pixels.
        #[arg(long, default_value_t = 160)]
        width: usize,
        /// Depth image height in pixels.
        #[arg(long, default_value_t = 120)]
        height: usize,
        /// Camera distance from the wall in meters.
        #[arg(long, default_value_t = 1.5)]
        distance: f32,
        /// Built-in preset used when no --config is given.
        #[arg(long, value_enum, default_value_t = Preset::Sparse)]
        preset: Preset,
    },
    /// Print a summary of a saved map.
    Inspect {
        /// Map file to read.
        #[arg(value_name = "FILE")]
        input: PathBuf,
        /// Output format for the summary.
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum Preset {
    Dense,
    Sparse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    MapFile(#[from] MapFileError),
    #[error("failed to encode summary: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) => ExitCode::from(1),
            CliError::MapFile(_) | CliError::Encode(_) => ExitCode::from(2),
        }
    }
}

pub fn run() -> ExitCode {
    let start = Instant::now();
    let cli = CliArgs::parse();

    let level = cli
        .log_level
        .map(|l| l.as_str().to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    init_logger(&level, cli.log_format.unwrap_or_default());

    let result = match &cli.command {
        Command::Synth {
            output,
            frames,
            width,
            height,
            distance,
            preset,
        } => load_config(cli.config.as_deref(), *preset).and_then(|config| {
            run_synth(config, output, *frames, *width, *height, *distance)
        }),
        Command::Inspect { input, format } => {
            load_config(cli.config.as_deref(), Preset::Sparse).and_then(|config| run_inspect(&config, input, *format))
        }
    };

    match result {
        Ok(()) => {
            debug!("Finished in {} ms", start.elapsed().as_millis());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            err.exit_code()
        }
    }
}

fn load_config(path: Option<&Path>, preset: Preset) -> Result<EngineConfig, CliError> {
    let config = match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ConfigLoader::load(path)?
        }
        None => match preset {
            Preset::Dense => EngineConfig::dense(),
            Preset::Sparse => EngineConfig::sparse(),
        },
    };
    Ok(config)
}

fn run_synth(
    mut config: EngineConfig,
    output: &Path,
    frames: usize,
    width: usize,
    height: usize,
    distance: f32,
) -> Result<(), CliError> {
    // Frames are generated back to back, so wall-clock throttling would drop most of them
    config.fusion.min_interval_ms = 0;
    let engine = SplatEngine::new(config)?;

    let projection = Projection::from_fov(1.0, width as f32 / height.max(1) as f32);
    let color = create_synthetic_color(width, height);
    let mut fused = 0usize;

    for (i, view) in orbit_views(frames, distance, 0.8).iter().enumerate() {
        let depth = render_wall_depth(view, &projection, width, height);
        let frame = SensorFrame::new(DepthImage::meters(&depth, width, height), *view, projection)
            .with_color(ColorImage::new(&color, width, height, ChannelOrder::Rgb));

        match engine.process_depth_frame(&frame) {
            FusionOutcome::Fused(stats) => {
                fused += 1;
                debug!("Frame {}: {} inserted, {} updated", i, stats.inserted, stats.updated);
            }
            other => debug!("Frame {} not fused: {:?}", i, other),
        }
        if let Err(err) = engine.update_camera(*view, projection) {
            debug!("Frame {}: camera not updated: {}", i, err);
        }
    }

    info!("Fused {} of {} frames into {} splats", fused, frames, engine.splat_count());
    let summary = engine.save(output)?;
    print_text_summary(output, &summary);
    Ok(())
}

fn run_inspect(config: &EngineConfig, input: &Path, format: OutputFormat) -> Result<(), CliError> {
    let contents = read_map(input, config.map.max_splats)?;
    let summary = contents.summary();

    match format {
        OutputFormat::Json => {
            let payload = json!({
                "file": input.display().to_string(),
                "summary": summary,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        OutputFormat::Text => print_text_summary(input, &summary),
    }
    Ok(())
}

fn print_text_summary(path: &Path, summary: &MapSummary) {
    println!("Map: {}", path.display());
    println!("  splats:          {}", summary.splat_count);
    println!("  mean confidence: {:.3}", summary.mean_confidence);
    if let (Some(min), Some(max)) = (summary.bounds_min, summary.bounds_max) {
        println!(
            "  bounds:          [{:.3}, {:.3}, {:.3}] .. [{:.3}, {:.3}, {:.3}]",
            min[0], min[1], min[2], max[0], max[1], max[2]
        );
    }
    let t = &summary.anchor[12..15];
    println!("  anchor offset:   [{:.3}, {:.3}, {:.3}]", t[0], t[1], t[2]);
}

fn init_logger(level: &str, format: LogFormat) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stderr);
    builder.filter_level(log::LevelFilter::Info);
    builder.parse_filters(level);
    builder.format(move |buf, record| {
        use std::io::Write;
        let module = record.module_path().unwrap_or(record.target());
        match format {
            LogFormat::Json => {
                let payload = json!({
                    "timestamp": buf.timestamp_millis().to_string(),
                    "level": record.level().to_string(),
                    "target": module,
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", payload)
            }
            LogFormat::Text => {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    buf.timestamp_millis(),
                    record.level(),
                    module,
                    record.args()
                )
            }
        }
    });

    if let Err(err) = builder.try_init() {
        eprintln!("Failed to initialize logger: {}", err);
    }
}
