// src/main.rs - scan-rig command line
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};

use scan_rig::arm::sim::SimulatedArm;
use scan_rig::arm::{resolve_address, MotionAdapter};
use scan_rig::camera::sim::SimulatedCamera;
use scan_rig::camera::CaptureAdapter;
use scan_rig::config::{self, Config};
use scan_rig::fault::LivenessFlag;
use scan_rig::logging;
use scan_rig::pipeline::{format_elapsed, PipelineInvoker};
use scan_rig::run::{self, Run};
use scan_rig::sequence::{Sequence, Target};
use scan_rig::sequencer::Sequencer;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_CONFIG: &str = "scan-rig.toml";

#[derive(Debug, Parser)]
#[command(name = "scan-rig", version, about = "Robot-arm photogrammetry capture and meshing")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Rig configuration file [default: scan-rig.toml if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk a waypoint sequence, capturing at each stop, then mesh the pictures
    Run {
        /// Sequence file (TOML)
        sequence: PathBuf,
        /// Arm address; falls back to [arm] ip, then a prompt
        ip: Option<String>,
        /// Use the in-process simulated arm and camera
        #[arg(long)]
        simulate: bool,
        /// Pause scale for the simulated arm (0 = no waiting)
        #[arg(long, default_value_t = 0.1)]
        time_scale: f64,
        /// Skip the meshing pipeline after capture
        #[arg(long)]
        no_mesh: bool,
    },
    /// Run the meshing pipeline over a pictures folder
    Mesh {
        /// Pictures folder [default: latest run folder]
        #[arg(long)]
        images: Option<PathBuf>,
    },
    /// Capture frames into a new run folder without moving the arm
    Capture {
        /// Frames to capture (at least 1)
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
        #[arg(long)]
        simulate: bool,
    },
    /// Validate a sequence file and print a summary
    Check {
        sequence: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { sequence, ip, simulate, time_scale, no_mesh } => {
            run_sequence(&config, &sequence, ip.as_deref(), simulate, time_scale, no_mesh).await
        }
        Command::Mesh { images } => mesh(&config, images).await,
        Command::Capture { count, simulate } => capture(&config, count, simulate).await,
        Command::Check { sequence } => check(&sequence),
    }
}

fn load(path: Option<&Path>) -> Result<Config, BoxError> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => {
            tracing::info!("No {} found, using defaults", DEFAULT_CONFIG);
            return Ok(Config::default());
        }
    };
    tracing::info!("Loading configuration from: {}", path.display());
    config::load_config(path).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", path.display(), e);
        Box::new(e) as BoxError
    })
}

fn no_hardware() -> BoxError {
    "no hardware backend is compiled into this build; pass --simulate".into()
}

async fn run_sequence(
    config: &Config,
    sequence_path: &Path,
    ip: Option<&str>,
    simulate: bool,
    time_scale: f64,
    no_mesh: bool,
) -> Result<(), BoxError> {
    let sequence = Sequence::load(sequence_path)?;
    if !simulate {
        return Err(no_hardware());
    }

    let address = {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        resolve_address(ip, &config.arm, &mut stdin.lock(), &mut stdout)?
    };

    let flag = LivenessFlag::new();
    let interrupt = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping at the next step");
            interrupt.clear();
        }
    });

    let driver = SimulatedArm::new().with_time_scale(time_scale);
    let mut motion = MotionAdapter::new(Box::new(driver), config.arm.clone());
    motion.connect(&address).await?;

    let mut sequencer = Sequencer::new(motion, Box::new(SimulatedCamera::new()), config.clone(), flag);
    let report = sequencer.run(&sequence).await?;
    tracing::info!(
        "{} pictures in {} ({} skipped), time elapsed: {}",
        report.pictures,
        report.run_folder.display(),
        report.capture_failures,
        format_elapsed(report.elapsed())
    );
    report.ensure_completed()?;

    if no_mesh {
        return Ok(());
    }
    if report.pictures == 0 {
        tracing::warn!("No pictures captured, skipping meshing");
        return Ok(());
    }
    if !config.pipeline.bin_path.is_dir() {
        tracing::warn!(
            "AliceVision binaries not found at {}, skipping meshing",
            config.pipeline.bin_path.display()
        );
        return Ok(());
    }
    mesh(config, Some(report.run_folder)).await
}

async fn mesh(config: &Config, images: Option<PathBuf>) -> Result<(), BoxError> {
    let images = match images {
        Some(images) => images,
        None => run::latest_run_folder(&config.camera.pictures_dir, &config.camera.folder_prefix)
            .await?
            .ok_or_else(|| format!("no run folders under {}", config.camera.pictures_dir.display()))?,
    };
    let invoker = PipelineInvoker::new(config.pipeline.clone(), &config.camera.folder_prefix);
    let report = invoker.run(&images).await?;
    if report.succeeded() {
        tracing::info!("Mesh written to {}", report.mesh_path().display());
    } else {
        tracing::warn!(
            "{} of {} invocations failed; check {}",
            report.failures.len(),
            report.invocations,
            report.build_dir.display()
        );
    }
    Ok(())
}

async fn capture(config: &Config, count: u32, simulate: bool) -> Result<(), BoxError> {
    if count == 0 {
        return Err("--count must be at least 1".into());
    }
    if !simulate {
        return Err(no_hardware());
    }
    let mut camera = CaptureAdapter::init(Box::new(SimulatedCamera::new()), &config.camera)?;
    let camera_cfg = &config.camera;
    let mut run = Run::create(&camera_cfg.pictures_dir, &camera_cfg.folder_prefix, &camera_cfg.picture_prefix).await?;
    for _ in 0..count {
        camera.capture(&mut run)?;
    }
    camera.close();
    tracing::info!("{} pictures in {}", run.pictures_taken(), run.folder().display());
    Ok(())
}

fn check(path: &Path) -> Result<(), BoxError> {
    let sequence = Sequence::load(path)?;
    println!("Sequence '{}'", sequence.name);
    println!(
        "  {} waypoints x {} = {} stops, {} pictures, at least {:.1}s of pauses",
        sequence.waypoints.len(),
        sequence.repeat,
        sequence.step_count(),
        sequence.total_captures(),
        sequence.pause_seconds()
    );
    if let Some(home) = sequence.home {
        println!("  home {:?}", home);
    }
    if let Some(turntable) = sequence.turntable {
        println!("  turntable on digital output {}", turntable.channel);
    }
    for (i, waypoint) in sequence.waypoints.iter().enumerate() {
        let (kind, values) = match &waypoint.target {
            Target::Joints(v) => ("joints", v),
            Target::Pose(v) => ("pose", v),
        };
        println!(
            "  {:>3}. {:<6} {:?} captures={} settle={}s post={}s{}",
            i + 1,
            kind,
            values,
            waypoint.captures,
            waypoint.settle,
            waypoint.post_pause,
            waypoint.label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default()
        );
    }
    Ok(())
}
