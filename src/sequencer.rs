// src/sequencer.rs - Drives the arm and camera through a waypoint sequence
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::arm::{ArmError, MotionAdapter, MotionError, StatusCode};
use crate::camera::{CameraDevice, CameraError, CaptureAdapter};
use crate::config::Config;
use crate::fault::{FaultMonitor, LivenessFlag, TripReason};
use crate::run::{Run, RunFolderError};
use crate::sequence::{Sequence, Target, Waypoint};

/// Name of the report written into every run folder.
pub const REPORT_FILE: &str = "run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Init,
    Running,
    Completed,
    Aborted,
}

/// Why a run stopped before the end of its sequence.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AbortReason {
    #[error("motion command failed: {0}")]
    Motion(MotionError),
    #[error("{0}")]
    Fault(TripReason),
    #[error("liveness flag cleared")]
    LivenessLost,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Arm error: {0}")]
    Arm(#[from] ArmError),
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("Run folder error: {0}")]
    RunFolder(#[from] RunFolderError),
    #[error("Run aborted: {0}")]
    Aborted(AbortReason),
    #[error("This sequencer has already run")]
    AlreadyRan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Aborted,
}

/// Summary of one run, also written to the run folder as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub sequence: String,
    pub outcome: Outcome,
    pub abort_reason: Option<String>,
    #[serde(skip)]
    pub abort: Option<AbortReason>,
    pub run_folder: PathBuf,
    pub run_number: u32,
    pub pictures: u32,
    pub capture_failures: u32,
    pub waypoints_completed: usize,
    pub waypoints_total: usize,
    pub started_at: DateTime<Local>,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs)
    }

    /// Turn an aborted report into the error that stopped it.
    pub fn ensure_completed(&self) -> Result<(), RunError> {
        match &self.abort {
            Some(reason) => Err(RunError::Aborted(reason.clone())),
            None => Ok(()),
        }
    }

    pub async fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}

/// Devices acquired during INIT, released by teardown.
#[derive(Default)]
struct Resources {
    capture: Option<CaptureAdapter>,
    monitor: Option<FaultMonitor>,
    turntable: Option<u8>,
}

#[derive(Debug, Default)]
struct Progress {
    waypoints_completed: usize,
    capture_failures: u32,
}

/// One-shot controller for a capture run: INIT -> RUNNING -> COMPLETED | ABORTED.
pub struct Sequencer {
    motion: MotionAdapter,
    camera: Option<Box<dyn CameraDevice>>,
    config: Config,
    flag: LivenessFlag,
    state: SequencerState,
}

impl Sequencer {
    /// `motion` must already be connected.
    pub fn new(motion: MotionAdapter, camera: Box<dyn CameraDevice>, config: Config, flag: LivenessFlag) -> Self {
        Self {
            motion,
            camera: Some(camera),
            config,
            flag,
            state: SequencerState::Init,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn liveness(&self) -> &LivenessFlag {
        &self.flag
    }

    /// Execute the sequence once.
    ///
    /// Device bring-up failures are returned as errors. Once running, aborts are reported
    /// in the returned [`RunReport`]. Either way the camera, the fault subscription and the
    /// arm are released exactly once before this returns.
    pub async fn run(&mut self, sequence: &Sequence) -> Result<RunReport, RunError> {
        let device = self.camera.take().ok_or(RunError::AlreadyRan)?;
        let started = Instant::now();
        let mut res = Resources::default();
        self.state = SequencerState::Init;
        tracing::info!("Starting sequence '{}' ({} waypoints)", sequence.name, sequence.step_count());

        let mut run = match self.start(device, &mut res).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!("Initialization failed: {}", e);
                self.teardown(&mut res).await;
                self.state = SequencerState::Aborted;
                return Err(e);
            }
        };

        self.state = SequencerState::Running;
        let mut progress = Progress::default();
        let abort = self.walk(sequence, &mut res, &mut run, &mut progress).await.err();
        self.teardown(&mut res).await;

        self.state = match &abort {
            None => SequencerState::Completed,
            Some(_) => SequencerState::Aborted,
        };
        let report = RunReport {
            sequence: sequence.name.clone(),
            outcome: if abort.is_none() { Outcome::Completed } else { Outcome::Aborted },
            abort_reason: abort.as_ref().map(ToString::to_string),
            abort,
            run_folder: run.folder().to_path_buf(),
            run_number: run.number(),
            pictures: run.pictures_taken(),
            capture_failures: progress.capture_failures,
            waypoints_completed: progress.waypoints_completed,
            waypoints_total: sequence.step_count(),
            started_at: run.started_at(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        match &report.abort {
            None => tracing::info!(
                "Sequence completed: {} pictures in {}",
                report.pictures,
                run.folder().display()
            ),
            Some(reason) => tracing::error!(
                "Sequence aborted after {}/{} waypoints: {}",
                report.waypoints_completed,
                report.waypoints_total,
                reason
            ),
        }
        if let Err(e) = report.write_to(run.folder()).await {
            tracing::warn!("Failed to write run report: {}", e);
        }
        Ok(report)
    }

    async fn start(&mut self, device: Box<dyn CameraDevice>, res: &mut Resources) -> Result<Run, RunError> {
        self.motion.init().await?;
        let events = self.motion.subscribe();
        res.monitor = Some(FaultMonitor::arm(events, self.flag.clone()));
        res.capture = Some(CaptureAdapter::init(device, &self.config.camera)?);
        let camera = &self.config.camera;
        let run = Run::create(&camera.pictures_dir, &camera.folder_prefix, &camera.picture_prefix).await?;
        Ok(run)
    }

    async fn walk(
        &mut self,
        sequence: &Sequence,
        res: &mut Resources,
        run: &mut Run,
        progress: &mut Progress,
    ) -> Result<(), AbortReason> {
        self.checkpoint(res)?;
        if !self.motion.is_alive(&self.flag).await {
            self.flag.clear();
            return Err(AbortReason::LivenessLost);
        }

        if sequence.reset {
            self.reset(res).await?;
        }
        if let Some(home) = sequence.home {
            self.move_home(home, sequence, res).await?;
        }
        if let Some(turntable) = sequence.turntable {
            self.checkpoint(res)?;
            let code = self.motion.set_digital_output(turntable.channel, true).await;
            res.turntable = Some(turntable.channel);
            self.verify(code, "set_cgpio_digital", res).await?;
        }

        let total = sequence.step_count();
        for (index, waypoint) in sequence.steps().enumerate() {
            self.visit(index + 1, total, waypoint, sequence, res, run, progress).await?;
            progress.waypoints_completed += 1;
        }

        if let Some(channel) = res.turntable.take() {
            self.checkpoint(res)?;
            let code = self.motion.set_digital_output(channel, false).await;
            self.verify(code, "set_cgpio_digital", res).await?;
        }
        if let Some(home) = sequence.home {
            self.move_home(home, sequence, res).await?;
        }
        if sequence.reset {
            self.reset(res).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn visit(
        &mut self,
        step: usize,
        total: usize,
        waypoint: &Waypoint,
        sequence: &Sequence,
        res: &mut Resources,
        run: &mut Run,
        progress: &mut Progress,
    ) -> Result<(), AbortReason> {
        match &waypoint.label {
            Some(label) => tracing::info!("Waypoint {}/{}: {}", step, total, label),
            None => tracing::info!("Waypoint {}/{}", step, total),
        }

        self.checkpoint(res)?;
        let arm = self.motion.config();
        let (code, label) = match waypoint.target {
            Target::Joints(angles) => {
                let speed = waypoint.speed.or(sequence.angle_speed).unwrap_or(arm.angle_speed);
                let accel = waypoint.accel.or(sequence.angle_accel).unwrap_or(arm.angle_accel);
                (self.motion.move_joints(angles, speed, accel, true).await, "set_servo_angle")
            }
            Target::Pose(pose) => {
                let speed = waypoint.speed.or(sequence.tcp_speed).unwrap_or(arm.tcp_speed);
                let accel = waypoint.accel.or(sequence.tcp_accel).unwrap_or(arm.tcp_accel);
                (self.motion.move_pose(pose, speed, accel, true).await, "set_position")
            }
        };
        self.verify(code, label, res).await?;

        for _ in 0..waypoint.captures {
            self.pause(waypoint.settle, res).await?;
            self.checkpoint(res)?;
            let captured = match res.capture.as_mut() {
                Some(capture) => capture.capture(run),
                None => Err(CameraError::Closed),
            };
            if let Err(e) = captured {
                tracing::warn!("Capture at waypoint {} failed, skipping frame: {}", step, e);
                progress.capture_failures += 1;
            }
            self.pause(waypoint.post_pause, res).await?;
        }
        Ok(())
    }

    async fn move_home(&mut self, home: [f64; 6], sequence: &Sequence, res: &mut Resources) -> Result<(), AbortReason> {
        self.checkpoint(res)?;
        tracing::info!("Moving to home position");
        let arm = self.motion.config();
        let speed = sequence.angle_speed.unwrap_or(arm.angle_speed);
        let accel = sequence.angle_accel.unwrap_or(arm.angle_accel);
        let code = self.motion.move_joints(home, speed, accel, true).await;
        self.verify(code, "set_servo_angle", res).await
    }

    async fn reset(&mut self, res: &mut Resources) -> Result<(), AbortReason> {
        self.checkpoint(res)?;
        let code = self.motion.reset().await;
        self.verify(code, "reset", res).await
    }

    async fn pause(&mut self, seconds: f64, res: &mut Resources) -> Result<(), AbortReason> {
        self.checkpoint(res)?;
        let code = self.motion.pause(seconds).await;
        self.verify(code, "set_pause_time", res).await
    }

    /// Step boundary: drain fault notifications and honour the liveness flag.
    fn checkpoint(&mut self, res: &mut Resources) -> Result<(), AbortReason> {
        if let Some(monitor) = res.monitor.as_mut() {
            if let Some(reason) = monitor.poll() {
                self.motion.unsubscribe();
                return Err(AbortReason::Fault(reason));
            }
            if let Some(reason) = monitor.trip_reason() {
                return Err(AbortReason::Fault(reason));
            }
        }
        if !self.flag.is_alive() {
            tracing::warn!("Liveness flag cleared, stopping");
            return Err(AbortReason::LivenessLost);
        }
        Ok(())
    }

    /// Check a command result. A fault queued behind the failure is reported as the cause.
    async fn verify(&mut self, code: StatusCode, label: &'static str, res: &mut Resources) -> Result<(), AbortReason> {
        match self.motion.check(code, label, &self.flag).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(reason) = res.monitor.as_mut().and_then(FaultMonitor::poll) {
                    self.motion.unsubscribe();
                    return Err(AbortReason::Fault(reason));
                }
                Err(AbortReason::Motion(err))
            }
        }
    }

    async fn teardown(&mut self, res: &mut Resources) {
        if let Some(channel) = res.turntable.take() {
            let code = self.motion.set_digital_output(channel, false).await;
            if code != 0 {
                tracing::warn!("Failed to switch off turntable output {}, code={}", channel, code);
            }
        }
        if let Some(mut capture) = res.capture.take() {
            capture.close();
        }
        if let Some(mut monitor) = res.monitor.take() {
            monitor.disarm();
        }
        self.motion.release().await;
    }
}
