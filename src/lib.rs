// src/lib.rs - Capture-triggered motion sequencer for a photogrammetry rig
pub mod arm;
pub mod camera;
pub mod config;
pub mod fault;
pub mod logging;
pub mod pipeline;
pub mod run;
pub mod sequence;
pub mod sequencer;

pub use arm::{ArmDriver, ArmError, ArmEvent, ArmState, MotionAdapter, MotionError};
pub use camera::{CameraDevice, CameraError, CaptureAdapter};
pub use config::{load_config, Config, ConfigError};
pub use fault::{FaultMonitor, LivenessFlag, TripReason};
pub use pipeline::{PipelineError, PipelineInvoker, PipelineReport, StageKind};
pub use run::{Run, RunFolderError};
pub use sequence::{Sequence, SequenceError, Target, Waypoint};
pub use sequencer::{AbortReason, Outcome, RunError, RunReport, Sequencer, SequencerState};
