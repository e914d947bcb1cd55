//! # Waypoint Sequences
//!
//! A sequence file lists the poses a scan visits, in order. Each `[[waypoint]]` names
//! exactly one target: `joints` (six joint angles in degrees) or `pose` (x, y, z in mm,
//! roll, pitch, yaw in degrees).
//!
//! ```toml
//! name = "turntable, upper ring"
//! home = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
//! settle = 2.0
//! post_pause = 1.0
//!
//! [[waypoint]]
//! pose = [87.0, 0.0, 166.5, 180.0, 0.0, 0.0]
//!
//! [[waypoint]]
//! joints = [0.0, -16.3, 7.8, 0.0, 40.5, 0.0]
//! settle = 5.0
//! captures = 3
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Waypoint {index}: {reason}")]
    Waypoint { index: usize, reason: String },
    #[error("Invalid sequence: {0}")]
    Invalid(String),
}

/// Where a waypoint sends the arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Joint angles J1..J6 in degrees.
    Joints([f64; 6]),
    /// TCP position (mm) and orientation (degrees).
    Pose([f64; 6]),
}

impl Target {
    pub fn values(&self) -> &[f64; 6] {
        match self {
            Target::Joints(v) | Target::Pose(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub target: Target,
    pub label: Option<String>,
    pub speed: Option<f64>,
    pub accel: Option<f64>,
    /// Seconds to wait after the move before each capture.
    pub settle: f64,
    /// Seconds to wait after each capture.
    pub post_pause: f64,
    /// Frames to take here. Zero makes this a transit move.
    pub captures: u32,
}

/// Digital output that drives the turntable while the waypoints run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Turntable {
    pub channel: u8,
}

/// A validated, immutable scan sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub name: String,
    pub home: Option<[f64; 6]>,
    /// Send the arm to its reset pose before the first and after the last move.
    pub reset: bool,
    pub repeat: u32,
    pub turntable: Option<Turntable>,
    pub tcp_speed: Option<f64>,
    pub tcp_accel: Option<f64>,
    pub angle_speed: Option<f64>,
    pub angle_accel: Option<f64>,
    pub waypoints: Vec<Waypoint>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceFile {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    home: Option<[f64; 6]>,
    #[serde(default)]
    reset: bool,
    #[serde(default = "default_repeat")]
    repeat: u32,
    #[serde(default)]
    turntable: Option<Turntable>,
    #[serde(default)]
    tcp_speed: Option<f64>,
    #[serde(default)]
    tcp_accel: Option<f64>,
    #[serde(default)]
    angle_speed: Option<f64>,
    #[serde(default)]
    angle_accel: Option<f64>,
    #[serde(default = "default_settle")]
    settle: f64,
    #[serde(default = "default_post_pause")]
    post_pause: f64,
    #[serde(default, rename = "waypoint")]
    waypoints: Vec<WaypointRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WaypointRecord {
    #[serde(default)]
    joints: Option<[f64; 6]>,
    #[serde(default)]
    pose: Option<[f64; 6]>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    accel: Option<f64>,
    #[serde(default)]
    settle: Option<f64>,
    #[serde(default)]
    post_pause: Option<f64>,
    #[serde(default = "default_captures")]
    captures: u32,
}

fn default_name() -> String { "unnamed".to_string() }
fn default_repeat() -> u32 { 1 }
fn default_settle() -> f64 { 1.0 }
fn default_post_pause() -> f64 { 1.0 }
fn default_captures() -> u32 { 1 }

impl Sequence {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SequenceError> {
        let path = path.as_ref();
        tracing::info!("Loading sequence from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, SequenceError> {
        let file: SequenceFile = toml::from_str(contents)?;
        Self::from_file(file)
    }

    fn from_file(file: SequenceFile) -> Result<Self, SequenceError> {
        if file.waypoints.is_empty() {
            return Err(SequenceError::Invalid("no waypoints".to_string()));
        }
        if file.repeat == 0 {
            return Err(SequenceError::Invalid("repeat must be at least 1".to_string()));
        }
        check_duration("settle", file.settle).map_err(SequenceError::Invalid)?;
        check_duration("post_pause", file.post_pause).map_err(SequenceError::Invalid)?;
        if let Some(home) = &file.home {
            check_vector(home).map_err(|reason| SequenceError::Invalid(format!("home: {}", reason)))?;
        }
        for (name, value) in [
            ("tcp_speed", file.tcp_speed),
            ("tcp_accel", file.tcp_accel),
            ("angle_speed", file.angle_speed),
            ("angle_accel", file.angle_accel),
        ] {
            if let Some(v) = value {
                check_rate(name, v).map_err(SequenceError::Invalid)?;
            }
        }

        let waypoints = file
            .waypoints
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                record
                    .into_waypoint(file.settle, file.post_pause)
                    .map_err(|reason| SequenceError::Waypoint { index: i + 1, reason })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: file.name,
            home: file.home,
            reset: file.reset,
            repeat: file.repeat,
            turntable: file.turntable,
            tcp_speed: file.tcp_speed,
            tcp_accel: file.tcp_accel,
            angle_speed: file.angle_speed,
            angle_accel: file.angle_accel,
            waypoints,
        })
    }

    /// Waypoints in visiting order, with `repeat` applied.
    pub fn steps(&self) -> impl Iterator<Item = &Waypoint> {
        (0..self.repeat).flat_map(move |_| self.waypoints.iter())
    }

    pub fn step_count(&self) -> usize {
        self.waypoints.len().saturating_mul(self.repeat as usize)
    }

    /// Frames a complete run produces. Saturates instead of wrapping on absurd files.
    pub fn total_captures(&self) -> u64 {
        self.waypoints
            .iter()
            .map(|w| u64::from(w.captures))
            .fold(0u64, u64::saturating_add)
            .saturating_mul(u64::from(self.repeat))
    }

    /// Lower bound on run time from the pauses alone, in seconds.
    pub fn pause_seconds(&self) -> f64 {
        self.waypoints
            .iter()
            .map(|w| (w.settle + w.post_pause) * w.captures as f64)
            .sum::<f64>()
            * self.repeat as f64
    }
}

impl WaypointRecord {
    fn into_waypoint(self, settle: f64, post_pause: f64) -> Result<Waypoint, String> {
        let target = match (self.joints, self.pose) {
            (Some(j), None) => Target::Joints(j),
            (None, Some(p)) => Target::Pose(p),
            (Some(_), Some(_)) => return Err("give either `joints` or `pose`, not both".to_string()),
            (None, None) => return Err("missing `joints` or `pose`".to_string()),
        };
        check_vector(target.values())?;
        if let Some(speed) = self.speed {
            check_rate("speed", speed)?;
        }
        if let Some(accel) = self.accel {
            check_rate("accel", accel)?;
        }
        let settle = self.settle.unwrap_or(settle);
        let post_pause = self.post_pause.unwrap_or(post_pause);
        check_duration("settle", settle)?;
        check_duration("post_pause", post_pause)?;
        Ok(Waypoint {
            target,
            label: self.label,
            speed: self.speed,
            accel: self.accel,
            settle,
            post_pause,
            captures: self.captures,
        })
    }
}

fn check_vector(values: &[f64; 6]) -> Result<(), String> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err("coordinates must be finite numbers".to_string())
    }
}

fn check_rate(name: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(format!("{} must be a positive number", name))
    }
}

fn check_duration(name: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(format!("{} must be zero or more seconds", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_flow_into_waypoints() {
        let seq = Sequence::from_toml_str(
            r#"
            settle = 2.0
            [[waypoint]]
            pose = [87.0, 0.0, 166.5, 180.0, 0.0, 0.0]
            [[waypoint]]
            joints = [0.0, -16.3, 7.8, 0.0, 40.5, 0.0]
            post_pause = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(seq.name, "unnamed");
        assert_eq!(seq.repeat, 1);
        assert_eq!(seq.waypoints[0].settle, 2.0);
        assert_eq!(seq.waypoints[0].post_pause, 1.0);
        assert_eq!(seq.waypoints[1].post_pause, 5.0);
        assert!(matches!(seq.waypoints[1].target, Target::Joints(_)));
    }

    #[test]
    fn test_steps_apply_repeat() {
        let seq = Sequence::from_toml_str(
            r#"
            repeat = 3
            [[waypoint]]
            joints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
            captures = 2
            [[waypoint]]
            joints = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0]
            captures = 0
            "#,
        )
        .unwrap();
        assert_eq!(seq.steps().count(), 6);
        assert_eq!(seq.step_count(), 6);
        assert_eq!(seq.total_captures(), 6);
    }

    #[test]
    fn test_capture_total_does_not_overflow() {
        let seq = Sequence::from_toml_str(
            r#"
            repeat = 4294967295
            [[waypoint]]
            joints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
            captures = 4294967295
            [[waypoint]]
            joints = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0]
            captures = 4294967295
            "#,
        )
        .unwrap();
        assert_eq!(seq.total_captures(), u64::MAX);
        assert_eq!(seq.step_count(), 2 * 4294967295);

        let doubled = Sequence::from_toml_str(
            "repeat = 2\n[[waypoint]]\njoints = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]\ncaptures = 4294967295",
        )
        .unwrap();
        assert_eq!(doubled.total_captures(), 2 * 4294967295);
    }
}
