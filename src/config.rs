//! # Rig Configuration
//!
//! Settings for the arm connection, the camera and the external meshing pipeline.
//! Every section and field has a default, so an empty file is a valid configuration.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [arm]
//! ip = "192.168.1.152"
//! tcp_speed = 20.0
//! tcp_accel = 200.0
//!
//! [camera]
//! width = 1920
//! height = 1080
//!
//! [pipeline]
//! bin_path = "/opt/Meshroom-2023.3.0/aliceVision/bin"
//! fail_fast = false
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the arm, camera and meshing pipeline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub arm: ArmConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Arm connection and default motion parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArmConfig {
    /// Controller address. Falls back to the CLI argument or an interactive prompt.
    #[serde(default)]
    pub ip: Option<String>,
    /// Cartesian speed in mm/s.
    #[serde(default = "default_tcp_speed")]
    pub tcp_speed: f64,
    /// Cartesian acceleration in mm/s².
    #[serde(default = "default_tcp_accel")]
    pub tcp_accel: f64,
    /// Joint speed in °/s.
    #[serde(default = "default_angle_speed")]
    pub angle_speed: f64,
    /// Joint acceleration in °/s².
    #[serde(default = "default_angle_accel")]
    pub angle_accel: f64,
    #[serde(default = "default_init_settle_ms")]
    pub init_settle_ms: u64,
    #[serde(default = "default_busy_poll_retries")]
    pub busy_poll_retries: u32,
    #[serde(default = "default_busy_poll_ms")]
    pub busy_poll_ms: u64,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            ip: None,
            tcp_speed: default_tcp_speed(),
            tcp_accel: default_tcp_accel(),
            angle_speed: default_angle_speed(),
            angle_accel: default_angle_accel(),
            init_settle_ms: default_init_settle_ms(),
            busy_poll_retries: default_busy_poll_retries(),
            busy_poll_ms: default_busy_poll_ms(),
        }
    }
}

/// Camera device and image layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_id: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_pictures_dir")]
    pub pictures_dir: PathBuf,
    #[serde(default = "default_folder_prefix")]
    pub folder_prefix: String,
    #[serde(default = "default_picture_prefix")]
    pub picture_prefix: String,
    /// The sensor is mounted upside down on the rig.
    #[serde(default = "default_true")]
    pub flip_vertical: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            width: default_width(),
            height: default_height(),
            pictures_dir: default_pictures_dir(),
            folder_prefix: default_folder_prefix(),
            picture_prefix: default_picture_prefix(),
            flip_vertical: true,
        }
    }
}

/// External photogrammetry pipeline settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Folder holding the `aliceVision_*` executables.
    #[serde(default = "default_bin_path")]
    pub bin_path: PathBuf,
    #[serde(default = "default_builds_dir")]
    pub builds_dir: PathBuf,
    #[serde(default = "default_verbose_level")]
    pub verbose_level: String,
    #[serde(default = "default_feature_group")]
    pub feature_group: usize,
    #[serde(default = "default_matching_group")]
    pub matching_group: usize,
    #[serde(default = "default_depth_map_group")]
    pub depth_map_group: usize,
    #[serde(default = "default_downscale")]
    pub downscale: u32,
    #[serde(default = "default_max_input_points")]
    pub max_input_points: u64,
    #[serde(default = "default_max_points")]
    pub max_points: u64,
    /// Stop at the first stage invocation with a non-zero exit status.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bin_path: default_bin_path(),
            builds_dir: default_builds_dir(),
            verbose_level: default_verbose_level(),
            feature_group: default_feature_group(),
            matching_group: default_matching_group(),
            depth_map_group: default_depth_map_group(),
            downscale: default_downscale(),
            max_input_points: default_max_input_points(),
            max_points: default_max_points(),
            fail_fast: true,
        }
    }
}

impl Config {
    /// Reject values the rig cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid("camera width and height must be > 0".to_string()));
        }
        if self.camera.folder_prefix.is_empty() || self.camera.picture_prefix.is_empty() {
            return Err(ConfigError::Invalid("folder and picture prefixes must not be empty".to_string()));
        }
        let groups = [
            ("feature_group", self.pipeline.feature_group),
            ("matching_group", self.pipeline.matching_group),
            ("depth_map_group", self.pipeline.depth_map_group),
        ];
        for (name, size) in groups {
            if size == 0 {
                return Err(ConfigError::Invalid(format!("pipeline.{} must be > 0", name)));
            }
        }
        for (name, value) in [
            ("tcp_speed", self.arm.tcp_speed),
            ("tcp_accel", self.arm.tcp_accel),
            ("angle_speed", self.arm.angle_speed),
            ("angle_accel", self.arm.angle_accel),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("arm.{} must be a positive number", name)));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_tcp_speed() -> f64 { 100.0 }
fn default_tcp_accel() -> f64 { 2000.0 }
fn default_angle_speed() -> f64 { 20.0 }
fn default_angle_accel() -> f64 { 500.0 }
fn default_init_settle_ms() -> u64 { 1000 }
fn default_busy_poll_retries() -> u32 { 5 }
fn default_busy_poll_ms() -> u64 { 100 }
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_pictures_dir() -> PathBuf { PathBuf::from("pictures") }
fn default_folder_prefix() -> String { "run".to_string() }
fn default_picture_prefix() -> String { "picture".to_string() }
fn default_true() -> bool { true }
fn default_bin_path() -> PathBuf { PathBuf::from("aliceVision/bin") }
fn default_builds_dir() -> PathBuf { PathBuf::from("builds") }
fn default_verbose_level() -> String { "error".to_string() }
fn default_feature_group() -> usize { 40 }
fn default_matching_group() -> usize { 20 }
fn default_depth_map_group() -> usize { 6 }
fn default_downscale() -> u32 { 2 }
fn default_max_input_points() -> u64 { 50_000_000 }
fn default_max_points() -> u64 { 1_000_000 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
