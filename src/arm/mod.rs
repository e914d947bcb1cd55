// src/arm/mod.rs - Arm driver boundary and motion command adapter
pub mod sim;

use std::io::{BufRead, Write};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, Duration};

use crate::config::ArmConfig;
use crate::fault::LivenessFlag;

/// Driver return code. Zero is success, anything else is a failure.
pub type StatusCode = i32;

/// Controller lifecycle state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArmState(pub u8);

impl ArmState {
    pub const MOVING: ArmState = ArmState(1);
    pub const READY: ArmState = ArmState(2);
    pub const PAUSED: ArmState = ArmState(3);
    pub const STOPPED: ArmState = ArmState(4);
    /// Transitional state; the controller usually leaves it within a few hundred ms.
    pub const BUSY: ArmState = ArmState(5);

    /// States below STOPPED accept motion.
    pub fn accepts_motion(self) -> bool {
        self < ArmState::STOPPED
    }
}

impl std::fmt::Display for ArmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification pushed by the driver from its own execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmEvent {
    ErrorWarn { error_code: i32, warn_code: i32 },
    StateChanged(ArmState),
}

/// The vendor driver, consumed as an opaque service.
#[async_trait]
pub trait ArmDriver: Send + Sync {
    async fn connect(&mut self, address: &str) -> Result<(), ArmError>;
    fn is_connected(&self) -> bool;
    fn state(&self) -> ArmState;
    fn error_code(&self) -> i32;
    async fn clean_warn(&mut self) -> StatusCode;
    async fn clean_error(&mut self) -> StatusCode;
    async fn motion_enable(&mut self, enable: bool) -> StatusCode;
    async fn set_mode(&mut self, mode: u8) -> StatusCode;
    async fn set_state(&mut self, state: u8) -> StatusCode;
    /// Register for error/warn and state notifications.
    fn subscribe(&mut self) -> UnboundedReceiver<ArmEvent>;
    fn unsubscribe(&mut self);
    async fn set_servo_angle(&mut self, angles: [f64; 6], speed: f64, accel: f64, wait: bool) -> StatusCode;
    async fn set_position(&mut self, pose: [f64; 6], speed: f64, accel: f64, wait: bool) -> StatusCode;
    async fn set_pause_time(&mut self, seconds: f64) -> StatusCode;
    async fn set_digital_output(&mut self, channel: u8, on: bool) -> StatusCode;
    async fn reset(&mut self) -> StatusCode;
    async fn disconnect(&mut self);
}

#[derive(Debug, Error)]
pub enum ArmError {
    #[error("Failed to connect to arm at {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("Arm initialization failed at {step}, code={code}")]
    Init { step: &'static str, code: StatusCode },
    #[error("No arm address given")]
    NoAddress,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed motion command or a lost liveness check, with the controller snapshot at that moment.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{label}, code={code}, connected={connected}, state={state}, error={error_code}")]
pub struct MotionError {
    pub label: &'static str,
    pub code: StatusCode,
    pub connected: bool,
    pub state: ArmState,
    pub error_code: i32,
}

/// Motion command adapter: driver bring-up, the move/pause primitives and status checks.
pub struct MotionAdapter {
    driver: Box<dyn ArmDriver>,
    config: ArmConfig,
    subscribed: bool,
    released: bool,
}

impl MotionAdapter {
    pub fn new(driver: Box<dyn ArmDriver>, config: ArmConfig) -> Self {
        Self {
            driver,
            config,
            subscribed: false,
            released: false,
        }
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    pub async fn connect(&mut self, address: &str) -> Result<(), ArmError> {
        tracing::info!("Connecting to arm at {}", address);
        self.driver.connect(address).await?;
        tracing::info!("Connected to arm");
        Ok(())
    }

    /// Clear faults, enable motion and put the controller in position mode, ready state.
    pub async fn init(&mut self) -> Result<(), ArmError> {
        tracing::info!("Initializing arm");
        if !self.driver.is_connected() {
            return Err(ArmError::Init { step: "connect", code: -1 });
        }
        let code = self.driver.clean_warn().await;
        Self::init_step("clean_warn", code)?;
        let code = self.driver.clean_error().await;
        Self::init_step("clean_error", code)?;
        let code = self.driver.motion_enable(true).await;
        Self::init_step("motion_enable", code)?;
        let code = self.driver.set_mode(0).await;
        Self::init_step("set_mode", code)?;
        let code = self.driver.set_state(0).await;
        Self::init_step("set_state", code)?;
        sleep(Duration::from_millis(self.config.init_settle_ms)).await;
        self.released = false;
        tracing::info!("Arm ready");
        Ok(())
    }

    fn init_step(step: &'static str, code: StatusCode) -> Result<(), ArmError> {
        if code != 0 {
            tracing::error!("Arm init step {} failed, code={}", step, code);
            return Err(ArmError::Init { step, code });
        }
        Ok(())
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<ArmEvent> {
        self.subscribed = true;
        self.driver.subscribe()
    }

    pub fn unsubscribe(&mut self) {
        if self.subscribed {
            self.driver.unsubscribe();
            self.subscribed = false;
        }
    }

    pub async fn move_joints(&mut self, angles: [f64; 6], speed: f64, accel: f64, wait: bool) -> StatusCode {
        tracing::debug!("set_servo_angle {:?} speed={} acc={}", angles, speed, accel);
        self.driver.set_servo_angle(angles, speed, accel, wait).await
    }

    pub async fn move_pose(&mut self, pose: [f64; 6], speed: f64, accel: f64, wait: bool) -> StatusCode {
        tracing::debug!("set_position {:?} speed={} acc={}", pose, speed, accel);
        self.driver.set_position(pose, speed, accel, wait).await
    }

    pub async fn pause(&mut self, seconds: f64) -> StatusCode {
        tracing::trace!("set_pause_time {}", seconds);
        self.driver.set_pause_time(seconds).await
    }

    pub async fn set_digital_output(&mut self, channel: u8, on: bool) -> StatusCode {
        tracing::info!("Digital output {} -> {}", channel, if on { "on" } else { "off" });
        self.driver.set_digital_output(channel, on).await
    }

    pub async fn reset(&mut self) -> StatusCode {
        tracing::info!("Resetting arm");
        self.driver.reset().await
    }

    /// Whether motion may continue: flag set, connected, no error, and not stopped.
    ///
    /// A BUSY state is polled a few times before deciding.
    pub async fn is_alive(&self, flag: &LivenessFlag) -> bool {
        if !(flag.is_alive() && self.driver.is_connected() && self.driver.error_code() == 0) {
            return false;
        }
        let mut retries = 0;
        while self.driver.state() == ArmState::BUSY && retries < self.config.busy_poll_retries {
            retries += 1;
            sleep(Duration::from_millis(self.config.busy_poll_ms)).await;
        }
        self.driver.state().accepts_motion()
    }

    /// Check a command result. A non-zero code or a dead arm clears the flag.
    pub async fn check(&self, code: StatusCode, label: &'static str, flag: &LivenessFlag) -> Result<(), MotionError> {
        if code == 0 && self.is_alive(flag).await {
            return Ok(());
        }
        flag.clear();
        let err = MotionError {
            label,
            code,
            connected: self.driver.is_connected(),
            state: self.driver.state(),
            error_code: self.driver.error_code(),
        };
        tracing::error!("{}", err);
        Err(err)
    }

    /// Drop the notification subscription and disconnect. Only the first call does anything.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.unsubscribe();
        self.driver.disconnect().await;
        tracing::info!("Arm released");
    }
}

/// Pick the arm address: explicit argument, then the config file, then ask on `input`.
pub fn resolve_address<R: BufRead, W: Write>(
    arg: Option<&str>,
    config: &ArmConfig,
    input: &mut R,
    output: &mut W,
) -> Result<String, ArmError> {
    if let Some(ip) = arg.map(str::trim).filter(|ip| !ip.is_empty()) {
        return Ok(ip.to_string());
    }
    if let Some(ip) = config.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) {
        return Ok(ip.to_string());
    }
    write!(output, "Please input the arm ip address: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    let ip = line.trim();
    if ip.is_empty() {
        return Err(ArmError::NoAddress);
    }
    Ok(ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_resolve_prefers_argument() {
        let config = ArmConfig { ip: Some("10.0.0.2".to_string()), ..ArmConfig::default() };
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let ip = resolve_address(Some("10.0.0.1"), &config, &mut input, &mut output).unwrap();
        assert_eq!(ip, "10.0.0.1");
        assert!(output.is_empty());
    }

    #[test]
    fn test_resolve_falls_back_to_config_then_prompt() {
        let config = ArmConfig { ip: Some("10.0.0.2".to_string()), ..ArmConfig::default() };
        let mut output = Vec::new();
        let ip = resolve_address(None, &config, &mut Cursor::new(Vec::new()), &mut output).unwrap();
        assert_eq!(ip, "10.0.0.2");

        let config = ArmConfig::default();
        let mut input = Cursor::new(b"192.168.1.152\n".to_vec());
        let ip = resolve_address(None, &config, &mut input, &mut output).unwrap();
        assert_eq!(ip, "192.168.1.152");
        assert!(String::from_utf8(output).unwrap().contains("ip address"));
    }

    #[test]
    fn test_resolve_empty_prompt_is_error() {
        let config = ArmConfig::default();
        let mut input = Cursor::new(b"\n".to_vec());
        let result = resolve_address(None, &config, &mut input, &mut Vec::new());
        assert!(matches!(result, Err(ArmError::NoAddress)));
    }

    #[test]
    fn test_state_accepts_motion() {
        assert!(ArmState::READY.accepts_motion());
        assert!(ArmState::PAUSED.accepts_motion());
        assert!(!ArmState::STOPPED.accepts_motion());
        assert!(!ArmState::BUSY.accepts_motion());
    }
}
