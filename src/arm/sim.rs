// src/arm/sim.rs - In-process arm driver for dry runs and tests
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Duration};

use super::{ArmDriver, ArmError, ArmEvent, ArmState, StatusCode};

/// Every call the simulated controller received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ArmCommand {
    Connect(String),
    CleanWarn,
    CleanError,
    MotionEnable(bool),
    SetMode(u8),
    SetState(u8),
    Subscribe,
    Unsubscribe,
    MoveJoints { angles: [f64; 6], speed: f64, accel: f64 },
    MovePose { pose: [f64; 6], speed: f64, accel: f64 },
    Pause(f64),
    DigitalOutput { channel: u8, on: bool },
    Reset,
    Disconnect,
}

impl ArmCommand {
    pub fn is_move(&self) -> bool {
        matches!(self, ArmCommand::MoveJoints { .. } | ArmCommand::MovePose { .. })
    }
}

/// When a scripted fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Right after the n-th move command (1-based) completes.
    AfterMoves(usize),
    /// Right after the n-th pause command (1-based) completes.
    AfterPauses(usize),
}

#[derive(Debug, Clone)]
enum Scripted {
    Event { trigger: Trigger, event: ArmEvent },
    FailMove { index: usize, code: StatusCode },
}

#[derive(Debug)]
struct Shared {
    commands: Vec<ArmCommand>,
    connected: bool,
    state: ArmState,
    error_code: i32,
    events: Option<UnboundedSender<ArmEvent>>,
    script: Vec<Scripted>,
    moves: usize,
    pauses: usize,
}

impl Shared {
    /// Apply a notification to the controller model and forward it to the subscriber.
    fn push_event(&mut self, event: ArmEvent) {
        match event {
            ArmEvent::ErrorWarn { error_code, .. } => self.error_code = error_code,
            ArmEvent::StateChanged(state) => self.state = state,
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn fire(&mut self, fired: Trigger) {
        let due: Vec<ArmEvent> = self
            .script
            .iter()
            .filter_map(|s| match s {
                Scripted::Event { trigger, event } if *trigger == fired => Some(*event),
                _ => None,
            })
            .collect();
        for event in due {
            tracing::debug!("Simulated arm event {:?}", event);
            self.push_event(event);
        }
    }

    fn move_code(&self, index: usize) -> StatusCode {
        self.script
            .iter()
            .find_map(|s| match s {
                Scripted::FailMove { index: i, code } if *i == index => Some(*code),
                _ => None,
            })
            .unwrap_or(0)
    }
}

/// Simulated six-axis arm. Moves complete instantly; pauses sleep `seconds * time_scale`.
#[derive(Debug, Clone)]
pub struct SimulatedArm {
    shared: Arc<Mutex<Shared>>,
    time_scale: f64,
}

/// Inspection and injection handle that stays valid after the arm is boxed into an adapter.
#[derive(Debug, Clone)]
pub struct SimArmHandle {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedArm {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                commands: Vec::new(),
                connected: false,
                state: ArmState::READY,
                error_code: 0,
                events: None,
                script: Vec::new(),
                moves: 0,
                pauses: 0,
            })),
            time_scale: 0.0,
        }
    }

    /// Scale applied to pause durations. 0 makes every pause instant.
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale.max(0.0);
        self
    }

    /// Push `event` once `trigger` is reached.
    pub fn with_event(self, trigger: Trigger, event: ArmEvent) -> Self {
        lock(&self.shared).script.push(Scripted::Event { trigger, event });
        self
    }

    /// Make the n-th move command (1-based) return `code`.
    pub fn with_failed_move(self, index: usize, code: StatusCode) -> Self {
        lock(&self.shared).script.push(Scripted::FailMove { index, code });
        self
    }

    pub fn handle(&self) -> SimArmHandle {
        SimArmHandle { shared: self.shared.clone() }
    }

    fn record(&self, command: ArmCommand) -> MutexGuard<'_, Shared> {
        let mut shared = lock(&self.shared);
        shared.commands.push(command);
        shared
    }
}

impl Default for SimulatedArm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimArmHandle {
    pub fn commands(&self) -> Vec<ArmCommand> {
        lock(&self.shared).commands.clone()
    }

    pub fn count(&self, pred: impl Fn(&ArmCommand) -> bool) -> usize {
        lock(&self.shared).commands.iter().filter(|c| pred(c)).count()
    }

    pub fn moves(&self) -> Vec<ArmCommand> {
        lock(&self.shared)
            .commands
            .iter()
            .filter(|c| c.is_move())
            .cloned()
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.shared).events.is_some()
    }

    /// Push a notification as the driver would, from any task or thread.
    pub fn inject(&self, event: ArmEvent) {
        lock(&self.shared).push_event(event);
    }
}

fn lock(shared: &Arc<Mutex<Shared>>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ArmDriver for SimulatedArm {
    async fn connect(&mut self, address: &str) -> Result<(), ArmError> {
        if address.trim().is_empty() {
            return Err(ArmError::Connect {
                address: address.to_string(),
                reason: "empty address".to_string(),
            });
        }
        self.record(ArmCommand::Connect(address.to_string())).connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared).connected
    }

    fn state(&self) -> ArmState {
        lock(&self.shared).state
    }

    fn error_code(&self) -> i32 {
        lock(&self.shared).error_code
    }

    async fn clean_warn(&mut self) -> StatusCode {
        self.record(ArmCommand::CleanWarn);
        0
    }

    async fn clean_error(&mut self) -> StatusCode {
        let mut shared = self.record(ArmCommand::CleanError);
        shared.error_code = 0;
        0
    }

    async fn motion_enable(&mut self, enable: bool) -> StatusCode {
        self.record(ArmCommand::MotionEnable(enable));
        0
    }

    async fn set_mode(&mut self, mode: u8) -> StatusCode {
        self.record(ArmCommand::SetMode(mode));
        0
    }

    async fn set_state(&mut self, state: u8) -> StatusCode {
        let mut shared = self.record(ArmCommand::SetState(state));
        if state == 0 && shared.state != ArmState::STOPPED {
            shared.state = ArmState::READY;
        }
        0
    }

    fn subscribe(&mut self) -> UnboundedReceiver<ArmEvent> {
        let (tx, rx) = unbounded_channel();
        self.record(ArmCommand::Subscribe).events = Some(tx);
        rx
    }

    fn unsubscribe(&mut self) {
        self.record(ArmCommand::Unsubscribe).events = None;
    }

    async fn set_servo_angle(&mut self, angles: [f64; 6], speed: f64, accel: f64, _wait: bool) -> StatusCode {
        let mut shared = self.record(ArmCommand::MoveJoints { angles, speed, accel });
        shared.moves += 1;
        let index = shared.moves;
        let code = shared.move_code(index);
        shared.fire(Trigger::AfterMoves(index));
        code
    }

    async fn set_position(&mut self, pose: [f64; 6], speed: f64, accel: f64, _wait: bool) -> StatusCode {
        let mut shared = self.record(ArmCommand::MovePose { pose, speed, accel });
        shared.moves += 1;
        let index = shared.moves;
        let code = shared.move_code(index);
        shared.fire(Trigger::AfterMoves(index));
        code
    }

    async fn set_pause_time(&mut self, seconds: f64) -> StatusCode {
        self.record(ArmCommand::Pause(seconds));
        if self.time_scale > 0.0 && seconds > 0.0 {
            sleep(Duration::from_secs_f64(seconds * self.time_scale)).await;
        }
        let mut shared = lock(&self.shared);
        shared.pauses += 1;
        let index = shared.pauses;
        shared.fire(Trigger::AfterPauses(index));
        0
    }

    async fn set_digital_output(&mut self, channel: u8, on: bool) -> StatusCode {
        self.record(ArmCommand::DigitalOutput { channel, on });
        0
    }

    async fn reset(&mut self) -> StatusCode {
        self.record(ArmCommand::Reset);
        0
    }

    async fn disconnect(&mut self) {
        let mut shared = self.record(ArmCommand::Disconnect);
        shared.connected = false;
        shared.events = None;
    }
}
