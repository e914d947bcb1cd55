// src/fault.rs - Liveness flag and arm fault monitor
//! Arm faults arrive asynchronously from the driver. They are queued on a channel and
//! evaluated by the sequencer between steps, so a fault never interrupts a step halfway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::arm::{ArmEvent, ArmState};

/// Process-wide gate that stops further motion once cleared. Never set again within a run.
#[derive(Debug, Clone)]
pub struct LivenessFlag(Arc<AtomicBool>);

impl LivenessFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag. Returns `true` if this call did the clearing.
    pub fn clear(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl Default for LivenessFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the monitor tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    /// The controller reported a non-zero error code.
    Fault { error_code: i32 },
    /// The controller entered the stopped state.
    Stopped,
    /// The driver dropped the notification channel.
    Disconnected,
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::Fault { error_code } => write!(f, "arm fault, error code {}", error_code),
            TripReason::Stopped => write!(f, "arm stopped"),
            TripReason::Disconnected => write!(f, "arm notification channel closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Armed,
    Tripped(TripReason),
}

/// Two-state fault monitor: ARMED until the first unrecoverable notification, then TRIPPED for good.
#[derive(Debug)]
pub struct FaultMonitor {
    events: Option<UnboundedReceiver<ArmEvent>>,
    state: MonitorState,
    flag: LivenessFlag,
}

impl FaultMonitor {
    pub fn arm(events: UnboundedReceiver<ArmEvent>, flag: LivenessFlag) -> Self {
        Self {
            events: Some(events),
            state: MonitorState::Armed,
            flag,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_tripped(&self) -> bool {
        matches!(self.state, MonitorState::Tripped(_))
    }

    pub fn trip_reason(&self) -> Option<TripReason> {
        match self.state {
            MonitorState::Tripped(reason) => Some(reason),
            MonitorState::Armed => None,
        }
    }

    /// Drain queued notifications.
    ///
    /// Returns the reason only on the ARMED -> TRIPPED transition; the caller then
    /// unsubscribes from the driver. Later calls return `None`.
    pub fn poll(&mut self) -> Option<TripReason> {
        loop {
            let Some(events) = self.events.as_mut() else {
                return None;
            };
            match events.try_recv() {
                Ok(event) => {
                    if let Some(reason) = self.handle_event(event) {
                        return Some(reason);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    return self.trip(TripReason::Disconnected);
                }
            }
        }
    }

    /// Evaluate one notification. Returns the reason if it tripped the monitor.
    pub fn handle_event(&mut self, event: ArmEvent) -> Option<TripReason> {
        if self.is_tripped() {
            return None;
        }
        match event {
            ArmEvent::ErrorWarn { error_code, warn_code } if error_code != 0 => {
                tracing::error!("err={}, warn={}, quit", error_code, warn_code);
                self.trip(TripReason::Fault { error_code })
            }
            ArmEvent::ErrorWarn { warn_code, .. } => {
                if warn_code != 0 {
                    tracing::warn!("Arm warning code {}", warn_code);
                }
                None
            }
            ArmEvent::StateChanged(state) if state == ArmState::STOPPED => {
                tracing::error!("state={}, quit", state);
                self.trip(TripReason::Stopped)
            }
            ArmEvent::StateChanged(state) => {
                tracing::debug!("Arm state changed to {}", state);
                None
            }
        }
    }

    /// Stop listening without tripping. Used during teardown.
    pub fn disarm(&mut self) {
        if self.events.take().is_some() {
            tracing::debug!("Fault monitor unsubscribed");
        }
    }

    fn trip(&mut self, reason: TripReason) -> Option<TripReason> {
        self.state = MonitorState::Tripped(reason);
        self.events = None;
        self.flag.clear();
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_flag_clears_once() {
        let flag = LivenessFlag::new();
        let other = flag.clone();
        assert!(flag.is_alive());
        assert!(other.clear());
        assert!(!other.clear());
        assert!(!flag.is_alive());
    }

    #[test]
    fn test_warning_keeps_monitor_armed() {
        let (tx, rx) = unbounded_channel();
        let flag = LivenessFlag::new();
        let mut monitor = FaultMonitor::arm(rx, flag.clone());
        tx.send(ArmEvent::ErrorWarn { error_code: 0, warn_code: 11 }).unwrap();
        tx.send(ArmEvent::StateChanged(ArmState::MOVING)).unwrap();
        assert_eq!(monitor.poll(), None);
        assert_eq!(monitor.state(), MonitorState::Armed);
        assert!(flag.is_alive());
    }

    #[test]
    fn test_dropped_sender_trips() {
        let (tx, rx) = unbounded_channel::<ArmEvent>();
        let flag = LivenessFlag::new();
        let mut monitor = FaultMonitor::arm(rx, flag.clone());
        drop(tx);
        assert_eq!(monitor.poll(), Some(TripReason::Disconnected));
        assert!(!flag.is_alive());
    }
}
