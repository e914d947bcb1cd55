// Integration tests for the motion command adapter and fault monitor

#[cfg(test)]
mod tests {
    use scan_rig::arm::sim::{ArmCommand, SimulatedArm};
    use scan_rig::arm::{ArmError, ArmEvent, ArmState, MotionAdapter};
    use scan_rig::config::ArmConfig;
    use scan_rig::fault::{FaultMonitor, LivenessFlag, MonitorState, TripReason};

    fn fast_config() -> ArmConfig {
        ArmConfig {
            init_settle_ms: 0,
            busy_poll_ms: 1,
            ..ArmConfig::default()
        }
    }

    async fn connected(arm: SimulatedArm) -> MotionAdapter {
        let mut motion = MotionAdapter::new(Box::new(arm), fast_config());
        motion.connect("192.168.1.152").await.unwrap();
        motion.init().await.unwrap();
        motion
    }

    #[tokio::test]
    async fn test_init_requires_connection() {
        let mut motion = MotionAdapter::new(Box::new(SimulatedArm::new()), fast_config());
        let err = motion.init().await.unwrap_err();
        assert!(matches!(err, ArmError::Init { step: "connect", .. }));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_address() {
        let mut motion = MotionAdapter::new(Box::new(SimulatedArm::new()), fast_config());
        assert!(matches!(motion.connect("  ").await, Err(ArmError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_check_passes_on_healthy_arm() {
        let arm = SimulatedArm::new();
        let handle = arm.handle();
        let mut motion = connected(arm).await;
        let flag = LivenessFlag::new();

        let code = motion.move_pose([87.0, 0.0, 166.5, 180.0, 0.0, 0.0], 100.0, 2000.0, true).await;
        assert!(motion.check(code, "set_position", &flag).await.is_ok());
        let code = motion.pause(2.0).await;
        assert!(motion.check(code, "set_pause_time", &flag).await.is_ok());
        assert!(flag.is_alive());
        assert_eq!(handle.count(|c| *c == ArmCommand::Pause(2.0)), 1);
    }

    #[tokio::test]
    async fn test_check_failure_clears_flag() {
        let arm = SimulatedArm::new().with_failed_move(1, 1);
        let mut motion = connected(arm).await;
        let flag = LivenessFlag::new();

        let code = motion.move_joints([0.0; 6], 20.0, 500.0, true).await;
        let err = motion.check(code, "set_servo_angle", &flag).await.unwrap_err();

        assert_eq!(err.code, 1);
        assert_eq!(err.state, ArmState::READY);
        assert!(!flag.is_alive());
        // Once cleared, even a successful code fails the check
        assert!(motion.check(0, "set_pause_time", &flag).await.is_err());
    }

    #[tokio::test]
    async fn test_busy_state_is_polled_then_rejected() {
        let arm = SimulatedArm::new();
        let handle = arm.handle();
        let motion = connected(arm).await;
        let flag = LivenessFlag::new();

        handle.inject(ArmEvent::StateChanged(ArmState::BUSY));
        assert!(!motion.is_alive(&flag).await);

        handle.inject(ArmEvent::StateChanged(ArmState::PAUSED));
        assert!(motion.is_alive(&flag).await);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let arm = SimulatedArm::new();
        let handle = arm.handle();
        let mut motion = connected(arm).await;
        let _events = motion.subscribe();

        motion.release().await;
        motion.release().await;

        assert_eq!(handle.count(|c| *c == ArmCommand::Disconnect), 1);
        assert_eq!(handle.count(|c| *c == ArmCommand::Unsubscribe), 1);
        assert!(!handle.is_subscribed());
    }

    #[tokio::test]
    async fn test_monitor_trips_once_on_fault() {
        let arm = SimulatedArm::new();
        let handle = arm.handle();
        let mut motion = connected(arm).await;
        let flag = LivenessFlag::new();
        let mut monitor = FaultMonitor::arm(motion.subscribe(), flag.clone());

        assert_eq!(monitor.poll(), None);
        handle.inject(ArmEvent::ErrorWarn { error_code: 22, warn_code: 0 });
        handle.inject(ArmEvent::StateChanged(ArmState::STOPPED));

        assert_eq!(monitor.poll(), Some(TripReason::Fault { error_code: 22 }));
        assert_eq!(monitor.state(), MonitorState::Tripped(TripReason::Fault { error_code: 22 }));
        assert!(!flag.is_alive());
        // Terminal: later notifications change nothing
        assert_eq!(monitor.poll(), None);
        assert_eq!(monitor.handle_event(ArmEvent::StateChanged(ArmState::STOPPED)), None);
        assert_eq!(monitor.trip_reason(), Some(TripReason::Fault { error_code: 22 }));
    }

    #[tokio::test]
    async fn test_monitor_events_from_another_task() {
        let arm = SimulatedArm::new();
        let handle = arm.handle();
        let mut motion = connected(arm).await;
        let flag = LivenessFlag::new();
        let mut monitor = FaultMonitor::arm(motion.subscribe(), flag.clone());

        tokio::spawn(async move {
            handle.inject(ArmEvent::StateChanged(ArmState::STOPPED));
        })
        .await
        .unwrap();

        assert_eq!(monitor.poll(), Some(TripReason::Stopped));
        assert!(monitor.is_tripped());
        assert!(!motion.is_alive(&flag).await);
    }
}
