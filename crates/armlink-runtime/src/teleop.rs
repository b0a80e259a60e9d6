//! [`Controller`] – leader/follower teleoperation loop.
//!
//! Each tick reads the leader arm, optionally mirrors the pose, writes it to
//! the follower and publishes a [`State`] snapshot. Observers follow along
//! through two channels that can never stall the loop:
//!
//! - [`Controller::states`] – a single-slot [`Mailbox`] holding the latest
//!   snapshot.
//! - [`Controller::logs`] – a bounded [`LogStream`] of operator log lines that
//!   drops lines when nobody drains it.
//!
//! Read and write failures are logged and the loop carries on; the next tick
//! is the retry.
//!
//! # Lifecycle
//!
//! `Created → Running → Stopped`, with [`Controller::close`] terminal from
//! any state. A second [`Controller::start`] while running fails with
//! [`ArmError::AlreadyRunning`] and leaves the running loop untouched.
//!
//! # Example
//!
//! ```rust,no_run
//! use armlink_hal::sim::SimConnector;
//! use armlink_runtime::teleop::{Controller, TeleopConfig};
//!
//! # async fn run(config: TeleopConfig, connector: SimConnector) -> Result<(), armlink_types::ArmError> {
//! let controller = Controller::new(config, &connector)?;
//! controller
//!     .start(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! controller.close()?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use armlink_hal::{Arm, BusConnector, Calibration};
use armlink_middleware::{LogStream, Mailbox};
use armlink_types::{ArmError, MotorName, Positions, State};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Loop rate used when the configured rate is zero or negative.
pub const DEFAULT_HZ: u32 = 60;

/// Joints whose sign flips when the follower mirrors the leader.
const MIRRORED_MOTORS: [MotorName; 2] = [MotorName::ShoulderPan, MotorName::WristRoll];

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to build a [`Controller`] from two serial ports.
#[derive(Debug, Clone)]
pub struct TeleopConfig {
    pub leader_port: String,
    pub follower_port: String,
    pub leader_calibration: Calibration,
    pub follower_calibration: Calibration,
    /// Loop rate in Hz; non-positive values select [`DEFAULT_HZ`].
    pub hz: i64,
    /// Mirror the leader pose left/right on the follower.
    pub mirror: bool,
}

/// Shortest tick period; rates above 1 MHz run at this period.
const MIN_PERIOD: Duration = Duration::from_micros(1);

fn effective_hz(hz: i64) -> u32 {
    if hz <= 0 {
        DEFAULT_HZ
    } else {
        u32::try_from(hz).unwrap_or(u32::MAX)
    }
}

fn tick_period(hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(hz.max(1))).max(MIN_PERIOD)
}

/// Flip the sign of the shoulder pan and wrist roll joints.
///
/// Every other joint passes through unchanged. The input is not modified.
pub fn mirror_positions(positions: &Positions) -> Positions {
    positions
        .iter()
        .map(|(&motor, &value)| {
            if MIRRORED_MOTORS.contains(&motor) {
                (motor, -value)
            } else {
                (motor, value)
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a follower arm from a leader arm at a fixed rate.
///
/// All methods take `&self`; share the controller through an `Arc` to start
/// it on one task and observe it from others.
pub struct Controller {
    leader: Mutex<Arm>,
    follower: Mutex<Arm>,
    hz: u32,
    mirror: bool,
    running: AtomicBool,
    closed: AtomicBool,
    states: Mailbox<State>,
    logs: LogStream,
}

impl Controller {
    /// Connect the leader, then the follower.
    ///
    /// # Errors
    ///
    /// Returns the first [`ArmError::Connection`] or
    /// [`ArmError::Calibration`] encountered. When the follower fails the
    /// already-connected leader is closed before returning.
    pub fn new(config: TeleopConfig, connector: &dyn BusConnector) -> Result<Self, ArmError> {
        let mut leader = Arm::connect(connector, &config.leader_port, config.leader_calibration)?;
        let follower =
            match Arm::connect(connector, &config.follower_port, config.follower_calibration) {
                Ok(arm) => arm,
                Err(e) => {
                    if let Err(close_err) = leader.close() {
                        warn!(port = %leader.port(), error = %close_err, "failed to close leader arm");
                    }
                    return Err(e);
                }
            };
        Ok(Self::from_arms(leader, follower, config.hz, config.mirror))
    }

    /// Build a controller around two already-connected arms.
    pub fn from_arms(leader: Arm, follower: Arm, hz: i64, mirror: bool) -> Self {
        Self {
            leader: Mutex::new(leader),
            follower: Mutex::new(follower),
            hz: effective_hz(hz),
            mirror,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            states: Mailbox::new(),
            logs: LogStream::default(),
        }
    }

    pub fn hz(&self) -> u32 {
        self.hz
    }

    pub fn mirror(&self) -> bool {
        self.mirror
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Handle to the latest-state mailbox.
    pub fn states(&self) -> Mailbox<State> {
        self.states.clone()
    }

    /// Handle to the operator log stream.
    pub fn logs(&self) -> LogStream {
        self.logs.clone()
    }

    /// Run the control loop until `shutdown` resolves.
    ///
    /// Leader torque is disabled and follower torque enabled first; failures
    /// there are logged and the loop starts anyway. `shutdown` is only
    /// polled between ticks, so a tick in progress always completes.
    ///
    /// Returns `Ok(())` once `shutdown` has resolved and the follower has
    /// been released.
    ///
    /// # Errors
    ///
    /// [`ArmError::AlreadyRunning`] when another `start` is active, and
    /// [`ArmError::Closed`] after [`Controller::close`].
    #[instrument(skip_all, fields(hz = self.hz, mirror = self.mirror))]
    pub async fn start<F>(&self, shutdown: F) -> Result<(), ArmError>
    where
        F: Future<Output = ()>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ArmError::AlreadyRunning);
        }
        if self.closed.load(Ordering::Acquire) {
            self.running.store(false, Ordering::Release);
            return Err(ArmError::Closed);
        }

        self.prepare_arms();
        self.info(format!("Teleoperation started at {} Hz", self.hz));

        let mut ticker = tokio::time::interval(tick_period(self.hz));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = ticker.tick() => self.step(),
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Run one tick: read the leader, write the follower, publish state.
    pub fn step(&self) {
        let read = lock(&self.leader).read_positions();
        let positions = match read {
            Ok(positions) => positions,
            Err(e) => {
                self.warn(format!("Read error: {e}"));
                self.states.publish(State::with_error(e));
                return;
            }
        };

        let targets = if self.mirror {
            mirror_positions(&positions)
        } else {
            positions.clone()
        };
        if let Err(e) = lock(&self.follower).write_positions(&targets) {
            self.warn(format!("Write error: {e}"));
        }

        if self.states.publish(State::with_positions(positions)) {
            debug!("unconsumed state evicted");
        }
    }

    /// Release the follower and mark the loop stopped.
    pub fn shutdown(&self) {
        if let Err(e) = lock(&self.follower).disable().into_result() {
            self.warn(format!("Warning: failed to disable follower: {e}"));
        } else {
            self.info("Follower arm: torque disabled");
        }
        self.info("Teleoperation stopped");
        self.running.store(false, Ordering::Release);
    }

    /// Close both arms. The controller cannot be started again.
    ///
    /// # Errors
    ///
    /// [`ArmError::Close`] listing every arm that failed to close. Both arms
    /// are always attempted.
    pub fn close(&self) -> Result<(), ArmError> {
        self.running.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);

        let errors: Vec<String> = [&self.leader, &self.follower]
            .into_iter()
            .filter_map(|arm| lock(arm).close().err())
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArmError::Close(errors.join("; ")))
        }
    }

    fn prepare_arms(&self) {
        match lock(&self.leader).disable().into_result() {
            Ok(()) => self.info("Leader arm: torque disabled (passive mode)"),
            Err(e) => self.warn(format!("Warning: failed to disable leader: {e}")),
        }
        match lock(&self.follower).enable().into_result() {
            Ok(()) => self.info("Follower arm: torque enabled"),
            Err(e) => self.warn(format!("Warning: failed to enable follower: {e}")),
        }
    }

    fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.logs.log(message);
    }

    fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.logs.log(message);
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("hz", &self.hz)
            .field("mirror", &self.mirror)
            .field("running", &self.is_running())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

fn lock(arm: &Mutex<Arm>) -> MutexGuard<'_, Arm> {
    arm.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use armlink_hal::MotorCalibration;
    use armlink_hal::sim::{SimArm, SimConnector};

    fn calibration() -> Calibration {
        MotorName::ALL
            .iter()
            .map(|&m| (m, MotorCalibration::new(m.default_address(), 1000, 3000)))
            .collect()
    }

    fn rig(mirror: bool) -> (Controller, SimArm, SimArm) {
        let leader = SimArm::so101("sim:leader");
        let follower = SimArm::so101("sim:follower");
        let controller = Controller::from_arms(
            Arm::new(Box::new(leader.bus()), calibration()).unwrap(),
            Arm::new(Box::new(follower.bus()), calibration()).unwrap(),
            60,
            mirror,
        );
        (controller, leader, follower)
    }

    fn config(hz: i64) -> TeleopConfig {
        TeleopConfig {
            leader_port: "sim:leader".to_string(),
            follower_port: "sim:follower".to_string(),
            leader_calibration: calibration(),
            follower_calibration: calibration(),
            hz,
            mirror: false,
        }
    }

    #[test]
    fn mirror_negates_pan_and_roll_only() {
        let mut positions = Positions::new();
        positions.insert(MotorName::ShoulderPan, 10.0);
        positions.insert(MotorName::ShoulderLift, 20.0);
        positions.insert(MotorName::WristRoll, -30.0);
        positions.insert(MotorName::Gripper, 40.0);

        let mirrored = mirror_positions(&positions);
        assert_eq!(mirrored[&MotorName::ShoulderPan], -10.0);
        assert_eq!(mirrored[&MotorName::ShoulderLift], 20.0);
        assert_eq!(mirrored[&MotorName::WristRoll], 30.0);
        assert_eq!(mirrored[&MotorName::Gripper], 40.0);
        assert_eq!(positions[&MotorName::ShoulderPan], 10.0);
    }

    #[test]
    fn mirror_skips_absent_joints() {
        let mut positions = Positions::new();
        positions.insert(MotorName::ElbowFlex, 5.0);
        let mirrored = mirror_positions(&positions);
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[&MotorName::ElbowFlex], 5.0);
    }

    #[test]
    fn non_positive_hz_selects_default() {
        assert_eq!(effective_hz(0), DEFAULT_HZ);
        assert_eq!(effective_hz(-5), DEFAULT_HZ);
        assert_eq!(effective_hz(120), 120);
        assert_eq!(effective_hz(i64::MAX), u32::MAX);
    }

    #[test]
    fn tick_period_never_reaches_zero() {
        assert_eq!(tick_period(50), Duration::from_millis(20));
        assert_eq!(tick_period(u32::MAX), MIN_PERIOD);
    }

    #[tokio::test]
    async fn extreme_rate_runs_without_panicking() {
        let (leader, follower) = (SimArm::so101("sim:leader"), SimArm::so101("sim:follower"));
        let controller = Controller::from_arms(
            Arm::new(Box::new(leader.bus()), calibration()).unwrap(),
            Arm::new(Box::new(follower.bus()), calibration()).unwrap(),
            i64::from(u32::MAX),
            false,
        );
        assert_eq!(controller.hz(), u32::MAX);

        controller
            .start(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(!controller.is_running());
        assert!(follower.write_count() >= 1);
        assert!(!follower.torque(1));
    }

    #[test]
    fn step_copies_leader_to_follower() {
        let (controller, leader, follower) = rig(false);
        leader.set_raw(1, 1500);
        leader.set_raw(3, 2500);

        controller.step();

        assert_eq!(follower.raw(1), Some(1500));
        assert_eq!(follower.raw(3), Some(2500));
        let state = controller.states().try_take().expect("state published");
        assert!(!state.is_error());
        assert_eq!(state.positions[&MotorName::ShoulderPan], -50.0);
    }

    #[test]
    fn step_mirrors_follower_but_publishes_leader_pose() {
        let (controller, leader, follower) = rig(true);
        leader.set_raw(1, 1500);
        leader.set_raw(5, 2500);
        leader.set_raw(2, 2500);

        controller.step();

        assert_eq!(follower.raw(1), Some(2500));
        assert_eq!(follower.raw(5), Some(1500));
        assert_eq!(follower.raw(2), Some(2500));
        let state = controller.states().try_take().expect("state published");
        assert_eq!(state.positions[&MotorName::ShoulderPan], -50.0);
        assert_eq!(state.positions[&MotorName::WristRoll], 50.0);
    }

    #[test]
    fn failed_read_publishes_error_and_skips_write() {
        let (controller, leader, follower) = rig(false);
        leader.fail_reads(true);

        controller.step();
        controller.step();

        assert_eq!(follower.write_count(), 0);
        let state = controller.states().try_take().expect("error state published");
        assert!(state.is_error());
        assert!(state.positions.is_empty());
        assert!(controller.logs().drain().iter().all(|l| l.contains("Read error")));

        leader.fail_reads(false);
        controller.step();
        assert_eq!(follower.write_count(), 1);
        assert!(!controller.states().try_take().unwrap().is_error());
    }

    #[test]
    fn failed_write_still_publishes_state() {
        let (controller, _leader, follower) = rig(false);
        follower.fail_writes(true);

        controller.step();

        let state = controller.states().try_take().expect("state published");
        assert!(!state.is_error());
        assert_eq!(state.positions.len(), 6);
        let logs = controller.logs().drain();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("Write error"));
    }

    #[tokio::test]
    async fn start_runs_until_shutdown_and_releases_follower() {
        let (controller, leader, follower) = rig(false);
        leader.set_raw(4, 2000);

        controller
            .start(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(!controller.is_running());
        assert!(follower.write_count() >= 2);
        assert_eq!(leader.read_count(), follower.write_count());
        assert_eq!(follower.raw(4), Some(2000));
        assert!(!leader.torque(1));
        assert!(!follower.torque(1));

        let logs = controller.logs().drain();
        assert!(logs.iter().any(|l| l.ends_with("Leader arm: torque disabled (passive mode)")));
        assert!(logs.iter().any(|l| l.ends_with("Follower arm: torque enabled")));
        assert!(logs.iter().any(|l| l.ends_with("Teleoperation started at 60 Hz")));
        assert!(logs.iter().any(|l| l.ends_with("Follower arm: torque disabled")));
        assert!(logs.last().unwrap().ends_with("Teleoperation stopped"));
    }

    #[tokio::test]
    async fn read_failures_do_not_stop_the_loop() {
        let (controller, leader, follower) = rig(false);
        leader.fail_reads(true);

        controller
            .start(tokio::time::sleep(Duration::from_millis(60)))
            .await
            .unwrap();

        assert!(!controller.is_running());
        assert_eq!(leader.read_count(), 0);
        assert_eq!(follower.write_count(), 0);
        assert!(controller.states().try_take().unwrap().is_error());
        assert!(!follower.torque(1));
        let read_errors = controller
            .logs()
            .drain()
            .iter()
            .filter(|l| l.contains("Read error"))
            .count();
        assert!(read_errors >= 2, "only {read_errors} failed ticks logged");
    }

    #[tokio::test]
    async fn torque_faults_are_logged_not_fatal() {
        let (controller, leader, follower) = rig(false);
        leader.fail_torque(2, true);
        follower.fail_torque(6, true);

        controller
            .start(tokio::time::sleep(Duration::from_millis(40)))
            .await
            .unwrap();

        let logs = controller.logs().drain();
        assert!(logs.iter().any(|l| l.contains("Warning: failed to disable leader")));
        assert!(logs.iter().any(|l| l.contains("Warning: failed to enable follower")));
        assert!(follower.write_count() >= 1);
    }

    #[tokio::test]
    async fn concurrent_start_is_rejected() {
        let (controller, _leader, _follower) = rig(false);
        let controller = Arc::new(controller);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let first = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move {
                controller
                    .start(async move {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            while !controller.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first start must begin running");

        let second = controller.start(std::future::pending()).await;
        assert_eq!(second, Err(ArmError::AlreadyRunning));
        assert!(controller.is_running());

        stop_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Ok(()));
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn controller_can_restart_after_stop() {
        let (controller, _leader, follower) = rig(false);
        controller
            .start(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        let writes = follower.write_count();
        controller
            .start(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(follower.write_count() > writes);
    }

    #[tokio::test]
    async fn closed_controller_refuses_to_start() {
        let (controller, leader, follower) = rig(false);
        controller.close().unwrap();
        assert!(leader.is_closed());
        assert!(follower.is_closed());
        assert_eq!(
            controller.start(std::future::ready(())).await,
            Err(ArmError::Closed)
        );
        assert!(!controller.is_running());
    }

    #[test]
    fn new_connects_both_arms() {
        let connector = SimConnector::new()
            .with_arm(SimArm::so101("sim:leader"))
            .with_arm(SimArm::so101("sim:follower"));
        let controller = Controller::new(config(0), &connector).unwrap();
        assert_eq!(controller.hz(), DEFAULT_HZ);
        assert!(!controller.mirror());
        assert!(!controller.is_running());
    }

    #[test]
    fn follower_failure_closes_leader() {
        let leader = SimArm::so101("sim:leader");
        let connector = SimConnector::new().with_arm(leader.clone());

        let err = Controller::new(config(30), &connector).unwrap_err();

        assert!(matches!(err, ArmError::Connection { ref port, .. } if port == "sim:follower"));
        assert!(leader.is_closed());
    }

    #[test]
    fn leader_failure_is_reported() {
        let connector = SimConnector::new().with_arm(SimArm::so101("sim:follower"));
        let err = Controller::new(config(30), &connector).unwrap_err();
        assert!(matches!(err, ArmError::Connection { ref port, .. } if port == "sim:leader"));
    }
}
