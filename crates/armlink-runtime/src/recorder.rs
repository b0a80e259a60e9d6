//! [`CalibrationRecorder`] – records each joint's range of motion.
//!
//! The operator moves a torque-free arm through its full travel while the
//! recorder samples every motor at a fixed period and widens per-motor
//! `[min, max]` bounds. Finishing turns the bounds into a [`Calibration`].
//!
//! # Algorithm
//!
//! 1. [`CalibrationRecorder::begin`] disables torque on addresses 1–6 and
//!    seeds `min = max = current` from a first sample.
//! 2. Every tick, [`CalibrationRecorder::sample`] reads each motor at its
//!    canonical address and folds the value in with
//!    [`CalibrationRecorder::observe`]. A motor that fails to read is skipped
//!    for that tick only.
//! 3. [`CalibrationRecorder::finish`] freezes the bounds.
//!
//! Coverage is never enforced. [`CalibrationRecorder::suspect_motors`] lists
//! motors whose span looks too narrow so a front-end can warn about them.
//!
//! # Example
//!
//! ```rust
//! use armlink_hal::sim::SimArm;
//! use armlink_runtime::recorder::CalibrationRecorder;
//! use armlink_types::MotorName;
//!
//! let arm = SimArm::so101("sim:cal");
//! let mut bus = arm.bus();
//! let mut recorder = CalibrationRecorder::begin(&mut bus);
//!
//! arm.set_raw(1, 900);
//! recorder.sample(&mut bus);
//! arm.set_raw(1, 3100);
//! recorder.sample(&mut bus);
//!
//! let calibration = recorder.finish().unwrap();
//! let pan = calibration.get(MotorName::ShoulderPan).unwrap();
//! assert_eq!((pan.range_min, pan.range_max), (900, 3100));
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use armlink_hal::{Calibration, MotorCalibration, ServoBus};
use armlink_types::{ArmError, MotorName};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Span (raw units) below which a recorded range is flagged as suspect.
pub const RECOMMENDED_MIN_SPAN: i32 = 500;

/// Sampling period used by interactive front-ends.
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Range bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// Recorder lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Sampling,
    Done,
}

/// Live bounds for one motor, in raw units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorRange {
    pub current: i32,
    pub min: i32,
    pub max: i32,
}

impl MotorRange {
    fn seeded(position: i32) -> Self {
        Self {
            current: position,
            min: position,
            max: position,
        }
    }

    fn observe(&mut self, position: i32) {
        self.current = position;
        self.min = self.min.min(position);
        self.max = self.max.max(position);
    }

    pub fn span(&self) -> i32 {
        self.max - self.min
    }
}

/// Per-motor bounds keyed by motor name.
pub type RangeTable = BTreeMap<MotorName, MotorRange>;

// ─────────────────────────────────────────────────────────────────────────────
// CalibrationRecorder
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulates per-motor `[min, max]` bounds from live samples.
#[derive(Debug, Clone)]
pub struct CalibrationRecorder {
    ranges: RangeTable,
    state: RecorderState,
    ticks: usize,
}

impl Default for CalibrationRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationRecorder {
    /// An empty recorder that has not touched any hardware.
    pub fn new() -> Self {
        Self {
            ranges: RangeTable::new(),
            state: RecorderState::Sampling,
            ticks: 0,
        }
    }

    /// Release every motor and take the seeding sample.
    ///
    /// Torque failures are logged; the operator may still be able to move
    /// the joints.
    pub fn begin(bus: &mut dyn ServoBus) -> Self {
        let addresses: Vec<u8> = MotorName::ALL.iter().map(|m| m.default_address()).collect();
        let outcome = bus.disable_all(&addresses);
        if !outcome.is_success() {
            for fault in &outcome.failures {
                warn!(port = %bus.port(), address = fault.address, error = %fault.details, "failed to disable torque");
            }
        }
        info!(port = %bus.port(), "recording range of motion");

        let mut recorder = Self::new();
        recorder.sample(bus);
        recorder
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Number of completed [`sample`][Self::sample] ticks.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Current bounds of every motor seen so far.
    pub fn ranges(&self) -> &RangeTable {
        &self.ranges
    }

    /// Fold one raw reading into `motor`'s bounds. Ignored once finished.
    pub fn observe(&mut self, motor: MotorName, position: i32) {
        if self.state == RecorderState::Done {
            return;
        }
        self.ranges
            .entry(motor)
            .and_modify(|range| range.observe(position))
            .or_insert_with(|| MotorRange::seeded(position));
    }

    /// Read every motor once. Returns how many motors answered.
    pub fn sample(&mut self, bus: &mut dyn ServoBus) -> usize {
        if self.state == RecorderState::Done {
            return 0;
        }
        let mut answered = 0;
        for motor in MotorName::ALL {
            match bus.position(motor.default_address()) {
                Ok(raw) => {
                    self.observe(motor, raw);
                    answered += 1;
                }
                Err(e) => debug!(%motor, error = %e, "sample skipped"),
            }
        }
        self.ticks += 1;
        answered
    }

    /// Motors whose recorded span is narrower than `min_span`, plus motors
    /// that were never sampled.
    pub fn suspect_motors(&self, min_span: i32) -> Vec<MotorName> {
        MotorName::ALL
            .into_iter()
            .filter(|motor| {
                self.ranges
                    .get(motor)
                    .is_none_or(|range| range.span() < min_span)
            })
            .collect()
    }

    /// Freeze the bounds and build the calibration.
    ///
    /// Each motor gets its canonical address as `id`, zero drive mode and
    /// zero homing offset.
    ///
    /// # Errors
    ///
    /// [`ArmError::Calibration`] when a motor never produced a sample. The
    /// recorder keeps sampling in that case.
    pub fn finish(&mut self) -> Result<Calibration, ArmError> {
        let missing: Vec<&str> = MotorName::ALL
            .iter()
            .filter(|motor| !self.ranges.contains_key(*motor))
            .map(|motor| motor.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ArmError::Calibration(format!(
                "no samples recorded for {}",
                missing.join(", ")
            )));
        }

        self.state = RecorderState::Done;
        let calibration: Calibration = self
            .ranges
            .iter()
            .map(|(&motor, range)| {
                (
                    motor,
                    MotorCalibration::new(motor.default_address(), range.min, range.max),
                )
            })
            .collect();

        let suspects = self.suspect_motors(RECOMMENDED_MIN_SPAN);
        if !suspects.is_empty() {
            warn!(?suspects, min_span = RECOMMENDED_MIN_SPAN, "narrow calibration ranges");
        }
        info!(ticks = self.ticks, "calibration recorded");
        Ok(calibration)
    }

    /// Sample every `period` until `finish_signal` resolves, then
    /// [`finish`][Self::finish].
    pub async fn run<F>(
        &mut self,
        bus: &mut dyn ServoBus,
        period: Duration,
        finish_signal: F,
    ) -> Result<Calibration, ArmError>
    where
        F: Future<Output = ()>,
    {
        self.run_with(bus, period, finish_signal, |_| {}).await
    }

    /// Like [`run`][Self::run], calling `observer` with the live table after
    /// every tick.
    pub async fn run_with<F, O>(
        &mut self,
        bus: &mut dyn ServoBus,
        period: Duration,
        finish_signal: F,
        mut observer: O,
    ) -> Result<Calibration, ArmError>
    where
        F: Future<Output = ()>,
        O: FnMut(&RangeTable),
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(finish_signal);

        loop {
            tokio::select! {
                biased;
                () = &mut finish_signal => break,
                _ = ticker.tick() => {
                    self.sample(bus);
                    observer(&self.ranges);
                }
            }
        }
        self.finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use armlink_hal::sim::SimArm;

    #[test]
    fn bounds_follow_observed_extremes() {
        let mut recorder = CalibrationRecorder::new();
        for pos in [1500, 1200, 1800, 1600] {
            recorder.observe(MotorName::ElbowFlex, pos);
        }
        let range = recorder.ranges()[&MotorName::ElbowFlex];
        assert_eq!(range.min, 1200);
        assert_eq!(range.max, 1800);
        assert_eq!(range.current, 1600);
        assert_eq!(range.span(), 600);
    }

    #[test]
    fn begin_releases_torque_and_seeds_every_motor() {
        let arm = SimArm::so101("sim:cal");
        let mut bus = arm.bus();
        bus.enable_all(&[1, 2, 3, 4, 5, 6]);
        arm.set_raw(2, 1700);

        let recorder = CalibrationRecorder::begin(&mut bus);

        assert!((1..=6).all(|a| !arm.torque(a)));
        assert_eq!(recorder.ranges().len(), 6);
        assert_eq!(
            recorder.ranges()[&MotorName::ShoulderLift],
            MotorRange {
                current: 1700,
                min: 1700,
                max: 1700
            }
        );
        assert_eq!(recorder.ticks(), 1);
    }

    #[test]
    fn scripted_sweep_produces_calibration() {
        let arm = SimArm::so101("sim:cal");
        arm.script(1, [1500, 1200, 1800, 1600]);
        let mut bus = arm.bus();

        let mut recorder = CalibrationRecorder::begin(&mut bus);
        for _ in 0..3 {
            recorder.sample(&mut bus);
        }
        let calibration = recorder.finish().unwrap();

        let pan = calibration.get(MotorName::ShoulderPan).unwrap();
        assert_eq!(pan.id, 1);
        assert_eq!(pan.range_min, 1200);
        assert_eq!(pan.range_max, 1800);
        assert_eq!(pan.drive_mode, 0);
        assert_eq!(pan.homing_offset, 0);
        let gripper = calibration.get(MotorName::Gripper).unwrap();
        assert_eq!(gripper.id, 6);
        assert!(calibration.validate().is_ok());
        assert_eq!(recorder.state(), RecorderState::Done);
    }

    #[test]
    fn failed_reads_are_skipped_per_tick() {
        let arm = SimArm::so101("sim:cal");
        let mut bus = arm.bus();
        arm.fail_reads(true);

        let mut recorder = CalibrationRecorder::begin(&mut bus);
        assert!(recorder.ranges().is_empty());
        assert!(matches!(recorder.finish(), Err(ArmError::Calibration(_))));
        assert_eq!(recorder.state(), RecorderState::Sampling);

        arm.fail_reads(false);
        arm.set_raw(4, 2500);
        assert_eq!(recorder.sample(&mut bus), 6);
        assert_eq!(recorder.ranges()[&MotorName::WristFlex].min, 2500);
        assert!(recorder.finish().is_ok());
    }

    #[test]
    fn missing_servo_blocks_finish() {
        let arm = SimArm::new("sim:five");
        for address in 1..=5 {
            arm.add_servo(address, 2048);
        }
        let mut bus = arm.bus();
        let mut recorder = CalibrationRecorder::begin(&mut bus);
        assert_eq!(recorder.ranges().len(), 5);

        let err = recorder.finish().unwrap_err();
        assert_eq!(err, ArmError::Calibration("no samples recorded for gripper".into()));
    }

    #[test]
    fn observe_is_ignored_after_finish() {
        let arm = SimArm::so101("sim:cal");
        let mut bus = arm.bus();
        let mut recorder = CalibrationRecorder::begin(&mut bus);
        recorder.finish().unwrap();

        recorder.observe(MotorName::ShoulderPan, 10);
        arm.set_raw(1, 4000);
        assert_eq!(recorder.sample(&mut bus), 0);
        assert_eq!(recorder.ranges()[&MotorName::ShoulderPan].min, 2048);
        assert_eq!(recorder.ranges()[&MotorName::ShoulderPan].max, 2048);
    }

    #[test]
    fn suspect_motors_reports_narrow_and_unsampled() {
        let mut recorder = CalibrationRecorder::new();
        for motor in MotorName::ALL {
            recorder.observe(motor, 1000);
            recorder.observe(motor, 3000);
        }
        recorder.observe(MotorName::Gripper, 1000);
        assert!(recorder.suspect_motors(RECOMMENDED_MIN_SPAN).is_empty());

        let mut narrow = CalibrationRecorder::new();
        narrow.observe(MotorName::ShoulderPan, 2000);
        narrow.observe(MotorName::ShoulderPan, 2400);
        let suspects = narrow.suspect_motors(RECOMMENDED_MIN_SPAN);
        assert_eq!(suspects.len(), 6);
        assert_eq!(suspects[0], MotorName::ShoulderPan);
    }

    #[tokio::test]
    async fn run_samples_until_finish_signal() {
        let arm = SimArm::so101("sim:cal");
        arm.script(3, [1000, 3000, 2000]);
        let mut bus = arm.bus();
        let mut recorder = CalibrationRecorder::begin(&mut bus);

        let mut observed = 0;
        let calibration = recorder
            .run_with(
                &mut bus,
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(80)),
                |table| {
                    observed += 1;
                    assert_eq!(table.len(), 6);
                },
            )
            .await
            .unwrap();

        assert!(observed >= 2);
        let elbow = calibration.get(MotorName::ElbowFlex).unwrap();
        assert_eq!((elbow.range_min, elbow.range_max), (1000, 3000));
    }

    #[tokio::test]
    async fn run_finishes_immediately_on_ready_signal() {
        let arm = SimArm::so101("sim:cal");
        let mut bus = arm.bus();
        let mut recorder = CalibrationRecorder::begin(&mut bus);
        let calibration = recorder
            .run(&mut bus, DEFAULT_SAMPLE_PERIOD, std::future::ready(()))
            .await
            .unwrap();
        assert_eq!(calibration.len(), 6);
        assert_eq!(recorder.ticks(), 1);
    }
}
