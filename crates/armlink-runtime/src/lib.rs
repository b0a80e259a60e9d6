//! `armlink-runtime` – Control loops
//!
//! The parts of armlink that run over time: the teleoperation loop that
//! slaves a follower arm to a leader arm, and the recorder that measures an
//! arm's range of motion to produce its calibration.
//!
//! # Modules
//!
//! - [`teleop`] – [`Controller`][teleop::Controller]: fixed-rate
//!   leader → follower loop with optional mirroring. Publishes
//!   [`State`][armlink_types::State] snapshots to a latest-value
//!   [`Mailbox`][armlink_middleware::Mailbox] and operator log lines to a
//!   drop-on-full [`LogStream`][armlink_middleware::LogStream].
//! - [`recorder`] – [`CalibrationRecorder`][recorder::CalibrationRecorder]:
//!   samples a torque-free arm and widens per-motor bounds until told to
//!   finish.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter.
//!
//! The loop is driven by Tokio timers, but servo I/O stays synchronous: each
//! tick locks an arm, talks to the bus and releases the lock before the next
//! `.await`.

pub mod recorder;
pub mod telemetry;
pub mod teleop;

pub use recorder::{
    CalibrationRecorder, DEFAULT_SAMPLE_PERIOD, MotorRange, RECOMMENDED_MIN_SPAN, RangeTable,
    RecorderState,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use teleop::{Controller, DEFAULT_HZ, TeleopConfig, mirror_positions};
