//! `armlink-middleware` – Observer plumbing
//!
//! Decouples the control loop from whoever is watching it. Neither channel
//! can block or fail the publisher.
//!
//! # Modules
//!
//! - [`mailbox`] – [`Mailbox`]: capacity-one slot where the newest value
//!   evicts an unconsumed one. Carries per-tick state snapshots.
//! - [`log_stream`] – [`LogStream`]: small bounded queue that drops lines
//!   when full. Carries operator log lines.

pub mod log_stream;
pub mod mailbox;

pub use log_stream::{DEFAULT_LOG_CAPACITY, LogStream};
pub use mailbox::Mailbox;
