//! Bluetooth Classic measurement pipeline.
//!
//! Everything that touches the radio goes through the external `hcitool` /
//! `hciconfig` binaries, executed via a [`CommandRunner`]. Failures of a single
//! query are never surfaced as errors; they simply produce no reading.

pub mod hcitool;
pub mod pipeline;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{Device, MeasurementPipeline};
pub use runner::{CommandError, CommandRunner, ShellRunner};
