//! Bluetooth Classic presence coordination library.
//!
//! A cluster of instances shares one roster of Bluetooth addresses. The
//! elected leader rotates the addresses over the participating instances
//! each interval; every instance measures what it is assigned and all of
//! them keep the resulting presence sensors in sync.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod entities;
pub mod error;
pub mod radio;
pub mod scheduler;
pub mod signal;
