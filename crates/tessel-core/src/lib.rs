//! `tessel-core`: configuration and error types shared by every tessel crate.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, SchedulerConfig, TesselConfig};
pub use error::{Result, TesselError};
