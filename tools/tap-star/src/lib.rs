//! Real-time star LAN with every spoke bridged to an external TAP device.

pub mod animation;
pub mod config;
pub mod controller;

pub use config::{ConfigError, RawStarConfig, StarConfig};
pub use controller::{BridgeReport, RunError, RunReport, StarHarness};
