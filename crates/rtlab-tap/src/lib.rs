#![warn(missing_docs)]
#![doc = include_str!("../readme.md")]

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

pub use backend::{FrameSink, FrameSource, TapBackend, TapPair};
pub use bridge::{BridgeHandle, BridgeStats, TapBridge, TapFrame};
pub use config::{BridgeMode, TapBridgeConfig};
pub use error::BridgeError;
#[cfg(target_os = "linux")]
pub use linux::LinuxTapBackend;
pub use memory::{MemoryTapBackend, TapPeer};
