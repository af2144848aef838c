//! Capability interface of external frame devices.

use std::io;
use std::time::Duration;

/// Reading side of an external device.
pub trait FrameSource: Send {
    /// Waits up to `timeout` for the next frame, returns `None` on timeout.
    fn receive(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Writing side of an external device.
pub trait FrameSink: Send {
    /// Writes a single frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Both sides of an opened device. The device is closed when both sides are dropped.
pub struct TapPair {
    /// Reading side.
    pub source: Box<dyn FrameSource>,
    /// Writing side.
    pub sink: Box<dyn FrameSink>,
}

/// Opens external devices by name.
pub trait TapBackend {
    /// Creates the device or attaches to an existing one.
    fn open(&self, name: &str) -> io::Result<TapPair>;
}
