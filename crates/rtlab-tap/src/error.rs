//! Bridge errors.

use std::io;

use thiserror::Error;

use rtlab_network::NetworkError;

/// Errors of the tap bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// External device can not be opened or created.
    #[error("tap device {name} is unavailable: {source}")]
    DeviceUnavailable {
        /// Device name.
        name: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The bridge was torn down.
    #[error("tap bridge is closed")]
    Closed,
    /// Bridging requires the simulation to be paced by the wall clock.
    #[error("tap bridge requires the real-time simulation clock")]
    NotRealtime,
    /// Simulated device can not be bridged.
    #[error(transparent)]
    Network(#[from] NetworkError),
}
