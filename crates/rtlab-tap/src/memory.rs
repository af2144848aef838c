//! In-memory external devices.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{FrameSink, FrameSource, TapBackend, TapPair};

struct Slot {
    // taken by the bridge on open
    bridge_side: Option<(Receiver<Vec<u8>>, Sender<Vec<u8>>)>,
}

/// Backend with devices living in memory, the external side of each device is a [`TapPeer`].
///
/// Devices must be created with [`MemoryTapBackend::create`] before they are opened.
/// Clones share the same set of devices.
#[derive(Clone, Default)]
pub struct MemoryTapBackend {
    devices: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryTapBackend {
    /// Creates a backend with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device and returns its external side.
    pub fn create<S: Into<String>>(&self, name: S) -> TapPeer {
        let (to_bridge_tx, to_bridge_rx) = mpsc::channel();
        let (from_bridge_tx, from_bridge_rx) = mpsc::channel();
        let slot = Slot {
            bridge_side: Some((to_bridge_rx, from_bridge_tx)),
        };
        self.lock().insert(name.into(), slot);
        TapPeer {
            sender: to_bridge_tx,
            receiver: from_bridge_rx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // the map stays consistent even if a holder panicked
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TapBackend for MemoryTapBackend {
    fn open(&self, name: &str) -> io::Result<TapPair> {
        let mut devices = self.lock();
        let slot = devices
            .get_mut(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such device '{}'", name)))?;
        let (receiver, sender) = slot
            .bridge_side
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, format!("device '{}' is busy", name)))?;
        Ok(TapPair {
            source: Box::new(MemorySource { receiver }),
            sink: Box::new(MemorySink { sender }),
        })
    }
}

struct MemorySource {
    receiver: Receiver<Vec<u8>>,
}

impl FrameSource for MemorySource {
    fn receive(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "external side of the device is gone",
            )),
        }
    }
}

struct MemorySink {
    sender: Sender<Vec<u8>>,
}

impl FrameSink for MemorySink {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sender
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "external side of the device is gone"))
    }
}

/// External side of an in-memory device, standing in for the host attached to the TAP device.
pub struct TapPeer {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl TapPeer {
    /// Sends a frame into the bridge, returns `false` once the bridge side is closed.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Waits up to `timeout` for a frame written by the bridge.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Returns all frames already written by the bridge.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.receiver.try_iter().collect()
    }
}
