//! Frame capture observers.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::warn;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::device::DeviceId;
use crate::node::NodeId;
use crate::topology::StarTopology;

/// Direction of a captured frame relative to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Frame sent by the device.
    Tx,
    /// Frame received by the device.
    Rx,
}

/// Observer of every frame passing through the simulated devices.
///
/// Devices are captured in promiscuous mode: all frames seen on the medium are reported
/// regardless of their destination address.
pub trait FrameTrace {
    /// Called for each frame sent or received by a device.
    fn on_frame(&mut self, time: f64, node: NodeId, device: DeviceId, direction: Direction, frame: &[u8]);
}

// In-memory trace -----------------------------------------------------------------------------------------------------

/// Captured frame.
#[derive(Clone, Debug, Serialize)]
pub struct TraceRecord {
    /// Simulation time.
    pub time: f64,
    /// Node owning the device.
    pub node: NodeId,
    /// Device id.
    pub device: DeviceId,
    /// Frame direction.
    pub direction: Direction,
    /// Raw frame.
    pub frame: Vec<u8>,
}

/// Trace keeping the captured frames in memory.
///
/// Clones share the same storage, so a clone can be passed to the network and another kept for inspection.
#[derive(Clone, Default)]
pub struct MemoryTrace {
    records: Rc<RefCell<Vec<TraceRecord>>>,
}

impl MemoryTrace {
    /// Creates an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of captured records.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.borrow().clone()
    }

    /// Returns the records of the device in the direction.
    pub fn device_records(&self, device: DeviceId, direction: Direction) -> Vec<TraceRecord> {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.device == device && r.direction == direction)
            .cloned()
            .collect()
    }
}

impl FrameTrace for MemoryTrace {
    fn on_frame(&mut self, time: f64, node: NodeId, device: DeviceId, direction: Direction, frame: &[u8]) {
        self.records.borrow_mut().push(TraceRecord {
            time,
            node,
            device,
            direction,
            frame: frame.to_vec(),
        });
    }
}

// Pcap trace ----------------------------------------------------------------------------------------------------------

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_SNAPLEN: u32 = 65535;
const LINKTYPE_ETHERNET: u32 = 1;

/// Trace writing one libpcap file per device, named `<prefix>-<node>-<device index on node>.pcap`.
pub struct PcapTrace {
    writers: FxHashMap<DeviceId, BufWriter<File>>,
    paths: Vec<PathBuf>,
}

impl PcapTrace {
    /// Creates capture files for all devices of the topology.
    pub fn create<P: AsRef<Path>>(prefix: P, topology: &StarTopology) -> io::Result<Self> {
        let prefix = prefix.as_ref().to_string_lossy().into_owned();
        let mut writers = FxHashMap::default();
        let mut paths = Vec::new();
        for node in topology.nodes() {
            for (index, device) in node.devices.iter().enumerate() {
                let path = PathBuf::from(format!("{}-{}-{}.pcap", prefix, node.id, index));
                let mut writer = BufWriter::new(File::create(&path)?);
                write_global_header(&mut writer)?;
                writers.insert(*device, writer);
                paths.push(path);
            }
        }
        Ok(Self { writers, paths })
    }

    /// Returns the paths of created files.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Flushes buffered records to the files.
    pub fn flush(&mut self) -> io::Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl FrameTrace for PcapTrace {
    fn on_frame(&mut self, time: f64, _node: NodeId, device: DeviceId, _direction: Direction, frame: &[u8]) {
        if let Some(writer) = self.writers.get_mut(&device) {
            if let Err(e) = write_record(writer, time, frame) {
                warn!(target: "pcap", "Failed to write capture record of device {}: {}", device, e);
            }
        }
    }
}

impl Drop for PcapTrace {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(target: "pcap", "Failed to flush capture files: {}", e);
        }
    }
}

fn write_global_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&PCAP_MAGIC.to_le_bytes())?;
    w.write_all(&2u16.to_le_bytes())?;
    w.write_all(&4u16.to_le_bytes())?;
    w.write_all(&0i32.to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?;
    w.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
    w.write_all(&LINKTYPE_ETHERNET.to_le_bytes())
}

fn write_record<W: Write>(w: &mut W, time: f64, frame: &[u8]) -> io::Result<()> {
    let micros = (time * 1e6).round() as u64;
    let captured = frame.len().min(PCAP_SNAPLEN as usize);
    w.write_all(&((micros / 1_000_000) as u32).to_le_bytes())?;
    w.write_all(&((micros % 1_000_000) as u32).to_le_bytes())?;
    w.write_all(&(captured as u32).to_le_bytes())?;
    w.write_all(&(frame.len() as u32).to_le_bytes())?;
    w.write_all(&frame[..captured])
}
