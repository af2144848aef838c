//! Bridge component relaying frames between a simulated device and an external one.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use serde::Serialize;

use rtlab_core::{
    cast, log_debug, log_error, log_info, log_warn, Event, EventHandler, Injector, Simulation, SimulationContext,
};
use rtlab_network::packet::{frame_dst, frame_src, set_frame_dst, set_frame_src, ETHERTYPE_ARP};
use rtlab_network::{DeviceId, FrameReceived, MacAddr, NetworkError, StarNetwork};

use crate::backend::{FrameSink, FrameSource, TapBackend};
use crate::config::{BridgeMode, TapBridgeConfig};
use crate::error::BridgeError;

/// How long the reader waits for a frame before re-checking the closed flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ARP hardware addresses inside an Ethernet frame
const ARP_SENDER_MAC: usize = 14 + 8;
const ARP_TARGET_MAC: usize = 14 + 18;

/// Frame read from the external device.
#[derive(Clone, Serialize)]
pub struct TapFrame {
    /// Raw frame.
    pub frame: Vec<u8>,
}

/// Frame and byte counters of a bridge, per direction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Frames read from the external device.
    pub frames_from_tap: u64,
    /// Bytes read from the external device.
    pub bytes_from_tap: u64,
    /// Frames written to the external device.
    pub frames_to_tap: u64,
    /// Bytes written to the external device.
    pub bytes_to_tap: u64,
    /// Frames not relayed because of the mode filter.
    pub filtered_frames: u64,
    /// Failed writes to the external device.
    pub write_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_from_tap: AtomicU64,
    bytes_from_tap: AtomicU64,
    frames_to_tap: AtomicU64,
    bytes_to_tap: AtomicU64,
    filtered_frames: AtomicU64,
    write_errors: AtomicU64,
}

struct Shared {
    name: String,
    closed: AtomicBool,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// Handle of an attached bridge, shared between the simulation and its relay threads.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    fn new(name: &str, outbound: Sender<Vec<u8>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                closed: AtomicBool::new(false),
                outbound: Mutex::new(Some(outbound)),
                threads: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the name of the external device.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues a frame for writing to the external device.
    ///
    /// Never blocks on the external device. Fails with [`BridgeError::Closed`] after teardown.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let outbound = self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(sender) => sender.send(frame).map_err(|_| BridgeError::Closed),
            None => Err(BridgeError::Closed),
        }
    }

    /// Returns `true` once the bridge is torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Tears the bridge down: stops both relay threads and releases the external device.
    ///
    /// Frames already queued for the external device are written before the writer stops.
    /// Calling it again has no effect.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let threads = std::mem::take(&mut *self.shared.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in threads {
            if handle.join().is_err() {
                error!(target: "tap", "Relay thread of {} panicked", self.shared.name);
            }
        }
        debug!(target: "tap", "Closed bridge {}: {:?}", self.shared.name, self.stats());
    }

    /// Returns the bridge counters.
    pub fn stats(&self) -> BridgeStats {
        let c = &self.shared.counters;
        BridgeStats {
            frames_from_tap: c.frames_from_tap.load(Ordering::Relaxed),
            bytes_from_tap: c.bytes_from_tap.load(Ordering::Relaxed),
            frames_to_tap: c.frames_to_tap.load(Ordering::Relaxed),
            bytes_to_tap: c.bytes_to_tap.load(Ordering::Relaxed),
            filtered_frames: c.filtered_frames.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
        }
    }

    fn add_thread(&self, handle: JoinHandle<()>) {
        self.shared.threads.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }
}

// Relay threads -------------------------------------------------------------------------------------------------------

fn run_reader(mut source: Box<dyn FrameSource>, injector: Injector, bridge: BridgeHandle) {
    let dst = injector.src();
    while !bridge.is_closed() {
        match source.receive(READ_POLL_INTERVAL) {
            Ok(Some(frame)) => {
                let counters = &bridge.shared.counters;
                counters.frames_from_tap.fetch_add(1, Ordering::Relaxed);
                counters.bytes_from_tap.fetch_add(frame.len() as u64, Ordering::Relaxed);
                if injector.inject(TapFrame { frame }, dst).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                if !bridge.is_closed() {
                    warn!(target: "tap", "Reading from {} failed: {}", bridge.name(), e);
                }
                break;
            }
        }
    }
}

fn run_writer(mut sink: Box<dyn FrameSink>, outbound: Receiver<Vec<u8>>, bridge: BridgeHandle) {
    let counters = &bridge.shared.counters;
    while let Ok(frame) = outbound.recv() {
        match sink.send(&frame) {
            Ok(()) => {
                counters.frames_to_tap.fetch_add(1, Ordering::Relaxed);
                counters.bytes_to_tap.fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(target: "tap", "Writing to {} failed: {}", bridge.name(), e);
            }
        }
    }
}

fn rewrite_arp_mac(frame: &mut [u8], offset: usize, from: MacAddr, to: MacAddr) {
    if frame.len() < offset + 6 || frame[12..14] != ETHERTYPE_ARP.to_be_bytes() {
        return;
    }
    if frame[offset..offset + 6] == from.octets() {
        frame[offset..offset + 6].copy_from_slice(&to.octets());
    }
}

// Bridge component ----------------------------------------------------------------------------------------------------

/// Simulation component binding a spoke device to an external device.
///
/// Frames read by the reader thread enter the simulation as [`TapFrame`] events and are transmitted from
/// the device onto its link. Frames received by the device are handed to the writer thread. Each direction
/// keeps its order and does not wait for the other one.
pub struct TapBridge {
    device: DeviceId,
    device_mac: MacAddr,
    config: TapBridgeConfig,
    tap_mac: Option<MacAddr>,
    net: Rc<RefCell<StarNetwork>>,
    handle: BridgeHandle,
    ctx: SimulationContext,
}

impl TapBridge {
    /// Opens the external device and binds it to the simulated device.
    ///
    /// The bridge is registered as a simulation component and is closed when the simulation is destroyed.
    pub fn attach(
        sim: &mut Simulation,
        net: &Rc<RefCell<StarNetwork>>,
        config: TapBridgeConfig,
        device: DeviceId,
        backend: &dyn TapBackend,
    ) -> Result<BridgeHandle, BridgeError> {
        if !sim.is_realtime() {
            return Err(BridgeError::NotRealtime);
        }
        let (device_mac, address, network) = net
            .borrow()
            .topology()
            .device(device)
            .map(|d| (d.mac, d.address, d.network))
            .ok_or(NetworkError::UnknownDevice(device))?;
        let name = config.device_name.clone();
        let pair = backend.open(&name).map_err(|source| BridgeError::DeviceUnavailable {
            name: name.clone(),
            source,
        })?;

        let ctx = sim.create_context(format!("tap-bridge-{}", name));
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let handle = BridgeHandle::new(&name, outbound_tx);
        let injector = sim.injector(ctx.id());

        let reader_handle = handle.clone();
        let source = pair.source;
        let reader = thread::Builder::new()
            .name(format!("{}-reader", name))
            .spawn(move || run_reader(source, injector, reader_handle));
        match reader {
            Ok(reader) => handle.add_thread(reader),
            Err(source) => {
                handle.close();
                return Err(BridgeError::DeviceUnavailable { name, source });
            }
        }
        let writer_handle = handle.clone();
        let sink = pair.sink;
        let writer = thread::Builder::new()
            .name(format!("{}-writer", name))
            .spawn(move || run_writer(sink, outbound_rx, writer_handle));
        match writer {
            Ok(writer) => handle.add_thread(writer),
            Err(source) => {
                handle.close();
                return Err(BridgeError::DeviceUnavailable { name, source });
            }
        }

        let tap_mac = config.mac;
        let bridge = Self {
            device,
            device_mac,
            config,
            tap_mac,
            net: net.clone(),
            handle: handle.clone(),
            ctx,
        };
        log_info!(
            bridge.ctx,
            "bridging device {} ({}) to {} in {:?} mode",
            device,
            device_mac,
            name,
            bridge.config.mode
        );
        log_debug!(
            bridge.ctx,
            "external host of {} should use address {} netmask {} gateway {}",
            name,
            address,
            bridge.config.netmask.unwrap_or_else(|| network.netmask()),
            bridge
                .config
                .gateway
                .map_or_else(|| "none".to_owned(), |gw| gw.to_string())
        );
        let id = sim.add_handler(format!("tap-bridge-{}", name), Rc::new(RefCell::new(bridge)));
        if let Err(e) = net.borrow_mut().attach_listener(device, id) {
            handle.close();
            return Err(e.into());
        }
        let teardown = handle.clone();
        sim.on_destroy(format!("tap-bridge-{}", name), move || teardown.close());
        Ok(handle)
    }

    fn from_tap(&mut self, mut frame: Vec<u8>) {
        if self.config.mode == BridgeMode::VirtualMac {
            if self.tap_mac.is_none() {
                self.tap_mac = frame_src(&frame);
            }
            if !set_frame_src(&mut frame, self.device_mac) {
                return;
            }
            if let Some(tap_mac) = self.tap_mac {
                rewrite_arp_mac(&mut frame, ARP_SENDER_MAC, tap_mac, self.device_mac);
            }
        }
        if let Err(e) = self.net.borrow_mut().transmit(self.device, frame) {
            log_warn!(self.ctx, "transmit failed: {}", e);
        }
    }

    fn to_tap(&mut self, mut frame: Vec<u8>) {
        if self.config.mode == BridgeMode::VirtualMac {
            let dst = match frame_dst(&frame) {
                Some(dst) => dst,
                None => return,
            };
            if dst == self.device_mac {
                if let Some(tap_mac) = self.tap_mac {
                    set_frame_dst(&mut frame, tap_mac);
                    rewrite_arp_mac(&mut frame, ARP_TARGET_MAC, self.device_mac, tap_mac);
                }
            } else if !dst.is_multicast() {
                self.handle.shared.counters.filtered_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = self.handle.send(frame) {
            log_debug!(self.ctx, "frame to {} dropped: {}", self.config.device_name, e);
        }
    }
}

impl EventHandler for TapBridge {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            TapFrame { frame } => {
                self.from_tap(frame);
            }
            FrameReceived { device, frame } => {
                if device == self.device {
                    self.to_tap(frame);
                } else {
                    log_error!(self.ctx, "frame of foreign device {} dropped", device);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use rtlab_network::packet::{ArpPacket, EthernetFrame};

    use super::*;

    #[test]
    fn arp_sender_rewritten_only_when_matching() {
        let tap = MacAddr::allocate(100);
        let device = MacAddr::allocate(2);
        let arp = ArpPacket::request(tap, "10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap());
        let mut frame = EthernetFrame::new(MacAddr::BROADCAST, tap, ETHERTYPE_ARP, arp.to_bytes()).to_bytes();

        rewrite_arp_mac(&mut frame, ARP_SENDER_MAC, tap, device);
        let parsed = ArpPacket::parse(&frame[14..]).unwrap();
        assert_eq!(parsed.sender_mac, device);

        rewrite_arp_mac(&mut frame, ARP_SENDER_MAC, tap, MacAddr::BROADCAST);
        let parsed = ArpPacket::parse(&frame[14..]).unwrap();
        assert_eq!(parsed.sender_mac, device);
    }

    #[test]
    fn non_arp_frames_untouched() {
        let tap = MacAddr::allocate(100);
        let frame = EthernetFrame::new(MacAddr::BROADCAST, tap, 0x0800, vec![0; 40]).to_bytes();
        let mut rewritten = frame.clone();
        rewrite_arp_mac(&mut rewritten, ARP_SENDER_MAC, MacAddr::default(), tap);
        assert_eq!(rewritten, frame);
    }
}
