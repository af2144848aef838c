//! Star network component: link timing, frame delivery and the hub stack.

use std::net::Ipv4Addr;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde::Serialize;

use rtlab_core::{cast, log_debug, log_info, log_trace, Event, EventHandler, Id, SimulationContext};

use crate::device::{DeviceId, MacAddr};
use crate::error::NetworkError;
use crate::hub::{ArpTimeout, HubStack, HubStats};
use crate::node::NodeId;
use crate::routing::Routes;
use crate::sink::SinkStats;
use crate::topology::StarTopology;
use crate::trace::{Direction, FrameTrace};

/// Internal event: frame reaches the device at the end of the link.
#[derive(Clone, Serialize)]
pub struct FrameArrival {
    /// Receiving device.
    pub device: DeviceId,
    /// Raw frame.
    pub frame: Vec<u8>,
}

/// Event delivered to the listener attached to a device for every frame the device receives.
#[derive(Clone, Serialize)]
pub struct FrameReceived {
    /// Receiving device.
    pub device: DeviceId,
    /// Raw frame.
    pub frame: Vec<u8>,
}

/// Frame and byte counters of the network.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NetworkStats {
    /// Number of frames put on the links.
    pub frames_transmitted: u64,
    /// Number of bytes put on the links.
    pub bytes_transmitted: u64,
    /// Number of frames which reached their receiving device.
    pub frames_delivered: u64,
    /// Number of frames which arrived at a spoke device with no listener.
    pub frames_unclaimed: u64,
    /// Counters of the hub stack.
    pub hub: HubStats,
}

#[derive(Default)]
struct Medium {
    busy_until: f64,
}

/// Simulated star network.
///
/// Each link is a half-duplex medium: a frame starts transmission once the medium is idle,
/// occupies it for `len * 8 / rate` seconds and arrives at the peer device after the propagation delay.
/// Frames arriving at hub devices are processed by the hub stack; frames arriving at spoke devices are
/// passed to the listener attached to the device (the tap bridge).
pub struct StarNetwork {
    topology: Rc<StarTopology>,
    routes: Rc<Routes>,
    media: Vec<Medium>,
    hub: HubStack,
    listeners: FxHashMap<DeviceId, Id>,
    traces: Vec<Box<dyn FrameTrace>>,
    stats: NetworkStats,
    released: bool,
    ctx: SimulationContext,
}

impl StarNetwork {
    /// Creates the network over the topology, installing the routes of the hub.
    pub fn new(topology: Rc<StarTopology>, routes: Rc<Routes>, ctx: SimulationContext) -> Self {
        let hub_node = topology.hub();
        let mut hub = HubStack::new(routes.table(hub_node.id).clone());
        for device_id in &hub_node.devices {
            let device = &topology.devices()[*device_id];
            hub.add_interface(device.id, device.mac, device.address);
        }
        let media = topology.links().iter().map(|_| Medium::default()).collect();
        Self {
            topology,
            routes,
            media,
            hub,
            listeners: FxHashMap::default(),
            traces: Vec::new(),
            stats: NetworkStats::default(),
            released: false,
            ctx,
        }
    }

    /// Returns the component id of the network.
    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    /// Returns the topology.
    pub fn topology(&self) -> &Rc<StarTopology> {
        &self.topology
    }

    /// Returns the routes.
    pub fn routes(&self) -> &Rc<Routes> {
        &self.routes
    }

    /// Adds a frame capture observer.
    pub fn add_trace(&mut self, trace: Box<dyn FrameTrace>) {
        self.traces.push(trace);
    }

    /// Attaches the component receiving [`FrameReceived`] events for frames arriving at the device.
    pub fn attach_listener(&mut self, device: DeviceId, listener: Id) -> Result<(), NetworkError> {
        self.topology.device(device).ok_or(NetworkError::UnknownDevice(device))?;
        self.listeners.insert(device, listener);
        Ok(())
    }

    /// Detaches the listener of the device.
    pub fn detach_listener(&mut self, device: DeviceId) {
        self.listeners.remove(&device);
    }

    /// Starts a passive TCP sink on the port of the node.
    ///
    /// Only the hub carries a processed stack.
    pub fn listen_at(&mut self, node: NodeId, port: u16) -> Result<(), NetworkError> {
        if node != self.topology.hub().id {
            return Err(NetworkError::UnsupportedNode(node));
        }
        self.hub.listen(port)?;
        log_info!(self.ctx, "TCP sink listening on port {} of {}", port, self.topology.node(node).name);
        Ok(())
    }

    /// Returns the counters of the sink on the port.
    pub fn sink_stats(&self, port: u16) -> Option<SinkStats> {
        self.hub.sink_stats(port)
    }

    /// Returns the MAC address the hub has resolved for the address.
    pub fn hub_arp_entry(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.hub.arp_entry(addr)
    }

    /// Returns the network counters.
    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats.clone();
        stats.hub = self.hub.stats();
        stats
    }

    /// Returns the time when the medium of the link becomes idle.
    pub fn busy_until(&self, link: usize) -> f64 {
        self.media[link].busy_until
    }

    /// Transmits a frame from the device onto its link.
    pub fn transmit(&mut self, device: DeviceId, frame: Vec<u8>) -> Result<(), NetworkError> {
        let topology = self.topology.clone();
        let dev = topology.device(device).ok_or(NetworkError::UnknownDevice(device))?;
        if self.released {
            return Ok(());
        }
        let link = topology.link(dev.link);
        let peer = link.peer(device).ok_or(NetworkError::UnknownDevice(device))?;

        let now = self.ctx.time();
        let medium = &mut self.media[link.id];
        let start = medium.busy_until.max(now);
        medium.busy_until = start + link.data_rate.transmission_time(frame.len());
        let arrival = medium.busy_until + link.delay;

        for trace in self.traces.iter_mut() {
            trace.on_frame(now, dev.node, device, Direction::Tx, &frame);
        }
        self.stats.frames_transmitted += 1;
        self.stats.bytes_transmitted += frame.len() as u64;
        log_trace!(
            self.ctx,
            "device {} sends {} bytes on link {}, arrival at {:.6}",
            device,
            frame.len(),
            link.id,
            arrival
        );
        self.ctx.emit_self(FrameArrival { device: peer, frame }, arrival - now);
        Ok(())
    }

    /// Drops listeners and traces, further frames are discarded.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.listeners.clear();
        self.traces.clear();
        log_debug!(self.ctx, "released network: {:?}", self.stats());
    }

    fn transmit_all(&mut self, frames: Vec<(DeviceId, Vec<u8>)>) {
        for (device, frame) in frames {
            if let Err(e) = self.transmit(device, frame) {
                log_debug!(self.ctx, "hub transmit failed: {}", e);
            }
        }
    }

    fn on_arp_timeout(&mut self, address: Ipv4Addr) {
        if self.released {
            return;
        }
        let out = self.hub.on_arp_timeout(&self.ctx, address);
        self.transmit_all(out);
    }

    fn on_frame_arrival(&mut self, device: DeviceId, frame: Vec<u8>) {
        if self.released {
            return;
        }
        let topology = self.topology.clone();
        let dev = match topology.device(device) {
            Some(dev) => dev,
            None => return,
        };
        let now = self.ctx.time();
        for trace in self.traces.iter_mut() {
            trace.on_frame(now, dev.node, device, Direction::Rx, &frame);
        }
        self.stats.frames_delivered += 1;

        if topology.node(dev.node).is_hub() {
            let out = self.hub.handle_frame(&self.ctx, device, &frame);
            self.transmit_all(out);
        } else if let Some(listener) = self.listeners.get(&device) {
            self.ctx.emit_now(FrameReceived { device, frame }, *listener);
        } else {
            self.stats.frames_unclaimed += 1;
        }
    }
}

impl EventHandler for StarNetwork {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            FrameArrival { device, frame } => {
                self.on_frame_arrival(device, frame);
            }
            ArpTimeout { address } => {
                self.on_arp_timeout(address);
            }
        })
    }
}
