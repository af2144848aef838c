//! IPv4 protocol stack of the hub node.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::Serialize;

use rtlab_core::{log_debug, log_trace, EventId, SimulationContext};

use crate::device::{DeviceId, MacAddr};
use crate::error::NetworkError;
use crate::packet::*;
use crate::routing::RoutingTable;
use crate::sink::{reset_for, PacketSink, SinkStats};

/// Counters of the hub stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of answered ARP requests.
    pub arp_replies: u64,
    /// Number of answered ICMP echo requests.
    pub echo_replies: u64,
    /// Number of forwarded IPv4 packets.
    pub forwarded_packets: u64,
    /// Number of sent ICMP error messages.
    pub icmp_errors: u64,
    /// Number of sent TCP resets.
    pub tcp_resets: u64,
    /// Number of frames dropped because of a checksum mismatch.
    pub checksum_errors: u64,
    /// Number of frames dropped because they could not be parsed or processed.
    pub dropped_frames: u64,
    /// Number of packets dropped because their next hop did not resolve or its queue was full.
    pub unresolved_drops: u64,
}

/// Interval between ARP requests for an unresolved next hop.
pub const ARP_RETRY_INTERVAL: f64 = 1.;
/// Number of repeated ARP requests before the next hop is given up.
pub const ARP_MAX_RETRIES: u32 = 3;
/// Number of packets queued per unresolved next hop.
pub const ARP_PENDING_LIMIT: usize = 3;

/// Internal event: no ARP reply arrived for the next hop within the retry interval.
#[derive(Clone, Serialize)]
pub struct ArpTimeout {
    /// Unresolved next hop.
    pub address: Ipv4Addr,
}

struct Interface {
    device: DeviceId,
    mac: MacAddr,
    address: Ipv4Addr,
}

// Outstanding ARP resolution of a next hop.
struct Resolution {
    device: DeviceId,
    retries: u32,
    timer: EventId,
    // packets with the hub address they arrived on, none for packets originated by the hub
    waiting: VecDeque<(Option<Ipv4Addr>, Ipv4Packet)>,
}

/// Frame leaving the hub through a device.
pub type Outgoing = (DeviceId, Vec<u8>);

/// Protocol stack processing frames delivered to the hub devices.
///
/// The stack answers ARP for its own addresses and resolves next hops with ARP, answers ICMP echo,
/// forwards IPv4 between its networks (decrementing TTL and rewriting MAC addresses) and
/// delivers TCP segments to the registered sinks.
///
/// Unresolved next hops are requested again every [`ARP_RETRY_INTERVAL`] up to [`ARP_MAX_RETRIES`] times,
/// holding at most [`ARP_PENDING_LIMIT`] packets meanwhile. Forwarded packets of a next hop which never
/// resolves are answered with ICMP host unreachable.
pub struct HubStack {
    interfaces: Vec<Interface>,
    routes: RoutingTable,
    arp_cache: FxHashMap<Ipv4Addr, MacAddr>,
    pending: FxHashMap<Ipv4Addr, Resolution>,
    sinks: IndexMap<u16, PacketSink>,
    next_ip_id: u16,
    stats: HubStats,
}

impl HubStack {
    /// Creates a stack with no interfaces.
    pub fn new(routes: RoutingTable) -> Self {
        Self {
            interfaces: Vec::new(),
            routes,
            arp_cache: FxHashMap::default(),
            pending: FxHashMap::default(),
            sinks: IndexMap::new(),
            next_ip_id: 1,
            stats: HubStats::default(),
        }
    }

    /// Adds an addressed interface.
    pub fn add_interface(&mut self, device: DeviceId, mac: MacAddr, address: Ipv4Addr) {
        self.interfaces.push(Interface { device, mac, address });
    }

    /// Registers a sink on the port.
    pub fn listen(&mut self, port: u16) -> Result<(), NetworkError> {
        if self.sinks.contains_key(&port) {
            return Err(NetworkError::PortInUse(port));
        }
        self.sinks.insert(port, PacketSink::new(port));
        Ok(())
    }

    /// Returns the counters of the sink on the port.
    pub fn sink_stats(&self, port: u16) -> Option<SinkStats> {
        self.sinks.get(&port).map(|sink| sink.stats())
    }

    /// Returns the ports with registered sinks, in registration order.
    pub fn sink_ports(&self) -> Vec<u16> {
        self.sinks.keys().copied().collect()
    }

    /// Returns the stack counters.
    pub fn stats(&self) -> HubStats {
        self.stats.clone()
    }

    /// Returns the MAC address learned for the address.
    pub fn arp_entry(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.arp_cache.get(&addr).copied()
    }

    fn interface(&self, device: DeviceId) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.device == device)
    }

    fn is_local(&self, addr: Ipv4Addr) -> bool {
        addr.is_broadcast() || self.interfaces.iter().any(|i| i.address == addr)
    }

    /// Processes a frame received on the device, returns the frames to transmit.
    pub fn handle_frame(&mut self, ctx: &SimulationContext, device: DeviceId, frame: &[u8]) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let (mac, address) = match self.interface(device) {
            Some(iface) => (iface.mac, iface.address),
            None => {
                self.stats.dropped_frames += 1;
                return out;
            }
        };
        let frame = match EthernetFrame::parse(frame) {
            Ok(frame) => frame,
            Err(_) => {
                self.stats.dropped_frames += 1;
                return out;
            }
        };
        if frame.dst != mac && !frame.dst.is_broadcast() {
            log_trace!(ctx, "frame to {} ignored on device {}", frame.dst, device);
            return out;
        }
        match frame.ethertype {
            ETHERTYPE_ARP => self.handle_arp(ctx, device, mac, &frame.payload, &mut out),
            ETHERTYPE_IPV4 => match Ipv4Packet::parse(&frame.payload, ctx.checksums_enabled()) {
                Ok(packet) => self.handle_ipv4(ctx, address, packet, &mut out),
                Err(PacketError::BadChecksum(_)) => {
                    log_debug!(ctx, "dropped IPv4 packet with bad checksum on device {}", device);
                    self.stats.checksum_errors += 1;
                }
                Err(_) => self.stats.dropped_frames += 1,
            },
            _ => self.stats.dropped_frames += 1,
        }
        out
    }

    fn handle_arp(
        &mut self,
        ctx: &SimulationContext,
        device: DeviceId,
        mac: MacAddr,
        payload: &[u8],
        out: &mut Vec<Outgoing>,
    ) {
        let arp = match ArpPacket::parse(payload) {
            Ok(arp) => arp,
            Err(_) => {
                self.stats.dropped_frames += 1;
                return;
            }
        };
        let for_us = self.is_local(arp.target_ip);
        if for_us || self.arp_cache.contains_key(&arp.sender_ip) {
            self.arp_cache.insert(arp.sender_ip, arp.sender_mac);
        }
        if arp.op == ARP_REQUEST && for_us {
            let reply = arp.reply(mac);
            log_debug!(ctx, "ARP reply {} is at {}", reply.sender_ip, mac);
            self.stats.arp_replies += 1;
            out.push((
                device,
                EthernetFrame::new(arp.sender_mac, mac, ETHERTYPE_ARP, reply.to_bytes()).to_bytes(),
            ));
        }
        if let Some(resolution) = self.pending.remove(&arp.sender_ip) {
            ctx.cancel_event(resolution.timer);
            log_trace!(ctx, "{} resolved, flushing {} packets", arp.sender_ip, resolution.waiting.len());
            for (ingress, packet) in resolution.waiting {
                self.emit_packet(resolution.device, arp.sender_mac, packet, ingress.is_some(), out);
            }
        }
    }

    fn handle_ipv4(&mut self, ctx: &SimulationContext, address: Ipv4Addr, packet: Ipv4Packet, out: &mut Vec<Outgoing>) {
        if self.is_local(packet.dst) {
            self.deliver_local(ctx, address, packet, out);
            return;
        }
        if packet.ttl <= 1 {
            self.send_icmp_error(ctx, address, ICMP_TIME_EXCEEDED, 0, &packet, out);
            return;
        }
        match self.routes.lookup(packet.dst).cloned() {
            Some(route) => {
                let mut packet = packet;
                packet.ttl -= 1;
                log_trace!(ctx, "forwarding {} -> {} via device {}", packet.src, packet.dst, route.device);
                let next_hop = route.gateway.unwrap_or(packet.dst);
                self.route_packet(ctx, route.device, next_hop, Some(address), packet, out);
            }
            None => {
                log_debug!(ctx, "{}", NetworkError::UnreachableDestination(packet.dst));
                self.send_icmp_error(ctx, address, ICMP_DEST_UNREACHABLE, ICMP_NET_UNREACHABLE, &packet, out);
            }
        }
    }

    fn deliver_local(
        &mut self,
        ctx: &SimulationContext,
        address: Ipv4Addr,
        packet: Ipv4Packet,
        out: &mut Vec<Outgoing>,
    ) {
        if packet.is_fragment() {
            log_debug!(ctx, "dropped fragment {} of {} to {}", packet.identification, packet.src, packet.dst);
            self.stats.dropped_frames += 1;
            return;
        }
        let validate = ctx.checksums_enabled();
        // replies are sourced from the address the packet was sent to
        let local = if packet.dst.is_broadcast() { address } else { packet.dst };
        match packet.protocol {
            IPPROTO_ICMP => match IcmpPacket::parse(&packet.payload, validate) {
                Ok(icmp) if icmp.icmp_type == ICMP_ECHO_REQUEST => {
                    let reply = IcmpPacket {
                        icmp_type: ICMP_ECHO_REPLY,
                        ..icmp
                    };
                    self.stats.echo_replies += 1;
                    self.send_packet(ctx, Ipv4Packet::new(local, packet.src, IPPROTO_ICMP, reply.to_bytes()), out);
                }
                Ok(_) => {}
                Err(PacketError::BadChecksum(_)) => self.stats.checksum_errors += 1,
                Err(_) => self.stats.dropped_frames += 1,
            },
            IPPROTO_TCP => match TcpSegment::parse(&packet.payload, packet.src, packet.dst, validate) {
                Ok(segment) => {
                    let replies = match self.sinks.get_mut(&segment.dst_port) {
                        Some(sink) => sink.on_segment(ctx, packet.src, local, &segment),
                        None if segment.has(TCP_RST) => Vec::new(),
                        None => {
                            log_debug!(ctx, "connection to closed port {} from {}", segment.dst_port, packet.src);
                            self.stats.tcp_resets += 1;
                            vec![reset_for(segment.dst_port, &segment)]
                        }
                    };
                    for reply in replies {
                        let payload = reply.to_bytes(local, packet.src);
                        self.send_packet(ctx, Ipv4Packet::new(local, packet.src, IPPROTO_TCP, payload), out);
                    }
                }
                Err(PacketError::BadChecksum(_)) => self.stats.checksum_errors += 1,
                Err(_) => self.stats.dropped_frames += 1,
            },
            _ => self.stats.dropped_frames += 1,
        }
    }

    fn send_icmp_error(
        &mut self,
        ctx: &SimulationContext,
        address: Ipv4Addr,
        icmp_type: u8,
        code: u8,
        offending: &Ipv4Packet,
        out: &mut Vec<Outgoing>,
    ) {
        // errors are never sent about ICMP errors
        if offending.protocol == IPPROTO_ICMP && offending.payload.first().map_or(false, |t| *t != ICMP_ECHO_REQUEST)
        {
            return;
        }
        self.stats.icmp_errors += 1;
        let icmp = IcmpPacket::error(icmp_type, code, offending);
        self.send_packet(ctx, Ipv4Packet::new(address, offending.src, IPPROTO_ICMP, icmp.to_bytes()), out);
    }

    fn send_packet(&mut self, ctx: &SimulationContext, mut packet: Ipv4Packet, out: &mut Vec<Outgoing>) {
        packet.identification = self.next_ip_id;
        self.next_ip_id = self.next_ip_id.wrapping_add(1);
        match self.routes.lookup(packet.dst).cloned() {
            Some(route) => {
                let next_hop = route.gateway.unwrap_or(packet.dst);
                self.route_packet(ctx, route.device, next_hop, None, packet, out);
            }
            None => log_debug!(ctx, "{}", NetworkError::UnreachableDestination(packet.dst)),
        }
    }

    fn route_packet(
        &mut self,
        ctx: &SimulationContext,
        device: DeviceId,
        next_hop: Ipv4Addr,
        ingress: Option<Ipv4Addr>,
        packet: Ipv4Packet,
        out: &mut Vec<Outgoing>,
    ) {
        if let Some(mac) = self.arp_cache.get(&next_hop).copied() {
            self.emit_packet(device, mac, packet, ingress.is_some(), out);
            return;
        }
        if let Some(resolution) = self.pending.get_mut(&next_hop) {
            if resolution.waiting.len() < ARP_PENDING_LIMIT {
                resolution.waiting.push_back((ingress, packet));
            } else {
                log_debug!(ctx, "ARP queue of {} is full, dropped packet from {}", next_hop, packet.src);
                self.stats.unresolved_drops += 1;
            }
            return;
        }
        if !self.request_mac(ctx, device, next_hop, out) {
            return;
        }
        let timer = ctx.emit_self(ArpTimeout { address: next_hop }, ARP_RETRY_INTERVAL);
        let mut waiting = VecDeque::with_capacity(ARP_PENDING_LIMIT);
        waiting.push_back((ingress, packet));
        self.pending.insert(
            next_hop,
            Resolution {
                device,
                retries: 0,
                timer,
                waiting,
            },
        );
    }

    fn request_mac(
        &self,
        ctx: &SimulationContext,
        device: DeviceId,
        next_hop: Ipv4Addr,
        out: &mut Vec<Outgoing>,
    ) -> bool {
        let iface = match self.interface(device) {
            Some(iface) => iface,
            None => return false,
        };
        log_trace!(ctx, "ARP request for {} on device {}", next_hop, device);
        let request = ArpPacket::request(iface.mac, iface.address, next_hop);
        out.push((
            device,
            EthernetFrame::new(MacAddr::BROADCAST, iface.mac, ETHERTYPE_ARP, request.to_bytes()).to_bytes(),
        ));
        true
    }

    /// Handles expiration of the ARP retry timer of the next hop, returns the frames to transmit.
    pub fn on_arp_timeout(&mut self, ctx: &SimulationContext, next_hop: Ipv4Addr) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let mut resolution = match self.pending.remove(&next_hop) {
            Some(resolution) => resolution,
            None => return out,
        };
        if resolution.retries < ARP_MAX_RETRIES {
            resolution.retries += 1;
            self.request_mac(ctx, resolution.device, next_hop, &mut out);
            resolution.timer = ctx.emit_self(ArpTimeout { address: next_hop }, ARP_RETRY_INTERVAL);
            self.pending.insert(next_hop, resolution);
            return out;
        }
        log_debug!(
            ctx,
            "{} unresolved after {} retries, dropped {} packets",
            next_hop,
            resolution.retries,
            resolution.waiting.len()
        );
        for (ingress, packet) in resolution.waiting {
            self.stats.unresolved_drops += 1;
            if let Some(address) = ingress {
                self.send_icmp_error(ctx, address, ICMP_DEST_UNREACHABLE, ICMP_HOST_UNREACHABLE, &packet, &mut out);
            }
        }
        out
    }

    fn emit_packet(
        &mut self,
        device: DeviceId,
        dst_mac: MacAddr,
        packet: Ipv4Packet,
        forwarded: bool,
        out: &mut Vec<Outgoing>,
    ) {
        if let Some(iface) = self.interface(device) {
            let frame = EthernetFrame::new(dst_mac, iface.mac, ETHERTYPE_IPV4, packet.to_bytes());
            out.push((device, frame.to_bytes()));
            if forwarded {
                self.stats.forwarded_packets += 1;
            }
        }
    }
}
