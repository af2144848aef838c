use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use env_logger::Builder;
use rstest::rstest;
use sugars::{rc, refcell};

use rtlab_core::{FastForwardPacer, Simulation};
use rtlab_network::packet::*;
use rtlab_network::{
    populate_routes, AddressPlan, DataRate, DeviceId, Direction, LinkSpec, MacAddr, MemoryTrace, NetworkError,
    StarNetwork, StarTopology,
};
use rtlab_tap::{BridgeError, BridgeHandle, BridgeMode, MemoryTapBackend, TapBridge, TapBridgeConfig, TapPeer};

const WAIT: Duration = Duration::from_secs(2);

fn tap_mac() -> MacAddr {
    "02:00:00:00:00:aa".parse().unwrap()
}

fn init_logger() {
    let _ = Builder::from_default_env().is_test(true).try_init();
}

struct Star {
    sim: Simulation,
    net: Rc<RefCell<StarNetwork>>,
    topology: Rc<StarTopology>,
    trace: MemoryTrace,
}

fn star(sim: Simulation, n: usize) -> Star {
    init_logger();
    let mut sim = sim;
    let plan = AddressPlan::new(Ipv4Addr::new(10, 1, 0, 0), Ipv4Addr::new(255, 255, 255, 0)).unwrap();
    let spec = LinkSpec::new(DataRate::from_bps(100_000_000), 0.001);
    let topology = rc!(StarTopology::build(n, spec, &plan).unwrap());
    let routes = rc!(populate_routes(&topology));
    let net = rc!(refcell!(StarNetwork::new(topology.clone(), routes, sim.create_context("net"))));
    sim.add_handler("net", net.clone());
    let trace = MemoryTrace::new();
    net.borrow_mut().add_trace(Box::new(trace.clone()));
    Star {
        sim,
        net,
        topology,
        trace,
    }
}

fn attach(
    star: &mut Star,
    config: TapBridgeConfig,
    device: DeviceId,
    backend: &MemoryTapBackend,
) -> Result<BridgeHandle, BridgeError> {
    TapBridge::attach(&mut star.sim, &star.net, config, device, backend)
}

fn arp_request(star: &Star, spoke: usize, sender_mac: MacAddr) -> Vec<u8> {
    let arp = ArpPacket::request(sender_mac, star.topology.spoke_address(spoke), star.topology.hub_address(spoke));
    EthernetFrame::new(MacAddr::BROADCAST, sender_mac, ETHERTYPE_ARP, arp.to_bytes()).to_bytes()
}

fn echo_request(star: &Star, spoke: usize, src_mac: MacAddr, seq: u16) -> Vec<u8> {
    let icmp = IcmpPacket::echo_request(7, seq, vec![seq as u8; 16]);
    let ip = Ipv4Packet::new(
        star.topology.spoke_address(spoke),
        star.topology.hub_address(spoke),
        IPPROTO_ICMP,
        icmp.to_bytes(),
    );
    let hub_mac = star.topology.hub_device(spoke).mac;
    EthernetFrame::new(hub_mac, src_mac, ETHERTYPE_IPV4, ip.to_bytes()).to_bytes()
}

fn collect(peer: &TapPeer, count: usize) -> Vec<EthernetFrame> {
    let mut frames = Vec::new();
    while frames.len() < count {
        match peer.recv_timeout(WAIT) {
            Some(frame) => frames.push(EthernetFrame::parse(&frame).unwrap()),
            None => break,
        }
    }
    frames
}

#[test]
fn fast_forward_simulation_rejected() {
    let mut star = star(Simulation::with_pacer(1, Box::new(FastForwardPacer::new())), 1);
    let backend = MemoryTapBackend::new();
    let _peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0).id;
    let res = attach(&mut star, TapBridgeConfig::new("tap-left"), device, &backend);
    assert!(matches!(res, Err(BridgeError::NotRealtime)));
}

#[test]
fn missing_device_unavailable() {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let device = star.topology.spoke_device(0).id;
    let res = attach(&mut star, TapBridgeConfig::new("tap-left"), device, &backend);
    match res {
        Err(BridgeError::DeviceUnavailable { name, .. }) => assert_eq!(name, "tap-left"),
        _ => panic!("expected DeviceUnavailable"),
    }
}

#[test]
fn device_opened_once() {
    let mut star = star(Simulation::new(1), 2);
    let backend = MemoryTapBackend::new();
    let _peer = backend.create("tap-left");
    let first = star.topology.spoke_device(0).id;
    let second = star.topology.spoke_device(1).id;
    let handle = attach(&mut star, TapBridgeConfig::new("tap-left"), first, &backend).unwrap();
    let res = attach(&mut star, TapBridgeConfig::new("tap-left"), second, &backend);
    assert!(matches!(res, Err(BridgeError::DeviceUnavailable { .. })));
    handle.close();
}

#[test]
fn unknown_simulated_device() {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let _peer = backend.create("tap-left");
    let res = attach(&mut star, TapBridgeConfig::new("tap-left"), 999, &backend);
    assert!(matches!(res, Err(BridgeError::Network(NetworkError::UnknownDevice(999)))));
}

#[test]
fn arp_resolved_through_tap() {
    let mut star = star(Simulation::new(1), 2);
    let backend = MemoryTapBackend::new();
    let peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0).id;
    let handle = attach(&mut star, TapBridgeConfig::new("tap-left"), device, &backend).unwrap();

    star.sim.start().unwrap();
    assert!(peer.send(arp_request(&star, 0, tap_mac())));
    let stats = star.sim.run_until(0.2).unwrap();
    assert_eq!(star.sim.time(), 0.2);

    let frames = collect(&peer, 1);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].dst, tap_mac());
    assert_eq!(frames[0].src, star.topology.hub_device(0).mac);
    let reply = ArpPacket::parse(&frames[0].payload).unwrap();
    assert_eq!(reply.op, ARP_REPLY);
    assert_eq!(reply.sender_ip, star.topology.hub_address(0));
    assert_eq!(star.net.borrow().stats().hub.arp_replies, 1);

    // frame crossed the spoke link in both directions
    let tx = star.trace.device_records(device, Direction::Tx);
    let rx = star.trace.device_records(device, Direction::Rx);
    assert_eq!(tx.len(), 1);
    assert_eq!(rx.len(), 1);
    assert!(rx[0].time <= 0.2);
    assert!(stats.max_lag >= 0.);

    star.sim.destroy().unwrap();
    assert!(handle.is_closed());
    let bridge_stats = handle.stats();
    assert_eq!(bridge_stats.frames_from_tap, 1);
    assert_eq!(bridge_stats.frames_to_tap, 1);
    assert_eq!(bridge_stats.bytes_to_tap, 42);
}

#[test]
fn order_preserved_per_direction() {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0).id;
    let handle = attach(&mut star, TapBridgeConfig::new("tap-left"), device, &backend).unwrap();

    star.sim.start().unwrap();
    assert!(peer.send(arp_request(&star, 0, tap_mac())));
    for seq in 1..=5 {
        assert!(peer.send(echo_request(&star, 0, tap_mac(), seq)));
    }
    star.sim.run_until(0.3).unwrap();

    let frames = collect(&peer, 6);
    assert_eq!(frames.len(), 6);
    assert_eq!(frames[0].ethertype, ETHERTYPE_ARP);
    let seqs: Vec<u16> = frames[1..]
        .iter()
        .map(|f| {
            let ip = Ipv4Packet::parse(&f.payload, true).unwrap();
            let icmp = IcmpPacket::parse(&ip.payload, true).unwrap();
            assert_eq!(icmp.icmp_type, ICMP_ECHO_REPLY);
            u16::from_be_bytes([icmp.rest[2], icmp.rest[3]])
        })
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    // frames were transmitted onto the link in the order they were read
    let sent: Vec<Vec<u8>> = star
        .trace
        .device_records(device, Direction::Tx)
        .into_iter()
        .map(|r| r.frame)
        .collect();
    assert_eq!(sent.len(), 6);
    assert_eq!(sent[1], echo_request(&star, 0, tap_mac(), 1));
    assert_eq!(sent[5], echo_request(&star, 0, tap_mac(), 5));

    star.sim.destroy().unwrap();
    assert_eq!(handle.stats().frames_from_tap, 6);
    assert_eq!(handle.stats().frames_to_tap, 6);
}

#[test]
fn closed_bridge_rejects_frames() {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0).id;
    let handle = attach(&mut star, TapBridgeConfig::new("tap-left"), device, &backend).unwrap();

    handle.send(vec![1; 60]).unwrap();
    handle.close();
    handle.close();
    assert!(handle.is_closed());
    assert!(matches!(handle.send(vec![2; 60]), Err(BridgeError::Closed)));

    // queued frame is written before the writer stops
    assert_eq!(peer.drain(), vec![vec![1; 60]]);
    assert_eq!(handle.stats().frames_to_tap, 1);
    // external side is released
    assert!(!peer.send(vec![3; 60]));
}

#[test]
fn virtual_mac_rewrites_addresses() {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0);
    let config = TapBridgeConfig::new("tap-left").with_mode(BridgeMode::VirtualMac);
    let handle = TapBridge::attach(&mut star.sim, &star.net, config, device.id, &backend).unwrap();

    star.sim.start().unwrap();
    assert!(peer.send(arp_request(&star, 0, tap_mac())));
    assert!(peer.send(echo_request(&star, 0, tap_mac(), 1)));
    star.sim.run_until(0.2).unwrap();

    // the link only sees the device address
    let sent = star.trace.device_records(device.id, Direction::Tx);
    assert_eq!(sent.len(), 2);
    for record in &sent {
        assert_eq!(frame_src(&record.frame), Some(device.mac));
    }
    let arp = ArpPacket::parse(&EthernetFrame::parse(&sent[0].frame).unwrap().payload).unwrap();
    assert_eq!(arp.sender_mac, device.mac);
    assert_eq!(star.net.borrow().hub_arp_entry(device.address), Some(device.mac));

    // replies come back addressed to the tap
    let frames = collect(&peer, 2);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.dst == tap_mac()));
    let reply = ArpPacket::parse(&frames[0].payload).unwrap();
    assert_eq!(reply.target_mac, tap_mac());

    star.sim.destroy().unwrap();
    assert_eq!(handle.stats().filtered_frames, 0);
}

#[rstest]
#[case::to_device(None)]
#[case::to_foreign_host(Some("02:00:00:00:00:bb"))]
#[case::broadcast(Some("ff:ff:ff:ff:ff:ff"))]
fn transparent_bridge_relays_hub_frames_unchanged(#[case] dst: Option<&str>) {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0);
    let config = TapBridgeConfig::new("tap-left").with_mac(tap_mac());
    let handle = TapBridge::attach(&mut star.sim, &star.net, config, device.id, &backend).unwrap();
    let hub = star.topology.hub_device(0);
    let dst = dst.map_or(device.mac, |mac| mac.parse().unwrap());

    let mut ip = Ipv4Packet::new(hub.address, device.address, IPPROTO_UDP, vec![5; 32]);
    ip.tos = 0x10;
    ip.flags_fragment = IPV4_DONT_FRAGMENT;
    ip.options = vec![0x01, 0x01, 0x01, 0x00];
    let frame = EthernetFrame::new(dst, hub.mac, ETHERTYPE_IPV4, ip.to_bytes()).to_bytes();

    star.sim.start().unwrap();
    star.net.borrow_mut().transmit(hub.id, frame.clone()).unwrap();
    star.sim.run_until(0.1).unwrap();

    assert_eq!(peer.recv_timeout(WAIT), Some(frame));
    star.sim.destroy().unwrap();
    assert_eq!(handle.stats().frames_to_tap, 1);
    assert_eq!(handle.stats().filtered_frames, 0);
}

#[test]
fn virtual_mac_filters_foreign_frames() {
    let mut star = star(Simulation::new(1), 1);
    let backend = MemoryTapBackend::new();
    let peer = backend.create("tap-left");
    let device = star.topology.spoke_device(0);
    let config = TapBridgeConfig::new("tap-left")
        .with_mode(BridgeMode::VirtualMac)
        .with_mac(tap_mac());
    let handle = TapBridge::attach(&mut star.sim, &star.net, config, device.id, &backend).unwrap();
    let hub = star.topology.hub_device(0).id;
    let hub_mac = star.topology.hub_device(0).mac;
    let other: MacAddr = "02:00:00:00:00:bb".parse().unwrap();

    star.sim.start().unwrap();
    // sent by the hub side, seen by the promiscuous spoke device
    star.net
        .borrow_mut()
        .transmit(hub, EthernetFrame::new(other, hub_mac, 0x88b5, vec![1; 46]).to_bytes())
        .unwrap();
    star.net
        .borrow_mut()
        .transmit(hub, EthernetFrame::new(MacAddr::BROADCAST, hub_mac, 0x88b5, vec![2; 46]).to_bytes())
        .unwrap();
    star.net
        .borrow_mut()
        .transmit(hub, EthernetFrame::new(device.mac, hub_mac, 0x88b5, vec![3; 46]).to_bytes())
        .unwrap();
    star.sim.run_until(0.1).unwrap();

    let frames = collect(&peer, 2);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].dst, MacAddr::BROADCAST);
    assert_eq!(frames[1].dst, tap_mac());
    assert_eq!(frames[1].payload, vec![3; 46]);

    star.sim.destroy().unwrap();
    assert_eq!(handle.stats().filtered_frames, 1);
}

#[test]
fn destroy_closes_bridges() {
    let mut star = star(Simulation::new(1), 2);
    let backend = MemoryTapBackend::new();
    let left = backend.create("tap-left");
    let right = backend.create("tap-right");
    let mut handles = Vec::new();
    for (i, name) in ["tap-left", "tap-right"].iter().enumerate() {
        let device = star.topology.spoke_device(i).id;
        handles.push(attach(&mut star, TapBridgeConfig::new(*name), device, &backend).unwrap());
    }
    star.sim.start().unwrap();
    star.sim.run_until(0.05).unwrap();
    star.sim.destroy().unwrap();

    assert!(handles.iter().all(|h| h.is_closed()));
    assert!(!left.send(vec![0; 60]));
    assert!(!right.send(vec![0; 60]));
}
