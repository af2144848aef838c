use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use env_logger::Builder;
use rstest::rstest;
use sugars::{rc, refcell};

use rtlab_core::{cast, Event, EventHandler, FastForwardPacer, Simulation, SimulationContext};
use rtlab_network::packet::*;
use rtlab_network::{
    populate_routes, AddressPlan, DataRate, DeviceId, Direction, FrameReceived, LinkSpec, MacAddr, MemoryTrace,
    PcapTrace, StarNetwork, StarTopology, ARP_MAX_RETRIES, ARP_PENDING_LIMIT, ARP_RETRY_INTERVAL,
};

const RATE_BPS: u64 = 8_000_000;
const DELAY: f64 = 0.01;

fn init_logger() {
    let _ = Builder::from_default_env().is_test(true).try_init();
}

/// External host behind a spoke device: records received frames and answers ARP for its address.
struct Host {
    net: Rc<RefCell<StarNetwork>>,
    device: DeviceId,
    mac: MacAddr,
    address: Ipv4Addr,
    // number of ARP requests left unanswered before replying
    ignored_arp: usize,
    received: Vec<(f64, Vec<u8>)>,
    ctx: SimulationContext,
}

impl EventHandler for Host {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            FrameReceived { device, frame } => {
                assert_eq!(device, self.device);
                if let Ok(eth) = EthernetFrame::parse(&frame) {
                    if eth.ethertype == ETHERTYPE_ARP {
                        let arp = ArpPacket::parse(&eth.payload).unwrap();
                        if arp.op == ARP_REQUEST && arp.target_ip == self.address && self.ignored_arp > 0 {
                            self.ignored_arp -= 1;
                        } else if arp.op == ARP_REQUEST && arp.target_ip == self.address {
                            let reply = arp.reply(self.mac);
                            let reply_frame =
                                EthernetFrame::new(arp.sender_mac, self.mac, ETHERTYPE_ARP, reply.to_bytes());
                            self.net.borrow_mut().transmit(self.device, reply_frame.to_bytes()).unwrap();
                        }
                    }
                }
                self.received.push((self.ctx.time(), frame));
            }
        })
    }
}

struct Star {
    sim: Simulation,
    net: Rc<RefCell<StarNetwork>>,
    topology: Rc<StarTopology>,
    hosts: Vec<Rc<RefCell<Host>>>,
    trace: MemoryTrace,
}

impl Star {
    fn new(n: usize) -> Self {
        init_logger();
        let mut sim = Simulation::with_pacer(123, Box::new(FastForwardPacer::new()));
        let plan = AddressPlan::new(Ipv4Addr::new(10, 12, 0, 0), Ipv4Addr::new(255, 255, 255, 0)).unwrap();
        let spec = LinkSpec::new(DataRate::from_bps(RATE_BPS), DELAY);
        let topology = rc!(StarTopology::build(n, spec, &plan).unwrap());
        let routes = rc!(populate_routes(&topology));
        let net = rc!(refcell!(StarNetwork::new(
            topology.clone(),
            routes,
            sim.create_context("net")
        )));
        sim.add_handler("net", net.clone());
        let trace = MemoryTrace::new();
        net.borrow_mut().add_trace(Box::new(trace.clone()));

        let mut hosts = Vec::new();
        for i in 0..n {
            let device = topology.spoke_device(i);
            let name = format!("host-{}", i);
            let host = rc!(refcell!(Host {
                net: net.clone(),
                device: device.id,
                mac: device.mac,
                address: device.address,
                ignored_arp: 0,
                received: Vec::new(),
                ctx: sim.create_context(&name),
            }));
            let id = sim.add_handler(&name, host.clone());
            net.borrow_mut().attach_listener(device.id, id).unwrap();
            hosts.push(host);
        }
        sim.start().unwrap();
        Self {
            sim,
            net,
            topology,
            hosts,
            trace,
        }
    }

    fn settle(&mut self) {
        while self.sim.step() {}
    }

    fn send(&mut self, spoke: usize, frame: Vec<u8>) {
        let device = self.topology.spoke_device(spoke).id;
        self.net.borrow_mut().transmit(device, frame).unwrap();
    }

    fn send_ip(&mut self, spoke: usize, packet: Ipv4Packet) {
        let hub_mac = self.topology.hub_device(spoke).mac;
        let mac = self.topology.spoke_device(spoke).mac;
        self.send(
            spoke,
            EthernetFrame::new(hub_mac, mac, ETHERTYPE_IPV4, packet.to_bytes()).to_bytes(),
        );
    }

    fn forward(&mut self, from: usize, to: usize, payload: Vec<u8>) -> Ipv4Packet {
        let packet = Ipv4Packet::new(
            self.topology.spoke_address(from),
            self.topology.spoke_address(to),
            IPPROTO_UDP,
            payload,
        );
        self.send_ip(from, packet.clone());
        packet
    }

    fn ip_frames(&self, spoke: usize) -> Vec<Ipv4Packet> {
        self.received(spoke)
            .iter()
            .filter(|f| f.ethertype == ETHERTYPE_IPV4)
            .map(|f| Ipv4Packet::parse(&f.payload, true).unwrap())
            .collect()
    }

    fn arp_times(&self, spoke: usize) -> Vec<f64> {
        self.hosts[spoke]
            .borrow()
            .received
            .iter()
            .filter(|(_, f)| EthernetFrame::parse(f).unwrap().ethertype == ETHERTYPE_ARP)
            .map(|(time, _)| *time)
            .collect()
    }

    fn send_tcp(&mut self, spoke: usize, segment: TcpSegment) {
        let src = self.topology.spoke_address(spoke);
        let dst = self.topology.hub_address(spoke);
        let payload = segment.to_bytes(src, dst);
        self.send_ip(spoke, Ipv4Packet::new(src, dst, IPPROTO_TCP, payload));
    }

    fn received(&self, spoke: usize) -> Vec<EthernetFrame> {
        self.hosts[spoke]
            .borrow()
            .received
            .iter()
            .map(|(_, f)| EthernetFrame::parse(f).unwrap())
            .collect()
    }

    fn last_ip(&self, spoke: usize) -> Ipv4Packet {
        let frames = self.received(spoke);
        let frame = frames.iter().rev().find(|f| f.ethertype == ETHERTYPE_IPV4).unwrap();
        Ipv4Packet::parse(&frame.payload, true).unwrap()
    }

    fn last_tcp(&self, spoke: usize) -> TcpSegment {
        let packet = self.last_ip(spoke);
        TcpSegment::parse(&packet.payload, packet.src, packet.dst, true).unwrap()
    }
}

fn opaque_frame(dst: MacAddr, src: MacAddr, len: usize) -> Vec<u8> {
    EthernetFrame::new(dst, src, 0x88b5, vec![0; len - 14]).to_bytes()
}

// Links -------------------------------------------------------------------------------------------------------------

#[test]
fn test_link_serializes_frames_in_fifo_order() {
    let mut star = Star::new(1);
    let hub_dev = star.topology.hub_device(0).clone();
    let spoke_dev = star.topology.spoke_device(0).clone();
    // 1000 bytes take 1 ms at 8 Mbps
    star.send(0, opaque_frame(hub_dev.mac, spoke_dev.mac, 1000));
    star.send(0, opaque_frame(hub_dev.mac, spoke_dev.mac, 1000));
    star.settle();

    let arrivals: Vec<f64> = star
        .trace
        .device_records(hub_dev.id, Direction::Rx)
        .iter()
        .map(|r| r.time)
        .collect();
    assert_eq!(arrivals.len(), 2);
    assert!((arrivals[0] - 0.011).abs() < 1e-9);
    assert!((arrivals[1] - 0.012).abs() < 1e-9);
    assert_eq!(star.trace.device_records(spoke_dev.id, Direction::Tx).len(), 2);
}

#[test]
fn test_half_duplex_medium_is_shared_by_both_directions() {
    let mut star = Star::new(1);
    let hub_dev = star.topology.hub_device(0).clone();
    let spoke_dev = star.topology.spoke_device(0).clone();
    star.send(0, opaque_frame(hub_dev.mac, spoke_dev.mac, 1000));
    star.net
        .borrow_mut()
        .transmit(hub_dev.id, opaque_frame(spoke_dev.mac, hub_dev.mac, 1000))
        .unwrap();
    assert!((star.net.borrow().busy_until(0) - 0.002).abs() < 1e-9);
    star.settle();

    let received = star.hosts[0].borrow().received.clone();
    assert_eq!(received.len(), 1);
    assert!((received[0].0 - 0.012).abs() < 1e-9);
}

#[test]
fn test_spoke_device_is_promiscuous() {
    let mut star = Star::new(1);
    let hub_dev = star.topology.hub_device(0).clone();
    let frame = opaque_frame(MacAddr::allocate(42), hub_dev.mac, 100);
    star.net.borrow_mut().transmit(hub_dev.id, frame.clone()).unwrap();
    star.settle();
    assert_eq!(star.hosts[0].borrow().received[0].1, frame);
}

// Hub stack ---------------------------------------------------------------------------------------------------------

#[test]
fn test_arp_request_for_hub_is_answered() {
    let mut star = Star::new(2);
    let spoke_dev = star.topology.spoke_device(1).clone();
    let hub_dev = star.topology.hub_device(1).clone();
    let request = ArpPacket::request(spoke_dev.mac, spoke_dev.address, hub_dev.address);
    star.send(
        1,
        EthernetFrame::new(MacAddr::BROADCAST, spoke_dev.mac, ETHERTYPE_ARP, request.to_bytes()).to_bytes(),
    );
    star.settle();

    let frames = star.received(1);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].dst, spoke_dev.mac);
    assert_eq!(frames[0].src, hub_dev.mac);
    let reply = ArpPacket::parse(&frames[0].payload).unwrap();
    assert_eq!(reply.op, ARP_REPLY);
    assert_eq!(reply.sender_ip, Ipv4Addr::new(10, 12, 1, 1));
    assert_eq!(reply.sender_mac, hub_dev.mac);
    assert_eq!(reply.target_ip, spoke_dev.address);
    assert_eq!(star.net.borrow().stats().hub.arp_replies, 1);
}

#[test]
fn test_echo_request_is_answered() {
    let mut star = Star::new(1);
    let src = star.topology.spoke_address(0);
    let dst = star.topology.hub_address(0);
    let echo = IcmpPacket::echo_request(7, 3, b"ping".to_vec());
    star.send_ip(0, Ipv4Packet::new(src, dst, IPPROTO_ICMP, echo.to_bytes()));
    star.settle();

    let reply_ip = star.last_ip(0);
    assert_eq!(reply_ip.src, dst);
    assert_eq!(reply_ip.dst, src);
    let reply = IcmpPacket::parse(&reply_ip.payload, true).unwrap();
    assert_eq!(reply.icmp_type, ICMP_ECHO_REPLY);
    assert_eq!(reply.rest, echo.rest);
    assert_eq!(reply.payload, b"ping".to_vec());
}

#[test]
fn test_hub_forwards_between_spokes() {
    let mut star = Star::new(2);
    let src = star.topology.spoke_address(0);
    let dst = star.topology.spoke_address(1);
    let mut packet = Ipv4Packet::new(src, dst, IPPROTO_UDP, vec![1, 2, 3, 4]);
    packet.identification = 99;
    star.send_ip(0, packet);
    star.settle();

    // the hub resolves the next hop first
    let frames = star.received(1);
    assert_eq!(frames[0].ethertype, ETHERTYPE_ARP);
    assert_eq!(frames[0].dst, MacAddr::BROADCAST);
    assert_eq!(star.net.borrow().stats().hub.forwarded_packets, 1);

    let forwarded = frames.iter().find(|f| f.ethertype == ETHERTYPE_IPV4).unwrap();
    assert_eq!(forwarded.src, star.topology.hub_device(1).mac);
    assert_eq!(forwarded.dst, star.topology.spoke_device(1).mac);
    let ip = Ipv4Packet::parse(&forwarded.payload, true).unwrap();
    assert_eq!(ip.ttl, DEFAULT_TTL - 1);
    assert_eq!(ip.src, src);
    assert_eq!(ip.identification, 99);
    assert_eq!(ip.payload, vec![1, 2, 3, 4]);
}

#[rstest]
#[case::dont_fragment(IPV4_DONT_FRAGMENT)]
#[case::first_fragment(IPV4_MORE_FRAGMENTS)]
#[case::middle_fragment(IPV4_MORE_FRAGMENTS | 0x00b9)]
#[case::last_fragment(0x00b9)]
fn test_forwarding_keeps_ip_header(#[case] flags_fragment: u16) {
    let mut star = Star::new(2);
    let mut packet = Ipv4Packet::new(
        star.topology.spoke_address(0),
        star.topology.spoke_address(1),
        IPPROTO_UDP,
        vec![9; 24],
    );
    packet.tos = 0x2e;
    packet.identification = 4242;
    packet.flags_fragment = flags_fragment;
    // record route option padded with end of options
    packet.options = vec![0x07, 0x07, 0x04, 0, 0, 0, 0, 0];
    star.send_ip(0, packet.clone());
    star.settle();

    let forwarded = star.received(1).into_iter().find(|f| f.ethertype == ETHERTYPE_IPV4).unwrap();
    let mut expected = packet;
    expected.ttl -= 1;
    assert_eq!(forwarded.payload, expected.to_bytes());
    assert_eq!(forwarded.payload[0], 0x47);
    assert_eq!(Ipv4Packet::parse(&forwarded.payload, true).unwrap(), expected);
}

#[rstest]
#[case::more_fragments(IPV4_MORE_FRAGMENTS)]
#[case::offset(0x0001)]
fn test_fragments_to_hub_are_dropped(#[case] flags_fragment: u16) {
    let mut star = Star::new(1);
    let echo = IcmpPacket::echo_request(7, 1, vec![0; 16]);
    let mut packet = Ipv4Packet::new(
        star.topology.spoke_address(0),
        star.topology.hub_address(0),
        IPPROTO_ICMP,
        echo.to_bytes(),
    );
    packet.flags_fragment = flags_fragment;
    star.send_ip(0, packet);
    star.settle();

    assert!(star.received(0).is_empty());
    let stats = star.net.borrow().stats().hub;
    assert_eq!(stats.echo_replies, 0);
    assert_eq!(stats.dropped_frames, 1);
}

#[test]
fn test_arp_request_is_retried() {
    let mut star = Star::new(2);
    star.hosts[1].borrow_mut().ignored_arp = 2;
    star.forward(0, 1, vec![1]);
    star.settle();

    let arp_times = star.arp_times(1);
    assert_eq!(arp_times.len(), 3);
    assert!(arp_times[1] - arp_times[0] >= ARP_RETRY_INTERVAL - 1e-9);
    assert!(arp_times[2] - arp_times[1] >= ARP_RETRY_INTERVAL - 1e-9);
    let delivered = star.ip_frames(1);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, vec![1]);

    let stats = star.net.borrow().stats().hub;
    assert_eq!(stats.forwarded_packets, 1);
    assert_eq!(stats.unresolved_drops, 0);
}

#[test]
fn test_packets_awaiting_arp_are_bounded() {
    let mut star = Star::new(2);
    star.hosts[1].borrow_mut().ignored_arp = 1;
    for i in 0..5 {
        star.forward(0, 1, vec![i]);
    }
    star.settle();

    let payloads: Vec<Vec<u8>> = star.ip_frames(1).into_iter().map(|p| p.payload).collect();
    assert_eq!(payloads.len(), ARP_PENDING_LIMIT);
    assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);

    let stats = star.net.borrow().stats().hub;
    assert_eq!(stats.forwarded_packets, 3);
    assert_eq!(stats.unresolved_drops, 2);
}

#[test]
fn test_unresolved_next_hop_is_reported_to_sender() {
    let mut star = Star::new(2);
    star.hosts[1].borrow_mut().ignored_arp = usize::MAX;
    star.forward(0, 1, vec![0; 8]);
    star.settle();

    assert_eq!(star.arp_times(1).len(), 1 + ARP_MAX_RETRIES as usize);
    assert!(star.ip_frames(1).is_empty());

    let ip = star.last_ip(0);
    assert_eq!(ip.src, star.topology.hub_address(0));
    let icmp = IcmpPacket::parse(&ip.payload, true).unwrap();
    assert_eq!(icmp.icmp_type, ICMP_DEST_UNREACHABLE);
    assert_eq!(icmp.code, ICMP_HOST_UNREACHABLE);
    assert!(star.sim.time() >= (1 + ARP_MAX_RETRIES) as f64 * ARP_RETRY_INTERVAL);

    let stats = star.net.borrow().stats().hub;
    assert_eq!(stats.forwarded_packets, 0);
    assert_eq!(stats.unresolved_drops, 1);
    assert_eq!(stats.icmp_errors, 1);
}

#[test]
fn test_unreachable_destination_is_reported_to_sender() {
    let mut star = Star::new(1);
    let src = star.topology.spoke_address(0);
    let outside = Ipv4Addr::new(192, 168, 5, 5);
    star.send_ip(0, Ipv4Packet::new(src, outside, IPPROTO_UDP, vec![0; 8]));
    star.settle();

    let ip = star.last_ip(0);
    assert_eq!(ip.src, star.topology.hub_address(0));
    let icmp = IcmpPacket::parse(&ip.payload, true).unwrap();
    assert_eq!(icmp.icmp_type, ICMP_DEST_UNREACHABLE);
    assert_eq!(icmp.code, ICMP_NET_UNREACHABLE);
    assert_eq!(star.net.borrow().stats().hub.icmp_errors, 1);
}

#[test]
fn test_expired_ttl_is_reported_to_sender() {
    let mut star = Star::new(2);
    let mut packet = Ipv4Packet::new(
        star.topology.spoke_address(0),
        star.topology.spoke_address(1),
        IPPROTO_UDP,
        vec![0; 8],
    );
    packet.ttl = 1;
    star.send_ip(0, packet);
    star.settle();

    let icmp = IcmpPacket::parse(&star.last_ip(0).payload, true).unwrap();
    assert_eq!(icmp.icmp_type, ICMP_TIME_EXCEEDED);
    assert!(star.received(1).is_empty());
}

#[test]
fn test_corrupted_checksum_is_dropped() {
    let mut star = Star::new(1);
    let src = star.topology.spoke_address(0);
    let dst = star.topology.hub_address(0);
    let echo = IcmpPacket::echo_request(1, 1, vec![]);
    let mut bytes = Ipv4Packet::new(src, dst, IPPROTO_ICMP, echo.to_bytes()).to_bytes();
    bytes[10] ^= 0x5a;
    let hub_mac = star.topology.hub_device(0).mac;
    let mac = star.topology.spoke_device(0).mac;
    star.send(0, EthernetFrame::new(hub_mac, mac, ETHERTYPE_IPV4, bytes).to_bytes());
    star.settle();

    assert!(star.received(0).is_empty());
    assert_eq!(star.net.borrow().stats().hub.checksum_errors, 1);
}

// Traffic sink ------------------------------------------------------------------------------------------------------

#[rstest]
#[case::single_spoke(1, 0)]
#[case::second_spoke(2, 1)]
fn test_sink_accepts_and_discards(#[case] n: usize, #[case] spoke: usize) {
    let mut star = Star::new(n);
    let hub = star.topology.hub().id;
    star.net.borrow_mut().listen_at(hub, 5000).unwrap();

    star.send_tcp(spoke, TcpSegment::new(40000, 5000, 1000, 0, TCP_SYN));
    star.settle();
    let syn_ack = star.last_tcp(spoke);
    assert!(syn_ack.has(TCP_SYN | TCP_ACK));
    assert_eq!(syn_ack.ack, 1001);
    let isn = syn_ack.seq;

    star.send_tcp(spoke, TcpSegment::new(40000, 5000, 1001, isn.wrapping_add(1), TCP_ACK));
    let mut data = TcpSegment::new(40000, 5000, 1001, isn.wrapping_add(1), TCP_ACK | TCP_PSH);
    data.payload = b"hello".to_vec();
    star.send_tcp(spoke, data);
    star.settle();
    let ack = star.last_tcp(spoke);
    assert_eq!(ack.ack, 1006);
    assert_eq!(ack.seq, isn.wrapping_add(1));

    let stats = star.net.borrow().sink_stats(5000).unwrap();
    assert_eq!(stats.accepted_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.bytes_received, 5);

    // out of order data is re-acknowledged and not counted
    let mut gap = TcpSegment::new(40000, 5000, 2000, isn.wrapping_add(1), TCP_ACK);
    gap.payload = vec![0; 10];
    star.send_tcp(spoke, gap);
    star.settle();
    assert_eq!(star.last_tcp(spoke).ack, 1006);
    assert_eq!(star.net.borrow().sink_stats(5000).unwrap().bytes_received, 5);

    star.send_tcp(spoke, TcpSegment::new(40000, 5000, 1006, isn.wrapping_add(1), TCP_ACK | TCP_FIN));
    star.settle();
    let fin = star.last_tcp(spoke);
    assert!(fin.has(TCP_FIN | TCP_ACK));
    assert_eq!(fin.ack, 1007);

    star.send_tcp(spoke, TcpSegment::new(40000, 5000, 1007, isn.wrapping_add(2), TCP_ACK));
    star.settle();
    let stats = star.net.borrow().sink_stats(5000).unwrap();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.closed_connections, 1);
}

#[test]
fn test_closed_port_is_reset() {
    let mut star = Star::new(1);
    star.send_tcp(0, TcpSegment::new(40000, 80, 500, 0, TCP_SYN));
    star.settle();
    let rst = star.last_tcp(0);
    assert!(rst.has(TCP_RST | TCP_ACK));
    assert_eq!(rst.ack, 501);
    assert_eq!(rst.src_port, 80);
    assert_eq!(star.net.borrow().stats().hub.tcp_resets, 1);
}

#[test]
fn test_sink_only_on_hub() {
    let star = Star::new(2);
    let spoke = star.topology.spoke(1).id;
    let hub = star.topology.hub().id;
    assert_eq!(
        star.net.borrow_mut().listen_at(spoke, 5000),
        Err(rtlab_network::NetworkError::UnsupportedNode(spoke))
    );
    star.net.borrow_mut().listen_at(hub, 5000).unwrap();
    assert_eq!(
        star.net.borrow_mut().listen_at(hub, 5000),
        Err(rtlab_network::NetworkError::PortInUse(5000))
    );
}

// Traces ------------------------------------------------------------------------------------------------------------

#[test]
fn test_pcap_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut star = Star::new(2);
    let pcap = PcapTrace::create(dir.path().join("star"), &star.topology).unwrap();
    let paths = pcap.paths().to_vec();
    star.net.borrow_mut().add_trace(Box::new(pcap));
    let hub_mac = star.topology.hub_device(0).mac;
    let mac = star.topology.spoke_device(0).mac;
    star.send(0, opaque_frame(hub_mac, mac, 60));
    star.settle();
    star.net.borrow_mut().release();

    assert_eq!(paths.len(), 4);
    assert!(paths.contains(&dir.path().join("star-0-0.pcap")));
    assert!(paths.contains(&dir.path().join("star-0-1.pcap")));
    assert!(paths.contains(&dir.path().join("star-2-0.pcap")));
    for path in &paths {
        let bytes = std::fs::read(path).unwrap();
        assert!(bytes.len() >= 24);
        assert_eq!(&bytes[0..4], &0xa1b2c3d4u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
    }
    // one record on the spoke device and one on the hub device of the first link
    let spoke_file = std::fs::read(dir.path().join("star-1-0.pcap")).unwrap();
    assert_eq!(spoke_file.len(), 24 + 16 + 60);
}
