//! Passive TCP traffic sink.

use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;
use serde::Serialize;

use rtlab_core::SimulationContext;

use crate::packet::{TcpSegment, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};

/// Counters of a traffic sink.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    /// Number of completed handshakes.
    pub accepted_connections: u64,
    /// Number of connections currently open (handshake in progress included).
    pub active_connections: u64,
    /// Number of closed connections (gracefully or by reset).
    pub closed_connections: u64,
    /// Number of in-order payload bytes received and discarded.
    pub bytes_received: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    SynReceived,
    Established,
    LastAck,
}

#[derive(Debug)]
struct Connection {
    state: ConnectionState,
    isn: u32,
    // next sequence number to send
    snd_nxt: u32,
    // next expected sequence number
    rcv_nxt: u32,
}

type ConnectionKey = (Ipv4Addr, u16, Ipv4Addr);

/// Accepts TCP connections on a single port and discards everything it receives.
///
/// The sink never sends data: it completes handshakes, acknowledges in-order data,
/// re-acknowledges out-of-order data and answers the peer's FIN with its own.
pub struct PacketSink {
    port: u16,
    connections: FxHashMap<ConnectionKey, Connection>,
    stats: SinkStats,
}

impl PacketSink {
    /// Creates a sink listening on the port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            connections: FxHashMap::default(),
            stats: SinkStats::default(),
        }
    }

    /// Returns the listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the sink counters.
    pub fn stats(&self) -> SinkStats {
        let mut stats = self.stats.clone();
        stats.active_connections = self.connections.len() as u64;
        stats
    }

    /// Processes a segment sent from `remote` to `local`, returns the segments to send back.
    pub fn on_segment(
        &mut self,
        ctx: &SimulationContext,
        remote: Ipv4Addr,
        local: Ipv4Addr,
        segment: &TcpSegment,
    ) -> Vec<TcpSegment> {
        let key = (remote, segment.src_port, local);
        let port = self.port;
        let reply = |seq: u32, ack: u32, flags: u8| TcpSegment::new(port, segment.src_port, seq, ack, flags);

        if segment.has(TCP_RST) {
            if self.connections.remove(&key).is_some() {
                self.stats.closed_connections += 1;
            }
            return Vec::new();
        }

        let conn = match self.connections.get_mut(&key) {
            Some(conn) => conn,
            None => {
                if !segment.has(TCP_SYN) || segment.has(TCP_ACK) {
                    return vec![reset_for(port, segment)];
                }
                let isn: u32 = ctx.gen_range(0..u32::MAX);
                let rcv_nxt = segment.seq.wrapping_add(1);
                self.connections.insert(
                    key,
                    Connection {
                        state: ConnectionState::SynReceived,
                        isn,
                        snd_nxt: isn.wrapping_add(1),
                        rcv_nxt,
                    },
                );
                return vec![reply(isn, rcv_nxt, TCP_SYN | TCP_ACK)];
            }
        };

        if segment.has(TCP_SYN) {
            // retransmitted SYN
            if conn.state == ConnectionState::SynReceived {
                return vec![reply(conn.isn, conn.rcv_nxt, TCP_SYN | TCP_ACK)];
            }
            return vec![reply(conn.snd_nxt, conn.rcv_nxt, TCP_ACK)];
        }
        if !segment.has(TCP_ACK) {
            return Vec::new();
        }

        match conn.state {
            ConnectionState::SynReceived => {
                if segment.ack != conn.snd_nxt {
                    return vec![reset_for(port, segment)];
                }
                conn.state = ConnectionState::Established;
                self.stats.accepted_connections += 1;
            }
            ConnectionState::LastAck => {
                if segment.ack == conn.snd_nxt {
                    self.connections.remove(&key);
                    self.stats.closed_connections += 1;
                }
                return Vec::new();
            }
            ConnectionState::Established => {}
        }

        let mut replies = Vec::new();
        if !segment.payload.is_empty() || segment.has(TCP_FIN) {
            if segment.seq == conn.rcv_nxt {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(segment.payload.len() as u32);
                self.stats.bytes_received += segment.payload.len() as u64;
                if segment.has(TCP_FIN) {
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                    replies.push(reply(conn.snd_nxt, conn.rcv_nxt, TCP_ACK | TCP_FIN));
                    conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
                    conn.state = ConnectionState::LastAck;
                } else {
                    replies.push(reply(conn.snd_nxt, conn.rcv_nxt, TCP_ACK));
                }
            } else {
                // out of order or duplicate
                replies.push(reply(conn.snd_nxt, conn.rcv_nxt, TCP_ACK));
            }
        }
        replies
    }
}

/// Builds the reset answering a segment for which no connection exists.
pub fn reset_for(local_port: u16, segment: &TcpSegment) -> TcpSegment {
    if segment.has(TCP_ACK) {
        TcpSegment::new(local_port, segment.src_port, segment.ack, 0, TCP_RST)
    } else {
        TcpSegment::new(
            local_port,
            segment.src_port,
            0,
            segment.seq.wrapping_add(segment.seq_len()),
            TCP_RST | TCP_ACK,
        )
    }
}
