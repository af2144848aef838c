#![warn(missing_docs)]
#![doc = include_str!("../readme.md")]

pub mod address;
pub mod device;
pub mod error;
pub mod hub;
pub mod link;
pub mod network;
pub mod node;
pub mod packet;
pub mod routing;
pub mod sink;
pub mod topology;
pub mod trace;

pub use address::{AddressPlan, Subnet};
pub use device::{Device, DeviceId, MacAddr};
pub use error::NetworkError;
pub use hub::{ArpTimeout, HubStack, HubStats, ARP_MAX_RETRIES, ARP_PENDING_LIMIT, ARP_RETRY_INTERVAL};
pub use link::{DataRate, Link, LinkId, LinkSpec};
pub use network::{FrameArrival, FrameReceived, NetworkStats, StarNetwork};
pub use node::{Node, NodeId, NodeRole};
pub use routing::{populate_routes, populate_routes_with, RouteEntry, Routes, RoutingAlgorithm, RoutingTable};
pub use sink::{PacketSink, SinkStats};
pub use topology::{StarTopology, TopologyObserver};
pub use trace::{Direction, FrameTrace, MemoryTrace, PcapTrace, TraceRecord};
