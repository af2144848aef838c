//! Routing algorithms and static routing tables.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::device::DeviceId;
use crate::error::NetworkError;
use crate::link::LinkId;
use crate::node::NodeId;
use crate::topology::StarTopology;

/// Source of node-level paths used to fill the routing tables.
pub trait RoutingAlgorithm {
    /// Prepares paths for the topology, called once before any [`Self::get_path`] query.
    fn init(&mut self, topology: &StarTopology);

    /// Links traversed from `src` to `dst`, empty when `src == dst` and `None` when unreachable.
    fn get_path(&self, src: NodeId, dst: NodeId, topology: &StarTopology) -> Option<Vec<LinkId>>;
}

// Lowest latency -------------------------------------------------------------------------------------------------------

/// Paths of the lowest total link delay.
///
/// Keeps one shortest-path tree per source node: `via[src][node]` is the link over which `node` is reached.
#[derive(Default)]
pub struct ShortestPathDijkstra {
    via: Vec<Vec<Option<(NodeId, LinkId)>>>,
}

// Heap key: delay bits of a non-negative f64 keep their order as u64.
fn delay_key(delay: f64) -> u64 {
    delay.max(0.).to_bits()
}

impl ShortestPathDijkstra {
    fn tree(src: NodeId, topology: &StarTopology) -> Vec<Option<(NodeId, LinkId)>> {
        let node_count = topology.node_count();
        let mut dist = vec![f64::INFINITY; node_count];
        let mut via = vec![None; node_count];
        let mut heap = BinaryHeap::new();
        dist[src] = 0.;
        heap.push(Reverse((delay_key(0.), src)));

        while let Some(Reverse((key, node))) = heap.pop() {
            if key > delay_key(dist[node]) {
                continue;
            }
            let neighbours = topology.node_links_map().get(&node).into_iter().flatten();
            for (&next, &link_id) in neighbours {
                let candidate = dist[node] + topology.link(link_id).delay;
                if candidate < dist[next] {
                    dist[next] = candidate;
                    via[next] = Some((node, link_id));
                    heap.push(Reverse((delay_key(candidate), next)));
                }
            }
        }
        via
    }
}

impl RoutingAlgorithm for ShortestPathDijkstra {
    fn init(&mut self, topology: &StarTopology) {
        self.via = (0..topology.node_count()).map(|src| Self::tree(src, topology)).collect();
    }

    fn get_path(&self, src: NodeId, dst: NodeId, _topology: &StarTopology) -> Option<Vec<LinkId>> {
        let tree = self.via.get(src)?;
        let mut links = Vec::new();
        let mut node = dst;
        while node != src {
            let (prev, link_id) = (*tree.get(node)?)?;
            links.push(link_id);
            node = prev;
        }
        links.reverse();
        Some(links)
    }
}

// Routing tables ------------------------------------------------------------------------------------------------------

/// Single entry of a routing table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    /// Destination network.
    pub destination: Ipv4Net,
    /// Next hop address, `None` for directly attached networks.
    pub gateway: Option<Ipv4Addr>,
    /// Output device.
    pub device: DeviceId,
}

impl RouteEntry {
    /// Checks whether the entry matches the address.
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        self.destination.contains(&addr)
    }
}

/// Static routing table of a single node.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

impl RoutingTable {
    /// Adds an entry unless the same destination network is already present.
    pub fn add(&mut self, entry: RouteEntry) {
        if !self.entries.iter().any(|e| e.destination == entry.destination) {
            self.entries.push(entry);
        }
    }

    /// Returns the entry with the longest prefix matching the address.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&RouteEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(addr))
            .max_by_key(|e| e.destination.prefix_len())
    }

    /// Returns all entries.
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }
}

/// Routing state of the whole topology: per-node tables and node-level paths.
pub struct Routes {
    tables: Vec<RoutingTable>,
    paths: Vec<Vec<Option<Vec<NodeId>>>>,
}

impl Routes {
    /// Returns the routing table of the node.
    pub fn table(&self, node: NodeId) -> &RoutingTable {
        &self.tables[node]
    }

    /// Returns the route used by `node` to reach `dst`.
    pub fn route(&self, node: NodeId, dst: Ipv4Addr) -> Result<&RouteEntry, NetworkError> {
        self.tables
            .get(node)
            .and_then(|table| table.lookup(dst))
            .ok_or(NetworkError::UnreachableDestination(dst))
    }

    /// Returns the sequence of nodes from `src` to `dst`, both included.
    pub fn path(&self, src: NodeId, dst: NodeId) -> Option<&[NodeId]> {
        self.paths.get(src)?.get(dst)?.as_deref()
    }

    /// Returns the node following `src` on the path to `dst`.
    pub fn next_hop(&self, src: NodeId, dst: NodeId) -> Option<NodeId> {
        self.path(src, dst)?.get(1).copied()
    }

    /// Checks whether `dst` is reachable from `src`.
    pub fn is_reachable(&self, src: NodeId, dst: NodeId) -> bool {
        self.path(src, dst).is_some()
    }
}

/// Computes shortest-path routes for every node of the topology.
pub fn populate_routes(topology: &StarTopology) -> Routes {
    let mut algorithm = ShortestPathDijkstra::default();
    populate_routes_with(topology, &mut algorithm)
}

/// Computes routes for every node of the topology with specified routing algorithm.
///
/// Every node gets direct routes for the networks of its own devices and, for every other device,
/// a route to that device's network via the next hop address on the first link of the path.
pub fn populate_routes_with(topology: &StarTopology, algorithm: &mut dyn RoutingAlgorithm) -> Routes {
    algorithm.init(topology);
    let node_count = topology.node_count();
    let mut tables = vec![RoutingTable::default(); node_count];
    let mut paths = vec![vec![None; node_count]; node_count];

    for src in 0..node_count {
        for dst in 0..node_count {
            if let Some(links) = algorithm.get_path(src, dst, topology) {
                let mut nodes = vec![src];
                for link_id in &links {
                    let link = topology.link(*link_id);
                    let last = *nodes.last().unwrap_or(&src);
                    let (a, b) = (
                        topology.devices()[link.hub_device].node,
                        topology.devices()[link.spoke_device].node,
                    );
                    nodes.push(if a == last { b } else { a });
                }
                paths[src][dst] = Some(nodes);
            }
        }

        let table = &mut tables[src];
        for device_id in &topology.node(src).devices {
            let device = &topology.devices()[*device_id];
            table.add(RouteEntry {
                destination: device.network,
                gateway: None,
                device: device.id,
            });
        }
        for device in topology.devices() {
            if device.node == src {
                continue;
            }
            let links = match algorithm.get_path(src, device.node, topology) {
                Some(links) if !links.is_empty() => links,
                _ => continue,
            };
            let first = topology.link(links[0]);
            let (out, peer) = if topology.devices()[first.hub_device].node == src {
                (first.hub_device, first.spoke_device)
            } else {
                (first.spoke_device, first.hub_device)
            };
            // networks shared with a neighbour are already covered by the direct routes
            table.add(RouteEntry {
                destination: device.network,
                gateway: Some(topology.devices()[peer].address),
                device: out,
            });
        }
    }
    Routes { tables, paths }
}
