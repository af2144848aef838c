//! Star topology builder.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::debug;

use crate::address::{AddressPlan, Subnet};
use crate::device::{Device, DeviceId, MacAddr};
use crate::error::NetworkError;
use crate::link::{Link, LinkId, LinkSpec};
use crate::node::{Node, NodeId, NodeRole};

/// Receives notifications about created nodes, used to feed visualization.
///
/// The observer does not affect the built topology.
pub trait TopologyObserver {
    /// Called once per node, right after the node is created.
    fn on_node_created(&mut self, node: &Node);
}

struct NoObserver;

impl TopologyObserver for NoObserver {
    fn on_node_created(&mut self, _node: &Node) {}
}

/// Map from node to its neighbours and the links leading to them.
pub type LinksMap = BTreeMap<NodeId, BTreeMap<NodeId, LinkId>>;

/// Immutable star network: a hub joined by a dedicated link to each of N spokes.
///
/// The hub is node 0 and spoke `i` is node `i + 1`. For spoke `i` the link has id `i`, the hub-side
/// device has id `2 * i` and the spoke-side device has id `2 * i + 1`.
pub struct StarTopology {
    nodes: Vec<Node>,
    links: Vec<Link>,
    devices: Vec<Device>,
    subnets: Vec<Subnet>,
    node_links_map: LinksMap,
}

impl StarTopology {
    /// Builds a star with `n` spokes using the same link parameters for every spoke.
    pub fn build(n: usize, link: LinkSpec, plan: &AddressPlan) -> Result<Self, NetworkError> {
        Self::build_observed(n, link, plan, &mut NoObserver)
    }

    /// Builds a star with `n` spokes, notifying the observer about every created node.
    pub fn build_observed(
        n: usize,
        link: LinkSpec,
        plan: &AddressPlan,
        observer: &mut dyn TopologyObserver,
    ) -> Result<Self, NetworkError> {
        Self::from_subnets(plan.allocate(n)?, link, observer)
    }

    /// Builds a star with one spoke per allocated subnet, in subnet order.
    pub fn from_subnets(
        subnets: Vec<Subnet>,
        link: LinkSpec,
        observer: &mut dyn TopologyObserver,
    ) -> Result<Self, NetworkError> {
        let n = subnets.len();
        if n == 0 {
            return Err(NetworkError::InvalidSpokeCount);
        }

        let mut topology = Self {
            nodes: Vec::with_capacity(n + 1),
            links: Vec::with_capacity(n),
            devices: Vec::with_capacity(2 * n),
            subnets,
            node_links_map: BTreeMap::new(),
        };
        topology.add_node(NodeRole::Hub, observer);
        for i in 0..n {
            let spoke = topology.add_node(NodeRole::Spoke(i), observer);
            let subnet = topology.subnets[i];
            let link_id = topology.links.len();
            let hub_device = topology.add_device(0, link_id, subnet.hub, subnet.network);
            let spoke_device = topology.add_device(spoke, link_id, subnet.spoke, subnet.network);
            topology.links.push(Link {
                id: link_id,
                data_rate: link.data_rate,
                delay: link.delay,
                hub_device,
                spoke_device,
            });
            topology.node_links_map.entry(0).or_default().insert(spoke, link_id);
            topology.node_links_map.entry(spoke).or_default().insert(0, link_id);
        }
        for node in topology.nodes.iter_mut() {
            node.stack_installed = true;
        }
        debug!(
            target: "topology",
            "Built star with {} spokes, links {} / {:.6}s, first subnet {}",
            n,
            link.data_rate,
            link.delay,
            topology.subnets[0]
        );
        Ok(topology)
    }

    fn add_node(&mut self, role: NodeRole, observer: &mut dyn TopologyObserver) -> NodeId {
        let id = self.nodes.len();
        let node = Node::new(id, role);
        observer.on_node_created(&node);
        self.nodes.push(node);
        self.node_links_map.entry(id).or_default();
        id
    }

    fn add_device(&mut self, node: NodeId, link: LinkId, address: Ipv4Addr, network: Ipv4Net) -> DeviceId {
        let id = self.devices.len();
        self.devices.push(Device {
            id,
            node,
            link,
            mac: MacAddr::allocate(id as u64 + 1),
            address,
            network,
        });
        self.nodes[node].devices.push(id);
        id
    }

    /// Returns the number of spokes.
    pub fn spoke_count(&self) -> usize {
        self.links.len()
    }

    /// Returns the number of nodes (hub included).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the hub node.
    pub fn hub(&self) -> &Node {
        &self.nodes[0]
    }

    /// Returns the spoke node with specified index.
    pub fn spoke(&self, i: usize) -> &Node {
        &self.nodes[i + 1]
    }

    /// Returns the node with specified id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Returns all nodes, hub first.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns the link with specified id.
    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id]
    }

    /// Returns all links.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Returns the device with specified id.
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Returns all devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Returns the hub-side device of the link to spoke `i`.
    pub fn hub_device(&self, i: usize) -> &Device {
        &self.devices[self.links[i].hub_device]
    }

    /// Returns the device of spoke `i`.
    pub fn spoke_device(&self, i: usize) -> &Device {
        &self.devices[self.links[i].spoke_device]
    }

    /// Returns the hub address on the subnet of spoke `i`.
    pub fn hub_address(&self, i: usize) -> Ipv4Addr {
        self.subnets[i].hub
    }

    /// Returns the address of spoke `i`.
    pub fn spoke_address(&self, i: usize) -> Ipv4Addr {
        self.subnets[i].spoke
    }

    /// Returns the subnet of spoke `i`.
    pub fn subnet(&self, i: usize) -> &Subnet {
        &self.subnets[i]
    }

    /// Returns all subnets in spoke order.
    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    /// Returns the neighbours of every node with the links leading to them.
    pub fn node_links_map(&self) -> &LinksMap {
        &self.node_links_map
    }
}
