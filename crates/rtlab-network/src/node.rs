//! Network node.

use serde::Serialize;

use crate::device::DeviceId;

/// Unique node id.
pub type NodeId = usize;

/// Position of a node in the star.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    /// The central node joined to every spoke.
    Hub,
    /// Spoke with specified index.
    Spoke(usize),
}

/// A node in the network.
#[derive(Clone, Debug, Serialize)]
pub struct Node {
    /// Node id.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Node role.
    pub role: NodeRole,
    /// Devices attached to the node, in creation order.
    pub devices: Vec<DeviceId>,
    /// Whether the IPv4 protocol stack is installed.
    pub stack_installed: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, role: NodeRole) -> Self {
        let name = match role {
            NodeRole::Hub => "hub".to_string(),
            NodeRole::Spoke(i) => format!("spoke-{}", i),
        };
        Self {
            id,
            name,
            role,
            devices: Vec::new(),
            stack_installed: false,
        }
    }

    /// Returns `true` for the hub node.
    pub fn is_hub(&self) -> bool {
        self.role == NodeRole::Hub
    }
}
