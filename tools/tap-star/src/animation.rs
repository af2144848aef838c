//! Node descriptions for visualization.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use rtlab_network::{Node, NodeRole, TopologyObserver};

const SPOKE_RING_RADIUS: f64 = 50.;

/// Description of a single node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeDescription {
    pub id: usize,
    pub description: String,
    pub color: [u8; 3],
    pub position: (f64, f64),
}

/// Collects node descriptions while the topology is built and writes them as JSON.
///
/// The hub is placed in the center, spokes are spread over a ring around it.
pub struct Animation {
    spoke_count: usize,
    nodes: Vec<NodeDescription>,
}

impl Animation {
    pub fn new(spoke_count: usize) -> Self {
        Self {
            spoke_count,
            nodes: Vec::with_capacity(spoke_count + 1),
        }
    }

    pub fn nodes(&self) -> &[NodeDescription] {
        &self.nodes
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &serde_json::json!({ "nodes": self.nodes }))?;
        writer.flush()
    }

    fn position(&self, role: NodeRole) -> (f64, f64) {
        match role {
            NodeRole::Hub => (0., 0.),
            NodeRole::Spoke(i) => {
                let angle = 2. * std::f64::consts::PI * i as f64 / self.spoke_count.max(1) as f64;
                (SPOKE_RING_RADIUS * angle.cos(), SPOKE_RING_RADIUS * angle.sin())
            }
        }
    }
}

impl TopologyObserver for Animation {
    fn on_node_created(&mut self, node: &Node) {
        let position = self.position(node.role);
        self.nodes.push(NodeDescription {
            id: node.id,
            description: format!("Node {}", node.id),
            color: [255, 0, 0],
            position,
        });
    }
}
