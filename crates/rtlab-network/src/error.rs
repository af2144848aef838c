//! Network errors.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::device::DeviceId;
use crate::node::NodeId;

/// Errors reported while building and operating the star network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Mask is not contiguous or leaves less than two host addresses per subnet.
    #[error("invalid subnet mask {0}")]
    InvalidMask(Ipv4Addr),
    /// The star needs at least one spoke.
    #[error("spoke count must be positive")]
    InvalidSpokeCount,
    /// Not enough subnets for the requested spoke count.
    #[error("address space exhausted: requested {requested} subnets, only {available} available")]
    AddressSpaceExhausted {
        /// Requested number of subnets.
        requested: usize,
        /// Number of subnets available after the base address.
        available: usize,
    },
    /// No route matches the destination address.
    #[error("no route to {0}")]
    UnreachableDestination(Ipv4Addr),
    /// Operation requires a processed protocol stack, which only the hub carries.
    #[error("node {0} does not carry a processed protocol stack")]
    UnsupportedNode(NodeId),
    /// Device with such id does not exist.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    /// A sink is already listening on the port.
    #[error("port {0} is already in use")]
    PortInUse(u16),
    /// Data rate string can not be parsed.
    #[error("invalid data rate '{0}'")]
    InvalidDataRate(String),
}
