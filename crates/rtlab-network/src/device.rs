//! Simulated network devices.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Serialize, Serializer};

use crate::link::LinkId;
use crate::node::NodeId;

/// Unique device id.
pub type DeviceId = usize;

/// Ethernet MAC address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Broadcast address `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Returns the address allocated to the `n`-th created device (starting from 1).
    pub fn allocate(n: u64) -> Self {
        let bytes = n.to_be_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);
        Self(mac)
    }

    /// Creates an address from the first six bytes of a slice.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[..6]);
        Self(mac)
    }

    /// Returns the raw address bytes.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Checks for the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Checks the group bit (broadcast is multicast as well).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 1 == 1
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl std::str::FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(':')
            .map(|p| u8::from_str_radix(p, 16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid MAC address '{}': {}", s, e))?;
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{}'", s));
        }
        Ok(Self::from_slice(&parts))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A device attaching a node to a link.
#[derive(Clone, Debug, Serialize)]
pub struct Device {
    /// Device id.
    pub id: DeviceId,
    /// Node owning the device.
    pub node: NodeId,
    /// Link the device is attached to.
    pub link: LinkId,
    /// MAC address.
    pub mac: MacAddr,
    /// IPv4 address.
    pub address: Ipv4Addr,
    /// Network of the link the device is attached to.
    pub network: Ipv4Net,
}
