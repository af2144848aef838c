//! Address plan: per-spoke IPv4 subnets carved from a base prefix.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::{ipv4_mask_to_prefix, Ipv4Net, Ipv4Subnets};
use serde::Serialize;

use crate::error::NetworkError;

// smallest subnet holding both link ends
const MAX_PREFIX_LEN: u8 = 30;

/// IPv4 subnet of a single hub-spoke link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Subnet {
    /// Index of the spoke the subnet belongs to.
    pub index: usize,
    /// Network of the link.
    pub network: Ipv4Net,
    /// Address of the hub-side device (first host address).
    pub hub: Ipv4Addr,
    /// Address of the spoke-side device (second host address).
    pub spoke: Ipv4Addr,
}

impl Subnet {
    /// Returns the prefix length of the network mask.
    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Returns the network mask.
    pub fn mask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    /// Returns the directed broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        self.network.broadcast()
    }

    /// Checks whether the address belongs to the subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Allocates consecutive subnets of the same size starting from the base network.
///
/// Subnet `i` is the `i`-th network after the base one, the hub side gets its first host
/// address and the spoke side the second one. For base `10.12.0.0/24` spoke 0 gets
/// `10.12.0.1`/`10.12.0.2`, spoke 1 gets `10.12.1.1`/`10.12.1.2` and so on.
#[derive(Clone, Copy, Debug)]
pub struct AddressPlan {
    base: Ipv4Net,
}

impl AddressPlan {
    /// Creates a plan with specified base address and per-subnet mask.
    ///
    /// The base address is aligned down to the mask.
    pub fn new(base: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, NetworkError> {
        let prefix_len = ipv4_mask_to_prefix(mask).map_err(|_| NetworkError::InvalidMask(mask))?;
        if prefix_len > MAX_PREFIX_LEN {
            return Err(NetworkError::InvalidMask(mask));
        }
        let base = Ipv4Net::new(base, prefix_len).map_err(|_| NetworkError::InvalidMask(mask))?;
        Ok(Self { base: base.trunc() })
    }

    /// Returns the base network address.
    pub fn base(&self) -> Ipv4Addr {
        self.base.network()
    }

    /// Returns the prefix length of every allocated subnet.
    pub fn prefix_len(&self) -> u8 {
        self.base.prefix_len()
    }

    /// Returns the mask of every allocated subnet.
    pub fn mask(&self) -> Ipv4Addr {
        self.base.netmask()
    }

    /// Returns the number of subnets which fit between the base network and the end of address space.
    pub fn available(&self) -> usize {
        let prefix_len = self.base.prefix_len() as u32;
        let index = u32::from(self.base.network()) as u64 >> (32 - prefix_len);
        ((1u64 << prefix_len) - index) as usize
    }

    /// Allocates subnets for `n` spokes.
    pub fn allocate(&self, n: usize) -> Result<Vec<Subnet>, NetworkError> {
        if n == 0 {
            return Err(NetworkError::InvalidSpokeCount);
        }
        let available = self.available();
        if n > available {
            return Err(NetworkError::AddressSpaceExhausted { requested: n, available });
        }
        let subnets: Vec<Subnet> = Ipv4Subnets::new(self.base.network(), Ipv4Addr::BROADCAST, self.prefix_len())
            .take(n)
            .enumerate()
            .filter_map(|(index, network)| {
                let mut hosts = network.hosts();
                Some(Subnet {
                    index,
                    network,
                    hub: hosts.next()?,
                    spoke: hosts.next()?,
                })
            })
            .collect();
        if subnets.len() < n {
            return Err(NetworkError::AddressSpaceExhausted {
                requested: n,
                available: subnets.len(),
            });
        }
        Ok(subnets)
    }
}
