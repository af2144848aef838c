//! Bridge configuration.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use rtlab_network::MacAddr;

/// How frames are relayed between the simulated device and the external one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeMode {
    /// Frames pass unmodified in both directions, the simulated device is promiscuous.
    #[default]
    TransparentBridge,
    /// The external host appears behind the MAC address of the simulated device.
    ///
    /// Frames from the external side get the device MAC as source address; frames to the external
    /// side are relayed only when addressed to the device (rewritten to the tap MAC),
    /// broadcast or multicast.
    VirtualMac,
}

/// Configuration of a single bridge endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct TapBridgeConfig {
    /// Name of the external device.
    pub device_name: String,
    /// Relay mode.
    pub mode: BridgeMode,
    /// Netmask the external side is expected to use (overrides the simulated device mask).
    pub netmask: Option<Ipv4Addr>,
    /// MAC address of the external device, learned from the first frame when absent.
    pub mac: Option<MacAddr>,
    /// Default gateway of the external side.
    pub gateway: Option<Ipv4Addr>,
}

impl TapBridgeConfig {
    /// Creates a transparent bridge configuration for the device name.
    pub fn new<S: Into<String>>(device_name: S) -> Self {
        Self {
            device_name: device_name.into(),
            mode: BridgeMode::TransparentBridge,
            netmask: None,
            mac: None,
            gateway: None,
        }
    }

    /// Sets the relay mode.
    pub fn with_mode(mut self, mode: BridgeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the netmask override.
    pub fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = Some(netmask);
        self
    }

    /// Sets the MAC address of the external device.
    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Sets the gateway of the external side.
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }
}
