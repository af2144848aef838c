//! Network link.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::NetworkError;

/// Unique link id.
pub type LinkId = usize;

/// Link data rate in bits per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    /// Creates a data rate from bits per second.
    pub fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    /// Returns the rate in bits per second.
    pub fn bps(&self) -> u64 {
        self.0
    }

    /// Returns the time needed to serialize `bytes` on the medium.
    pub fn transmission_time(&self, bytes: usize) -> f64 {
        (bytes * 8) as f64 / self.0 as f64
    }
}

impl FromStr for DataRate {
    type Err = NetworkError;

    /// Parses strings like `100Mbps`, `1.5Gbps`, `64kbps` or `9600bps`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidDataRate(s.to_owned());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(invalid)?;
        let (value, unit) = trimmed.split_at(split);
        let value: f64 = value.trim().parse().map_err(|_| invalid())?;
        let multiplier = match unit {
            "bps" | "b/s" => 1.,
            "kbps" | "Kbps" | "kb/s" => 1e3,
            "Mbps" | "Mb/s" => 1e6,
            "Gbps" | "Gb/s" => 1e9,
            _ => return Err(invalid()),
        };
        let bps = (value * multiplier).round();
        if !bps.is_finite() || bps < 1. {
            return Err(invalid());
        }
        Ok(Self(bps as u64))
    }
}

impl TryFrom<String> for DataRate {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataRate> for String {
    fn from(rate: DataRate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.0;
        if bps % 1_000_000_000 == 0 {
            write!(f, "{}Gbps", bps / 1_000_000_000)
        } else if bps % 1_000_000 == 0 {
            write!(f, "{}Mbps", bps / 1_000_000)
        } else if bps % 1_000 == 0 {
            write!(f, "{}kbps", bps / 1_000)
        } else {
            write!(f, "{}bps", bps)
        }
    }
}

/// Parameters shared by all links of the star.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LinkSpec {
    /// Link data rate.
    pub data_rate: DataRate,
    /// Propagation delay in seconds.
    pub delay: f64,
}

impl LinkSpec {
    /// Creates link parameters.
    pub fn new(data_rate: DataRate, delay: f64) -> Self {
        Self { data_rate, delay }
    }
}

/// A half-duplex link joining a hub device with a spoke device.
///
/// Frames are serialized on the medium one at a time in FIFO order, regardless of their direction.
#[derive(Clone, Debug, Serialize)]
pub struct Link {
    /// Link id.
    pub id: LinkId,
    /// Link data rate.
    pub data_rate: DataRate,
    /// Propagation delay in seconds.
    pub delay: f64,
    /// Device at the hub side.
    pub hub_device: DeviceId,
    /// Device at the spoke side.
    pub spoke_device: DeviceId,
}

impl Link {
    /// Returns the device at the opposite end of the link.
    pub fn peer(&self, device: DeviceId) -> Option<DeviceId> {
        if device == self.hub_device {
            Some(self.spoke_device)
        } else if device == self.spoke_device {
            Some(self.hub_device)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_rate() {
        assert_eq!("100Mbps".parse::<DataRate>().unwrap().bps(), 100_000_000);
        assert_eq!("1.5Gbps".parse::<DataRate>().unwrap().bps(), 1_500_000_000);
        assert_eq!("64kbps".parse::<DataRate>().unwrap().bps(), 64_000);
        assert_eq!("9600bps".parse::<DataRate>().unwrap().bps(), 9600);
        assert!("fast".parse::<DataRate>().is_err());
        assert!("10 parsecs".parse::<DataRate>().is_err());
        assert!("0Mbps".parse::<DataRate>().is_err());
    }

    #[test]
    fn test_data_rate_display() {
        assert_eq!(DataRate::from_bps(100_000_000).to_string(), "100Mbps");
        assert_eq!(DataRate::from_bps(1_500_000).to_string(), "1500kbps");
        assert_eq!(DataRate::from_bps(9600).to_string(), "9600bps");
    }

    #[test]
    fn test_transmission_time() {
        let rate = DataRate::from_bps(8_000);
        assert_eq!(rate.transmission_time(1000), 1.0);
    }
}
