//! Run configuration.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rtlab_network::{DataRate, LinkSpec};

/// Errors of loading the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file can not be read.
    #[error("can't read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Configuration file is not valid YAML or has invalid values.
    #[error("can't parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying parser error.
        source: serde_yaml::Error,
    },
    /// Value is out of range.
    #[error("invalid value of {name}: {reason}")]
    InvalidValue {
        /// Option name.
        name: &'static str,
        /// What is wrong with the value.
        reason: String,
    },
}

/// Holds raw run config parsed from YAML file or collected from command line flags.
///
/// Absent values are taken from the lower-priority source or from the defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawStarConfig {
    pub num_nodes: Option<usize>,
    pub total_time: Option<f64>,
    pub tap_base_name: Option<String>,
    pub animation: Option<bool>,
    pub animation_file: Option<PathBuf>,
    pub data_rate: Option<DataRate>,
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,
    pub base: Option<Ipv4Addr>,
    pub mask: Option<Ipv4Addr>,
    pub tap_netmask: Option<Ipv4Addr>,
    pub sink_port: Option<u16>,
    pub pcap: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl RawStarConfig {
    /// Reads raw config from YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Returns config with values of `other` taking precedence over values of `self`.
    pub fn overridden_by(self, other: RawStarConfig) -> Self {
        Self {
            num_nodes: other.num_nodes.or(self.num_nodes),
            total_time: other.total_time.or(self.total_time),
            tap_base_name: other.tap_base_name.or(self.tap_base_name),
            animation: other.animation.or(self.animation),
            animation_file: other.animation_file.or(self.animation_file),
            data_rate: other.data_rate.or(self.data_rate),
            delay: other.delay.or(self.delay),
            base: other.base.or(self.base),
            mask: other.mask.or(self.mask),
            tap_netmask: other.tap_netmask.or(self.tap_netmask),
            sink_port: other.sink_port.or(self.sink_port),
            pcap: other.pcap.or(self.pcap),
            seed: other.seed.or(self.seed),
        }
    }
}

/// Represents run configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StarConfig {
    /// Number of spoke nodes.
    pub num_nodes: usize,
    /// Run duration in seconds.
    pub total_time: f64,
    /// Base name of external devices, spoke `i` is bridged to `<base><i+1>`.
    pub tap_base_name: String,
    /// Whether to write node descriptions for visualization.
    pub animation: bool,
    /// File with node descriptions.
    pub animation_file: PathBuf,
    /// Data rate of spoke links.
    pub data_rate: DataRate,
    /// Propagation delay of spoke links.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// First address of the address plan.
    pub base: Ipv4Addr,
    /// Netmask of each spoke network.
    pub mask: Ipv4Addr,
    /// Netmask the external hosts are expected to use.
    pub tap_netmask: Ipv4Addr,
    /// Port of the traffic sink on the hub.
    pub sink_port: u16,
    /// Prefix of pcap capture files, no capture if absent.
    pub pcap: Option<PathBuf>,
    /// Seed of the simulation random generator.
    pub seed: u64,
}

impl Default for StarConfig {
    fn default() -> Self {
        Self {
            num_nodes: 10,
            total_time: 600.,
            tap_base_name: "tap-emu".to_owned(),
            animation: false,
            animation_file: PathBuf::from("animation.json"),
            data_rate: DataRate::from_bps(100_000_000),
            delay: Duration::from_millis(200),
            base: Ipv4Addr::new(10, 12, 0, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            tap_netmask: Ipv4Addr::new(255, 255, 0, 0),
            sink_port: 5000,
            pcap: None,
            seed: 123,
        }
    }
}

impl StarConfig {
    /// Creates config from raw values, using defaults for absent ones.
    pub fn from_raw(raw: RawStarConfig) -> Result<Self, ConfigError> {
        let default = Self::default();
        let config = Self {
            num_nodes: raw.num_nodes.unwrap_or(default.num_nodes),
            total_time: raw.total_time.unwrap_or(default.total_time),
            tap_base_name: raw.tap_base_name.unwrap_or(default.tap_base_name),
            animation: raw.animation.unwrap_or(default.animation),
            animation_file: raw.animation_file.unwrap_or(default.animation_file),
            data_rate: raw.data_rate.unwrap_or(default.data_rate),
            delay: raw.delay.unwrap_or(default.delay),
            base: raw.base.unwrap_or(default.base),
            mask: raw.mask.unwrap_or(default.mask),
            tap_netmask: raw.tap_netmask.unwrap_or(default.tap_netmask),
            sink_port: raw.sink_port.unwrap_or(default.sink_port),
            pcap: raw.pcap.or(default.pcap),
            seed: raw.seed.unwrap_or(default.seed),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads config from YAML file, using defaults for absent values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_raw(RawStarConfig::from_file(path)?)
    }

    /// Returns the link parameters of every spoke.
    pub fn link_spec(&self) -> LinkSpec {
        LinkSpec::new(self.data_rate, self.delay.as_secs_f64())
    }

    /// Returns the name of the external device bridged to spoke `i`.
    pub fn tap_name(&self, i: usize) -> String {
        format!("{}{}", self.tap_base_name, i + 1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.total_time.is_finite() && self.total_time >= 0.) {
            return Err(ConfigError::InvalidValue {
                name: "total_time",
                reason: format!("{} is not a non-negative number of seconds", self.total_time),
            });
        }
        if self.tap_base_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "tap_base_name",
                reason: "empty name".to_owned(),
            });
        }
        Ok(())
    }
}
