use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use env_logger::Builder;
use log::error;

use rtlab_core::WallClockPacer;
use rtlab_network::DataRate;
use rtlab_tap::LinuxTapBackend;
use tap_star::{RawStarConfig, StarConfig, StarHarness};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
/// Runs a star LAN in real time, bridging every spoke to a TAP device of the host
struct Args {
    /// Path to YAML file with run configuration (flags override its values)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of spoke nodes [default: 10]
    #[arg(long)]
    num_nodes: Option<usize>,

    /// Run duration in seconds [default: 600]
    #[arg(long)]
    total_time: Option<f64>,

    /// Base name of TAP devices, spoke i is bridged to <base><i+1> [default: tap-emu]
    #[arg(long)]
    tap_base_name: Option<String>,

    /// Write node descriptions for visualization
    #[arg(long)]
    animation: bool,

    /// File with node descriptions [default: animation.json]
    #[arg(long)]
    animation_file: Option<PathBuf>,

    /// Data rate of spoke links, e.g. 100Mbps
    #[arg(long)]
    data_rate: Option<DataRate>,

    /// Propagation delay of spoke links, e.g. 200ms
    #[arg(long, value_parser = humantime::parse_duration)]
    delay: Option<Duration>,

    /// First address of the address plan [default: 10.12.0.0]
    #[arg(long)]
    base: Option<Ipv4Addr>,

    /// Netmask of each spoke network [default: 255.255.255.0]
    #[arg(long)]
    mask: Option<Ipv4Addr>,

    /// Netmask the hosts behind TAP devices are expected to use [default: 255.255.0.0]
    #[arg(long)]
    tap_netmask: Option<Ipv4Addr>,

    /// Port of the traffic sink on the hub [default: 5000]
    #[arg(long)]
    sink_port: Option<u16>,

    /// Prefix of pcap files, one file per device
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Path to produced JSON file with run report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seed of the simulation random generator [default: 123]
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn overrides(&self) -> RawStarConfig {
        RawStarConfig {
            num_nodes: self.num_nodes,
            total_time: self.total_time,
            tap_base_name: self.tap_base_name.clone(),
            animation: self.animation.then_some(true),
            animation_file: self.animation_file.clone(),
            data_rate: self.data_rate,
            delay: self.delay,
            base: self.base,
            mask: self.mask,
            tap_netmask: self.tap_netmask,
            sink_port: self.sink_port,
            pcap: self.pcap.clone(),
            seed: self.seed,
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let raw = match &args.config {
        Some(path) => RawStarConfig::from_file(path)?,
        None => RawStarConfig::default(),
    };
    let config = StarConfig::from_raw(raw.overridden_by(args.overrides()))?;

    let harness = StarHarness::build(config, &LinuxTapBackend::new(), Box::new(WallClockPacer::new()))?;
    let report = harness.run()?;

    if let Some(output) = args.output {
        std::fs::File::create(output)?.write_all(serde_json::to_string_pretty(&report)?.as_bytes())?;
    }
    Ok(())
}

fn main() -> ExitCode {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "tap-star", "{}", e);
            eprintln!("tap-star: {}", e);
            ExitCode::FAILURE
        }
    }
}
