//! Run controller: builds the star, bridges the spokes and runs it against the wall clock.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use log::{error, info};
use serde::Serialize;
use sugars::{rc, refcell};
use thiserror::Error;

use rtlab_core::{Pacer, Simulation, SimulationError, SyncStats};
use rtlab_network::{
    populate_routes, AddressPlan, NetworkError, NetworkStats, PcapTrace, SinkStats, StarNetwork, StarTopology,
};
use rtlab_tap::{BridgeError, BridgeHandle, BridgeMode, BridgeStats, TapBackend, TapBridge, TapBridgeConfig};

use crate::animation::Animation;
use crate::config::StarConfig;

/// Errors of the run, naming the stage that failed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("address plan: {0}")]
    AddressPlan(#[source] NetworkError),
    #[error("topology: {0}")]
    Topology(#[source] NetworkError),
    #[error("bridge of spoke {spoke}: {source}")]
    BridgeAttach { spoke: usize, source: BridgeError },
    #[error("traffic sink: {0}")]
    Sink(#[source] NetworkError),
    #[error("clock: {0}")]
    Clock(#[source] SimulationError),
    #[error("frame capture: {0}")]
    Capture(#[source] std::io::Error),
    #[error("animation: {0}")]
    Animation(#[source] std::io::Error),
}

/// Counters of a single bridge.
#[derive(Clone, Debug, Serialize)]
pub struct BridgeReport {
    pub spoke: usize,
    pub device_name: String,
    pub stats: BridgeStats,
}

/// Summary of a finished run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub config: StarConfig,
    pub final_time: f64,
    pub sync: SyncStats,
    pub network: NetworkStats,
    pub sink: Option<SinkStats>,
    pub bridges: Vec<BridgeReport>,
    pub pcap_files: Vec<PathBuf>,
    pub animation_file: Option<PathBuf>,
}

/// Star network with every spoke bridged to an external device, ready to run.
pub struct StarHarness {
    config: StarConfig,
    sim: Simulation,
    net: Rc<RefCell<StarNetwork>>,
    bridges: Vec<BridgeHandle>,
    pcap_files: Vec<PathBuf>,
    animation_file: Option<PathBuf>,
}

impl StarHarness {
    /// Builds the star: address plan, topology, routes, one bridge per spoke and the traffic sink.
    ///
    /// Bridges attached before a failure are closed before returning.
    pub fn build(config: StarConfig, backend: &dyn TapBackend, pacer: Box<dyn Pacer>) -> Result<Self, RunError> {
        let mut sim = Simulation::with_pacer(config.seed, pacer);

        let plan = AddressPlan::new(config.base, config.mask).map_err(RunError::AddressPlan)?;
        let subnets = plan.allocate(config.num_nodes).map_err(RunError::AddressPlan)?;
        let mut animation = Animation::new(config.num_nodes);
        let topology = StarTopology::from_subnets(subnets, config.link_spec(), &mut animation)
            .map_err(RunError::Topology)?;
        info!(
            target: "tap-star",
            "Built star of {} spokes over {}, links {} / {:?}",
            topology.spoke_count(),
            plan.base(),
            config.data_rate,
            config.delay
        );
        let animation_file = if config.animation {
            animation.write(&config.animation_file).map_err(RunError::Animation)?;
            Some(config.animation_file.clone())
        } else {
            None
        };

        let topology = rc!(topology);
        let routes = rc!(populate_routes(&topology));
        let net = rc!(refcell!(StarNetwork::new(
            topology.clone(),
            routes,
            sim.create_context("net")
        )));
        sim.add_handler("net", net.clone());

        let mut pcap_files = Vec::new();
        if let Some(prefix) = &config.pcap {
            let trace = PcapTrace::create(prefix, &topology).map_err(RunError::Capture)?;
            pcap_files = trace.paths().to_vec();
            net.borrow_mut().add_trace(Box::new(trace));
        }
        let released = net.clone();
        sim.on_destroy("net", move || released.borrow_mut().release());

        let mut harness = Self {
            config,
            sim,
            net,
            bridges: Vec::new(),
            pcap_files,
            animation_file,
        };
        if let Err(e) = harness.attach_bridges(&topology, backend) {
            harness.close_bridges();
            return Err(e);
        }
        let sink_port = harness.config.sink_port;
        if let Err(e) = harness.net.borrow_mut().listen_at(topology.hub().id, sink_port) {
            harness.close_bridges();
            return Err(RunError::Sink(e));
        }
        Ok(harness)
    }

    fn attach_bridges(&mut self, topology: &StarTopology, backend: &dyn TapBackend) -> Result<(), RunError> {
        for i in 0..topology.spoke_count() {
            let config = TapBridgeConfig::new(self.config.tap_name(i))
                .with_mode(BridgeMode::TransparentBridge)
                .with_netmask(self.config.tap_netmask)
                .with_gateway(topology.hub_address(i));
            let device = topology.spoke_device(i).id;
            let handle = TapBridge::attach(&mut self.sim, &self.net, config, device, backend)
                .map_err(|source| RunError::BridgeAttach { spoke: i, source })?;
            self.bridges.push(handle);
        }
        Ok(())
    }

    fn close_bridges(&self) {
        for bridge in &self.bridges {
            bridge.close();
        }
    }

    /// Returns the simulation.
    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    /// Returns the network component.
    pub fn network(&self) -> &Rc<RefCell<StarNetwork>> {
        &self.net
    }

    /// Returns the handles of attached bridges, in spoke order.
    pub fn bridges(&self) -> &[BridgeHandle] {
        &self.bridges
    }

    /// Starts the clock, blocks until the configured stop time and tears everything down.
    pub fn run(mut self) -> Result<RunReport, RunError> {
        let res = self.run_clock();
        if res.is_err() {
            self.close_bridges();
        }
        let sync = res.map_err(|e| {
            error!(target: "tap-star", "Run failed: {}", e);
            e
        })?;

        let net = self.net.borrow();
        let report = RunReport {
            final_time: self.sim.time(),
            sync,
            network: net.stats(),
            sink: net.sink_stats(self.config.sink_port),
            bridges: self
                .bridges
                .iter()
                .enumerate()
                .map(|(spoke, handle)| BridgeReport {
                    spoke,
                    device_name: handle.name().to_owned(),
                    stats: handle.stats(),
                })
                .collect(),
            pcap_files: self.pcap_files.clone(),
            animation_file: self.animation_file.clone(),
            config: self.config.clone(),
        };
        info!(
            target: "tap-star",
            "Finished at {:.3}: {} frames transmitted, {} events dispatched, max lag {:.6}",
            report.final_time,
            report.network.frames_transmitted,
            report.sync.dispatched_events,
            report.sync.max_lag
        );
        Ok(report)
    }

    fn run_clock(&mut self) -> Result<SyncStats, RunError> {
        self.sim.start().map_err(RunError::Clock)?;
        let stats = self.sim.run_until(self.config.total_time).map_err(RunError::Clock)?;
        self.sim.destroy().map_err(RunError::Clock)?;
        Ok(stats)
    }
}
