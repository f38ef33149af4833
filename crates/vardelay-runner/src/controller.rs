use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use tracing::info;
use vardelay_sim::address::AddressAllocator;
use vardelay_sim::command::find_binary;
use vardelay_sim::pacing::sleep_unless_stopped;
use vardelay_sim::shaping::{self, FlowShaping};
use vardelay_sim::topology::Host;
use vardelay_sim::{DelaySchedule, Dumbbell, DumbbellBuilder};

use crate::capture::{Capture, CaptureSpec, DropReport, WARM_UP};
use crate::config::{self, RunConfig};
use crate::error::{ErrorKind, Result, RunError};
use crate::flow::{FlowSpec, Role, Side};
use crate::pool::LaunchPool;
use crate::process::{ProcessHandle, SystemProcesses};
use crate::scheme::{self, SchemeRegistry, READINESS_TIMEOUT, SERVER_PORT};
use crate::start_schedule::{client_slots, StartSchedule, StartScheduler, RELEASE_TIMEOUT};
use crate::supervisor::{Phase, Supervisor};

/// Host tools a run drives; all of them are checked before anything is built.
pub const REQUIRED_TOOLS: &[&str] = &["ip", "tc", "ethtool", "sysctl", "ss", "tcpdump"];

/// Fails with the names of every required tool `lookup` cannot find.
pub fn check_tools<F>(lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    let tools: Vec<String> = REQUIRED_TOOLS
        .iter()
        .filter(|tool| lookup(tool).is_none())
        .map(|tool| tool.to_string())
        .collect();
    if tools.is_empty() {
        return Ok(());
    }
    Err(RunError::MissingTools { tools })
}

/// Where a run reads its metadata and writes its captures, and how it names
/// and runs things on the host.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Holds `metadata.json`; captures are written here too.
    pub dir: PathBuf,
    /// Pantheon checkout providing the scheme wrappers.
    pub pantheon: PathBuf,
    /// Scheme processes and captures run as this user when set.
    pub user: Option<String>,
    pub namespace_prefix: String,
}

/// Drives one run from metadata to drop report.
pub struct TestController {
    options: RunOptions,
    config: RunConfig,
    schemes: SchemeRegistry,
    delays: DelaySchedule,
    starts: StartSchedule,
    stop: Arc<AtomicBool>,
}

impl TestController {
    /// Check the host tools, load the run's metadata and validate everything
    /// that can be validated before the topology exists.
    pub fn prepare(options: RunOptions, stop: Arc<AtomicBool>) -> Result<Self> {
        Self::prepare_with(options, stop, find_binary)
    }

    fn prepare_with<F>(options: RunOptions, stop: Arc<AtomicBool>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        check_tools(lookup)?;

        let config = config::load(&options.dir)?.resolve(|name| {
            let path = scheme::wrapper_path(&options.pantheon, name);
            if !path.exists() {
                return Err(RunError::MissingScheme {
                    scheme: name.to_string(),
                    path,
                });
            }
            scheme::run_first(&path, name)
        })?;

        AddressAllocator::default().check_capacity(config.flows.len())?;
        let delays = DelaySchedule::generate(&config.params.delay_walk())?;
        let starts = StartSchedule::from_flows(&config.flows)?;
        let schemes =
            SchemeRegistry::locate(&options.pantheon, config.schemes(), options.user.clone())?;

        info!(
            flows = config.flows.len(),
            runtime_s = config.params.runtime.as_secs(),
            delay_steps = delays.len(),
            start_steps = starts.steps().len(),
            "run prepared"
        );
        Ok(Self {
            options,
            config,
            schemes,
            delays,
            starts,
            stop,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn delays(&self) -> &DelaySchedule {
        &self.delays
    }

    pub fn starts(&self) -> &StartSchedule {
        &self.starts
    }

    /// Run the test. Any failure once the host has been touched goes through
    /// the emergency shutdown before it is returned; the namespaces are
    /// deleted last.
    pub fn run(self) -> Result<DropReport> {
        let mut supervisor = Supervisor::new(SystemProcesses, self.config.flows.len());
        let mut topology = None;

        let result = self.execute(&mut supervisor, &mut topology);
        if result.is_err() {
            supervisor.emergency_shutdown();
        }
        drop(topology);
        result
    }

    fn execute(
        &self,
        supervisor: &mut Supervisor<SystemProcesses>,
        topology: &mut Option<Dumbbell>,
    ) -> Result<DropReport> {
        let flows = &self.config.flows;
        let params = &self.config.params;

        let dumbbell: &Dumbbell = topology
            .insert(DumbbellBuilder::new(&self.options.namespace_prefix).build(flows.len())?);
        supervisor.advance(Phase::TopologyBuilt);
        self.check_stop()?;

        self.schemes.setup_after_reboot();

        let access: Vec<FlowShaping> = flows.iter().map(FlowSpec::shaping).collect();
        let central = params.central_shaping(self.delays.first_delay_us());
        let mut central_link = shaping::configure_dumbbell(dumbbell, &access, &central)?;
        supervisor.advance(Phase::ShapingApplied);
        self.check_stop()?;

        for flow in flows {
            for role in [Role::Sender, Role::Receiver] {
                let host = host_at(dumbbell, flow.side_of(role), flow.id);
                let spec = CaptureSpec {
                    flow_id: flow.id,
                    scheme: flow.scheme.clone(),
                    role,
                    iface: host.bridge.clone(),
                    receiver_ip: host_at(dumbbell, flow.side_of(Role::Receiver), flow.id).addr,
                    sender_ip: host_at(dumbbell, flow.side_of(Role::Sender), flow.id).addr,
                    buffer_kib: params.buffer_kib,
                    user: self.options.user.clone(),
                    output_dir: self.options.dir.clone(),
                };
                supervisor.record_capture(Capture::start(&host.ns, &spec)?);
            }
        }
        if !sleep_unless_stopped(WARM_UP, &self.stop) {
            return Err(RunError::Interrupted);
        }
        supervisor.advance(Phase::CapturesStarted);

        let mut launches = Vec::with_capacity(flows.len());
        for flow in flows {
            let server = host_at(dumbbell, flow.server_side(), flow.id);
            let client = host_at(dumbbell, flow.server_side().opposite(), flow.id);

            let argv = self.schemes.server_argv(flow)?;
            let handle = ProcessHandle::spawn(
                scheme::endpoint_command(&server.ns, &argv),
                format!("flow {} server", flow.id + 1),
            )?;
            supervisor.record_server(flow.id, handle);
            scheme::wait_for_listener(&server.ns, flow.id, SERVER_PORT, READINESS_TIMEOUT, &self.stop)?;

            let cmd = scheme::endpoint_command(&client.ns, &self.schemes.client_argv(flow, server.addr)?);
            let label = format!("flow {} client", flow.id + 1);
            launches.push(Some(move || ProcessHandle::spawn(cmd, label)));
        }
        supervisor.advance(Phase::ServersStarted);

        let pool = LaunchPool::new(LaunchPool::size_for(self.starts.largest_step()))?;
        let slots = client_slots(flows.len());
        let scheduler = StartScheduler::spawn(
            self.starts.clone(),
            pool,
            launches,
            slots.clone(),
            self.stop.clone(),
        )?;
        scheduler.wait_released(RELEASE_TIMEOUT);
        supervisor.advance(Phase::ClientsStarted);

        supervisor.advance(Phase::SteadyState);
        let replayed = self.delays.replay(&mut central_link, &self.stop);
        if replayed.is_err() {
            self.stop.store(true, Ordering::Relaxed);
        }
        let scheduled = scheduler.join();

        {
            let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, slot) in slots.iter_mut().enumerate() {
                if let Some(handle) = slot.take() {
                    supervisor.record_client(id, handle);
                }
            }
        }

        match (scheduled, replayed) {
            (Err(e), _) if e.kind() != ErrorKind::Interrupted => return Err(e),
            (_, Err(e)) => return Err(e.into()),
            (Err(e), Ok(())) => return Err(e),
            (Ok(()), Ok(())) => {}
        }

        let report = supervisor.shutdown()?;
        report.warn_if_lossy();
        info!(
            dropped = report.total(),
            captures = report.per_capture.len(),
            "run finished"
        );
        Ok(report)
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(RunError::Interrupted);
        }
        Ok(())
    }
}

fn host_at(dumbbell: &Dumbbell, side: Side, flow: usize) -> &Host {
    match side {
        Side::Left => &dumbbell.left.hosts[flow],
        Side::Right => &dumbbell.right.hosts[flow],
    }
}
