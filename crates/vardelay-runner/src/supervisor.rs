use std::fmt;
use std::io;

use tracing::{debug, info, warn};

use crate::capture::{Capture, DropReport};
use crate::error::{Result, RunError};
use crate::process::{ProcessHandle, ProcessOps, Signal, SignalTarget};

/// Lifecycle of a run. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    TopologyBuilt,
    ShapingApplied,
    CapturesStarted,
    ServersStarted,
    ClientsStarted,
    SteadyState,
    ShuttingDown,
    Terminal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Owns every long-lived process of a run and tears them down in order.
pub struct Supervisor<P> {
    ops: P,
    phase: Phase,
    servers: Vec<Option<ProcessHandle>>,
    clients: Vec<Option<ProcessHandle>>,
    captures: Vec<Capture>,
}

impl<P: ProcessOps> Supervisor<P> {
    pub fn new(ops: P, flows: usize) -> Self {
        Self {
            ops,
            phase: Phase::Idle,
            servers: (0..flows).map(|_| None).collect(),
            clients: (0..flows).map(|_| None).collect(),
            captures: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ops(&self) -> &P {
        &self.ops
    }

    pub fn advance(&mut self, next: Phase) {
        if next <= self.phase {
            debug!(current = %self.phase, requested = %next, "ignoring backwards phase change");
            return;
        }
        info!(from = %self.phase, to = %next, "phase");
        self.phase = next;
    }

    pub fn record_server(&mut self, flow: usize, handle: ProcessHandle) {
        self.servers[flow] = Some(handle);
    }

    pub fn record_client(&mut self, flow: usize, handle: ProcessHandle) {
        self.clients[flow] = Some(handle);
    }

    pub fn record_capture(&mut self, capture: Capture) {
        self.captures.push(capture);
    }

    /// Number of processes still owned.
    pub fn tracked(&self) -> usize {
        self.servers.iter().flatten().count()
            + self.clients.iter().flatten().count()
            + self.captures.len()
    }

    /// Regular end of a run: kill every server group, then every client
    /// group, then stop the captures so they flush, reap everything and
    /// collect the captures' drop counts.
    ///
    /// Every process is signalled and reaped even when one step fails; the
    /// first failure is returned afterwards.
    pub fn shutdown(&mut self) -> Result<DropReport> {
        self.advance(Phase::ShuttingDown);
        let mut first_err: Option<RunError> = None;
        let mut note = |res: io::Result<()>, what: String| match res {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(process = %what, "already exited before shutdown");
            }
            Err(source) => {
                first_err.get_or_insert(RunError::Process { what, source });
            }
        };

        for handle in self.servers.iter().chain(self.clients.iter()).flatten() {
            note(
                self.ops.signal(handle, SignalTarget::Group, Signal::Kill),
                format!("failed to kill {}", handle.label()),
            );
        }
        for capture in &self.captures {
            note(
                self.ops
                    .signal(capture.process(), SignalTarget::Process, Signal::Interrupt),
                format!("failed to stop {}", capture.process().label()),
            );
        }

        for mut handle in self.drain_schemes() {
            note(
                self.ops.reap(&mut handle).map(drop),
                format!("failed to reap {}", handle.label()),
            );
        }
        let mut reports = Vec::with_capacity(self.captures.len());
        for mut capture in std::mem::take(&mut self.captures) {
            note(
                self.ops.reap(capture.process_mut()).map(drop),
                format!("failed to reap {}", capture.process().label()),
            );
            reports.push(capture.finish());
        }

        self.advance(Phase::Terminal);
        if let Some(err) = first_err {
            return Err(err);
        }
        DropReport::from_reports(reports)
    }

    /// Tear-down after a failure: kill all scheme groups, terminate the
    /// captures and reap whatever is left. Never fails; processes that are
    /// already gone are skipped.
    pub fn emergency_shutdown(&mut self) {
        self.advance(Phase::ShuttingDown);
        warn!(processes = self.tracked(), "emergency shutdown");

        for handle in self.servers.iter().chain(self.clients.iter()).flatten() {
            ignore_gone(
                self.ops.signal(handle, SignalTarget::Group, Signal::Kill),
                handle.label(),
            );
        }
        for capture in &self.captures {
            ignore_gone(
                self.ops
                    .signal(capture.process(), SignalTarget::Process, Signal::Terminate),
                capture.process().label(),
            );
        }

        for mut handle in self.drain_schemes() {
            ignore_gone(self.ops.reap(&mut handle).map(drop), handle.label());
        }
        for mut capture in std::mem::take(&mut self.captures) {
            ignore_gone(
                self.ops.reap(capture.process_mut()).map(drop),
                capture.process().label(),
            );
            let report = capture.finish();
            debug!(capture = %report.label, stderr = %report.stderr.trim(), "capture output");
        }

        self.advance(Phase::Terminal);
    }

    fn drain_schemes(&mut self) -> Vec<ProcessHandle> {
        self.servers
            .iter_mut()
            .chain(self.clients.iter_mut())
            .filter_map(Option::take)
            .collect()
    }
}

fn ignore_gone(res: io::Result<()>, label: &str) {
    match res {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(process = %label, "already gone");
        }
        Err(e) => warn!(process = %label, error = %e, "cleanup step failed"),
    }
}
