use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};
use vardelay_sim::pacing::sleep_unless_stopped;

use crate::error::{Result, RunError};
use crate::flow::FlowSpec;
use crate::pool::LaunchPool;
use crate::process::ProcessHandle;

/// How long the main sequence waits for the first batch of clients.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Flows sharing one start offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartStep {
    pub offset: Duration,
    pub flows: Vec<usize>,
}

/// When each flow's client is launched, relative to the start of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSchedule {
    steps: Vec<StartStep>,
}

impl StartSchedule {
    /// Group flows by start offset. Flows must already be sorted by start.
    ///
    /// The first step is always at offset zero, possibly empty, so the
    /// release signal fires as soon as the run begins.
    pub fn from_flows(flows: &[FlowSpec]) -> Result<Self> {
        let mut steps: Vec<StartStep> = Vec::new();
        for flow in flows {
            let offset = Duration::from_secs(flow.start_secs);
            match steps.last_mut() {
                Some(last) if last.offset == offset => last.flows.push(flow.id),
                Some(last) if last.offset > offset => {
                    return Err(RunError::StartSchedule(format!(
                        "flow {} starts at {}s, before the preceding flow at {}s",
                        flow.id + 1,
                        flow.start_secs,
                        last.offset.as_secs()
                    )));
                }
                _ => steps.push(StartStep {
                    offset,
                    flows: vec![flow.id],
                }),
            }
        }

        if steps.first().map_or(true, |s| !s.offset.is_zero()) {
            steps.insert(
                0,
                StartStep {
                    offset: Duration::ZERO,
                    flows: Vec::new(),
                },
            );
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[StartStep] {
        &self.steps
    }

    /// Sleep before each step, measured from the previous one.
    pub fn waits(&self) -> Vec<Duration> {
        let mut previous = Duration::ZERO;
        self.steps
            .iter()
            .map(|s| {
                let wait = s.offset - previous;
                previous = s.offset;
                wait
            })
            .collect()
    }

    pub fn largest_step(&self) -> usize {
        self.steps.iter().map(|s| s.flows.len()).max().unwrap_or(0)
    }

    pub fn flow_count(&self) -> usize {
        self.steps.iter().map(|s| s.flows.len()).sum()
    }
}

/// Per-flow client handles, filled in by the scheduler thread.
pub type ClientSlots = Arc<Mutex<Vec<Option<ProcessHandle>>>>;

pub fn client_slots(flows: usize) -> ClientSlots {
    Arc::new(Mutex::new((0..flows).map(|_| None).collect()))
}

/// Runs a [`StartSchedule`] on its own thread.
pub struct StartScheduler {
    handle: JoinHandle<Result<()>>,
    released: Receiver<()>,
}

impl StartScheduler {
    /// Start launching clients. `launches[id]` launches the client of flow
    /// `id`; each is used at most once.
    ///
    /// If the thread fails it raises `stop` so the main sequence does not
    /// keep waiting on it.
    pub fn spawn<L>(
        schedule: StartSchedule,
        pool: LaunchPool,
        launches: Vec<Option<L>>,
        slots: ClientSlots,
        stop: Arc<AtomicBool>,
    ) -> Result<Self>
    where
        L: FnOnce() -> Result<ProcessHandle> + Send + 'static,
    {
        let (release_tx, released) = bounded(1);
        let handle = thread::Builder::new()
            .name("start-scheduler".into())
            .spawn(move || {
                let mut launches = launches;
                let result = run_schedule(&schedule, &pool, &mut launches, &slots, &stop, || {
                    let _ = release_tx.try_send(());
                });
                if result.is_err() {
                    stop.store(true, Ordering::Relaxed);
                }
                result
            })
            .map_err(|source| RunError::Spawn {
                what: "start scheduler".into(),
                source,
            })?;
        Ok(Self { handle, released })
    }

    /// Block until the first batch of clients is running. On timeout a
    /// warning is logged and the run goes on.
    pub fn wait_released(&self, timeout: Duration) {
        match self.released.recv_timeout(timeout) {
            Ok(()) => debug!("first clients released"),
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "first clients not launched in time, continuing")
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("start scheduler ended before releasing")
            }
        }
    }

    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| RunError::ThreadPanic("start scheduler"))?
    }
}

fn run_schedule<L>(
    schedule: &StartSchedule,
    pool: &LaunchPool,
    launches: &mut [Option<L>],
    slots: &ClientSlots,
    stop: &AtomicBool,
    release: impl FnOnce(),
) -> Result<()>
where
    L: FnOnce() -> Result<ProcessHandle> + Send + 'static,
{
    let epoch = Instant::now();
    let mut release = Some(release);

    for step in schedule.steps() {
        if !sleep_unless_stopped(step.offset.saturating_sub(epoch.elapsed()), stop) {
            return Err(RunError::Interrupted);
        }

        let (ids, batch): (Vec<usize>, Vec<L>) = step
            .flows
            .iter()
            .filter_map(|id| {
                let launch = launches.get_mut(*id).and_then(Option::take)?;
                Some((*id, launch))
            })
            .unzip();
        let launched = pool.run_batch(batch)?;

        let mut first_err = None;
        {
            let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, result) in ids.into_iter().zip(launched) {
                match result.and_then(|launch| launch) {
                    Ok(handle) => slots[id] = Some(handle),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        info!(
            offset_s = step.offset.as_secs(),
            flows = step.flows.len(),
            late_ms = epoch.elapsed().saturating_sub(step.offset).as_millis() as u64,
            "clients started"
        );

        if let Some(release) = release.take() {
            release();
        }
    }
    Ok(())
}
