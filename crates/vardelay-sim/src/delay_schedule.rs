use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::{Result, SimError};
use crate::pacing::{sleep_unless_stopped, until_next_tick};

/// Something whose delay the replay loop drives, normally the central link.
pub trait DelayTarget {
    fn set_delay_us(&mut self, delay_us: u64) -> Result<()>;
}

/// Parameters of the central link's bounded random walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayWalkConfig {
    /// Initial delay.
    pub base_us: u64,
    /// How long each delay value is held.
    pub delta_us: u64,
    /// Size of every change.
    pub step_us: u64,
    /// Upper bound of the walk; the lower bound is zero.
    pub max_delay_us: u64,
    pub runtime_us: u64,
    pub seed: u64,
}

/// One delay value and how long it is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayStep {
    pub interval: Duration,
    pub delay_us: u64,
}

/// Precomputed delay values for the whole run.
///
/// Full `delta` intervals cover the runtime, followed by one shorter
/// remainder interval when the runtime is not a multiple of `delta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaySchedule {
    steps: Vec<DelayStep>,
}

impl DelaySchedule {
    /// Generate the schedule, validating the walk's bounds first.
    pub fn generate(cfg: &DelayWalkConfig) -> Result<Self> {
        if cfg.delta_us == 0 {
            return Err(SimError::InvalidDelayWalk("delta must be positive".into()));
        }
        if cfg.runtime_us == 0 {
            return Err(SimError::InvalidDelayWalk("runtime must be positive".into()));
        }
        if cfg.base_us > cfg.max_delay_us {
            return Err(SimError::InvalidDelayWalk(format!(
                "base {}us exceeds max delay {}us",
                cfg.base_us, cfg.max_delay_us
            )));
        }

        let intervals = split_runtime(cfg.runtime_us, cfg.delta_us);

        // A value with no feasible move has no in-range neighbour either,
        // so the walk can only ever sit on one if it starts there.
        if intervals.len() > 1 && next_moves(cfg, cfg.base_us) == (false, false) {
            return Err(infeasible(cfg, cfg.base_us));
        }

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut delay_us = cfg.base_us;
        let mut steps = Vec::with_capacity(intervals.len());

        for (idx, interval_us) in intervals.into_iter().enumerate() {
            if idx > 0 {
                let increase = match next_moves(cfg, delay_us) {
                    (true, true) => rng.random::<bool>(),
                    (true, false) => true,
                    (false, true) => false,
                    (false, false) => return Err(infeasible(cfg, delay_us)),
                };
                delay_us = if increase {
                    delay_us + cfg.step_us
                } else {
                    delay_us - cfg.step_us
                };
            }
            steps.push(DelayStep {
                interval: Duration::from_micros(interval_us),
                delay_us,
            });
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[DelayStep] {
        &self.steps
    }

    /// Delay the central link starts with; always the walk's base.
    pub fn first_delay_us(&self) -> u64 {
        self.steps.first().map(|s| s.delay_us).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.steps.iter().map(|s| s.interval).sum()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Replay the schedule against `target`, blocking for the whole runtime.
    ///
    /// The first value is assumed installed already. Every later value is
    /// applied at its interval boundary; sleeps are measured from an epoch so
    /// the time spent applying a change does not push later changes back.
    /// Returns `SimError::Interrupted` if `stop` is raised.
    pub fn replay(&self, target: &mut impl DelayTarget, stop: &AtomicBool) -> Result<()> {
        let Some((first, rest)) = self.steps.split_first() else {
            return Ok(());
        };

        info!(steps = self.steps.len(), total = ?self.total(), "replaying delay schedule");
        let started = Instant::now();

        if !sleep_unless_stopped(first.interval, stop) {
            return Err(SimError::Interrupted);
        }

        let mut epoch = Instant::now();
        let mut epoch_interval = rest.first().map(|s| s.interval).unwrap_or_default();

        for step in rest {
            if step.interval != epoch_interval {
                epoch = Instant::now();
                epoch_interval = step.interval;
            }
            target.set_delay_us(step.delay_us)?;
            debug!(delay_us = step.delay_us, "delay step applied");

            if !sleep_unless_stopped(until_next_tick(step.interval, epoch.elapsed()), stop) {
                return Err(SimError::Interrupted);
            }
        }

        info!(elapsed = ?started.elapsed(), "delay schedule finished");
        Ok(())
    }
}

/// Interval lengths in µs: `runtime / delta` full ones plus the remainder.
fn split_runtime(runtime_us: u64, delta_us: u64) -> Vec<u64> {
    let full = (runtime_us / delta_us) as usize;
    let remainder = runtime_us % delta_us;
    let mut intervals = vec![delta_us; full];
    if remainder != 0 {
        intervals.push(remainder);
    }
    intervals
}

/// Whether an increase and a decrease by one step stay in `[0, max]`.
fn next_moves(cfg: &DelayWalkConfig, delay_us: u64) -> (bool, bool) {
    let up = delay_us
        .checked_add(cfg.step_us)
        .is_some_and(|v| v <= cfg.max_delay_us);
    let down = delay_us >= cfg.step_us;
    (up, down)
}

fn infeasible(cfg: &DelayWalkConfig, value_us: u64) -> SimError {
    SimError::InfeasibleDelayWalk {
        value_us,
        step_us: cfg.step_us,
        max_delay_us: cfg.max_delay_us,
    }
}
