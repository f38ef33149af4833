//! Network plumbing for variable-delay congestion-control runs.
//!
//! Builds a dumbbell of Linux network namespaces joined by veth pairs,
//! shapes every link with `tc netem`, and generates the seeded random walk
//! that drives the central link's delay while a run is live.

pub mod address;
pub mod command;
pub mod delay_schedule;
pub mod error;
pub mod pacing;
pub mod shaping;
pub mod topology;

pub mod test_util;

pub use delay_schedule::{DelaySchedule, DelayStep, DelayTarget, DelayWalkConfig};
pub use error::{CommandError, Result, SimError};
pub use shaping::{CentralLink, CentralShaping, FlowShaping, NetemRule};
pub use topology::{Dumbbell, DumbbellBuilder, Namespace};
