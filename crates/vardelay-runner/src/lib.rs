//! Orchestration of variable-delay congestion-control runs.
//!
//! A run loads `metadata.json` from its output directory, builds the
//! namespace dumbbell, shapes it, starts one capture per flow endpoint,
//! launches every flow's scheme server and then its client on schedule,
//! varies the central link's delay for the whole runtime and finally tears
//! everything down in order.

pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod flow;
pub mod pool;
pub mod process;
pub mod scheme;
pub mod start_schedule;
pub mod supervisor;

pub use controller::{RunOptions, TestController};
pub use error::{ErrorKind, Result, RunError};
