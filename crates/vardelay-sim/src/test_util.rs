use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::command::privileged;

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root/sudo) and the tools
/// (`ip`, `tc`, `ethtool`) needed to build a dumbbell. Returns `false` if the
/// environment cannot support namespace-based tests.
pub fn check_privileges() -> bool {
    let has_ip = privileged("ip")
        .args(["netns", "list"])
        .output()
        .is_ok_and(|o| o.status.success());

    has_ip
        && ["tc", "ethtool"].iter().all(|tool| {
            Command::new("sh")
                .args(["-c", &format!("command -v {tool}")])
                .output()
                .is_ok_and(|o| o.status.success())
        })
}

/// Generates a unique namespace name prefix with the given prefix.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xFFFF;
    format!("{prefix}_{pid:x}_{seq}")
}
