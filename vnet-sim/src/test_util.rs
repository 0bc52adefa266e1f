//! Helpers for tests that need a real kernel.

use std::{
    process::Command,
    sync::atomic::{AtomicU32, Ordering},
};

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if the environment supports namespace-based tests
/// (requires the `ip` tool and root or passwordless `sudo`).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip").arg("netns").output().is_ok_and(|o| o.status.success());
    if !has_ip {
        return false;
    }

    if nix::unistd::geteuid().is_root() {
        return true;
    }

    Command::new("sudo")
        .args(["-n", "ip", "netns", "list"])
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Generate a unique name safe for parallel tests.
///
/// Combines prefix + PID + atomic counter, truncated to 15 chars.
pub fn unique_name(prefix: &str) -> String {
    let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let mut name = format!("{prefix}_{pid:x}_{seq}");
    name.truncate(crate::MAX_DEVICE_NAME_LEN);
    name
}
