//! Target-process discovery.
//!
//! Finds running messenger clients by image name. The descriptor produced
//! here is immutable; everything downstream (handle, enumerator, scanners)
//! consumes it read-only.

use sysinfo::System;

/// Image name of the V3-era client executable.
pub const V3_IMAGE_NAME: &str = "WeChat.exe";
/// Image name of the V4-era client executable.
pub const V4_IMAGE_NAME: &str = "Weixin.exe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Online,
    Offline,
}

/// Immutable descriptor of a candidate target process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub status: ProcessStatus,
}

impl ProcessInfo {
    /// Descriptor for a PID the caller already knows, e.g. from a CLI flag.
    pub fn from_pid(pid: u32) -> Self {
        Self {
            pid,
            name: String::new(),
            status: ProcessStatus::Online,
        }
    }
}

/// Enumerate OS processes and return those whose image file name matches one
/// of `image_names` (case-insensitive). An empty result means no client is
/// running; enumeration itself does not fail.
pub fn locate_processes(image_names: &[&str]) -> Vec<ProcessInfo> {
    let mut system = System::new_all();
    system.refresh_all();

    let mut found: Vec<ProcessInfo> = Vec::new();
    for process in system.processes().values() {
        let name = process.name().to_string_lossy().into_owned();
        if image_names.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            found.push(ProcessInfo {
                pid: process.pid().as_u32(),
                name,
                status: ProcessStatus::Online,
            });
        }
    }

    found.sort_by_key(|p| p.pid);
    found.dedup_by_key(|p| p.pid);
    found
}
