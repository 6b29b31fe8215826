//! Process table scan for status queries.

use std::ffi::OsString;
use std::path::Path;

use corewatch_core::CoreStatus;
use sysinfo::System;

fn same_path(candidate: &Path, binary: &Path) -> bool {
    if candidate == binary {
        return true;
    }
    match (candidate.canonicalize(), binary.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// True if the process runs `binary` directly or through an interpreter
/// (`sh /path/to/core ...`).
fn runs_binary(exe: Option<&Path>, cmd: &[OsString], binary: &Path) -> bool {
    if exe.map(|exe| same_path(exe, binary)).unwrap_or(false) {
        return true;
    }
    cmd.iter()
        .take(2)
        .any(|arg| same_path(Path::new(arg), binary))
}

/// Scans the process table for instances of `binary`. Blocking.
///
/// `tracked` is the pid the supervisor spawned; it is always reported if it
/// is still in the table, even when its executable cannot be read.
pub fn scan_core_processes(binary: &Path, tracked: Option<u32>) -> CoreStatus {
    let mut system = System::new();
    system.refresh_all();

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            tracked == Some(pid.as_u32()) || runs_binary(process.exe(), process.cmd(), binary)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();

    pids.sort_unstable();
    pids.dedup();
    CoreStatus::from_pids(pids)
}
