//! Loaded-module lookup via a toolhelp snapshot.

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ModuleRange {
    pub base: u64,
    pub size: u64,
}

struct SnapshotGuard(HANDLE);

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

/// Find the first module named `name` (case-insensitive) inside `pid`.
pub(crate) fn find_module(pid: u32, name: &str) -> Option<ModuleRange> {
    let snapshot =
        unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }.ok()?;
    let snapshot = SnapshotGuard(snapshot);

    let mut entry = MODULEENTRY32W {
        dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };
    if unsafe { Module32FirstW(snapshot.0, &mut entry) }.is_err() {
        return None;
    }

    loop {
        if module_name(&entry).eq_ignore_ascii_case(name) {
            return Some(ModuleRange {
                base: entry.modBaseAddr as usize as u64,
                size: u64::from(entry.modBaseSize),
            });
        }
        if unsafe { Module32NextW(snapshot.0, &mut entry) }.is_err() {
            return None;
        }
    }
}

fn module_name(entry: &MODULEENTRY32W) -> String {
    let nul = entry
        .szModule
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(entry.szModule.len());
    String::from_utf16_lossy(&entry.szModule[..nul])
}
