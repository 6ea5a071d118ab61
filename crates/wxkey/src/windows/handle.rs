//! Scoped process handle with read/query rights.

use std::ffi::c_void;

use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Threading::{
    IsWow64Process, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use crate::error::ExtractError;
use crate::scan::MemoryReader;

/// A process handle opened with `VM_READ | QUERY_INFORMATION`, closed on
/// drop. Shared read-only between the producer and every worker.
pub(crate) struct OwnedProcess {
    handle: HANDLE,
}

// HANDLE is a kernel object reference, valid from any thread.
unsafe impl Send for OwnedProcess {}
unsafe impl Sync for OwnedProcess {}

impl OwnedProcess {
    pub fn open(pid: u32) -> Result<Self, ExtractError> {
        let handle = unsafe { OpenProcess(PROCESS_VM_READ | PROCESS_QUERY_INFORMATION, false, pid) }
            .map_err(|e| ExtractError::OpenProcessFailed(std::io::Error::other(e)))?;
        Ok(Self { handle })
    }

    pub fn raw(&self) -> HANDLE {
        self.handle
    }

    /// Architecture of the target image. A WOW64 process is a 32-bit image
    /// on a 64-bit host; on a 32-bit host everything is 32-bit.
    pub fn is_64bit(&self) -> Result<bool, ExtractError> {
        if cfg!(target_pointer_width = "32") {
            return Ok(false);
        }
        let mut wow64 = BOOL::default();
        unsafe { IsWow64Process(self.handle, &mut wow64) }
            .map_err(|e| ExtractError::OpenProcessFailed(std::io::Error::other(e)))?;
        Ok(!wow64.as_bool())
    }

    /// Read up to `len` bytes at `addr`, truncating to what the OS actually
    /// copied. Used for whole regions, where partial pages are common.
    pub fn read_region(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut copied = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle,
                addr as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                len,
                Some(&mut copied),
            )
        }
        .ok()?;
        if copied == 0 {
            return None;
        }
        buffer.truncate(copied);
        Some(buffer)
    }
}

impl MemoryReader for OwnedProcess {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut copied = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle,
                addr as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                len,
                Some(&mut copied),
            )
        }
        .ok()?;
        (copied == len).then_some(buffer)
    }
}

impl Drop for OwnedProcess {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.handle) };
    }
}
