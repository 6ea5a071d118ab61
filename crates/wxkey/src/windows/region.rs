//! Address-space walk: the producer side of the scan pipeline.

use std::ffi::c_void;
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender};
use tracing::debug;
use windows::Win32::System::Memory::{
    VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_PRIVATE, PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY, PAGE_READWRITE, PAGE_WRITECOPY,
};

use super::handle::OwnedProcess;
use crate::cancel::CancelToken;
use crate::scan::Chunk;

/// User allocations start here; nothing below is worth querying.
const MIN_SCAN_ADDR: u64 = 0x10000;

/// Region fragments smaller than this cannot hold the V3 key structure.
const V3_MIN_REGION: u64 = 100 * 1024;
/// Whole-address-space scans only bother with regions of at least 1 MiB.
const V4_MIN_REGION: u64 = 1024 * 1024;

const SEND_POLL: Duration = Duration::from_millis(50);

/// Which regions a scan wants copied.
pub(crate) enum RegionFilter {
    /// Committed regions with any writable protection bit, restricted to one
    /// module's range (V3).
    ModuleWritable { base: u64, size: u64 },
    /// Committed private PAGE_READWRITE regions anywhere in user space (V4).
    PrivateReadWrite,
}

pub(crate) fn max_scan_addr(is_64bit: bool) -> u64 {
    if is_64bit {
        0x7FFF_FFFF_FFFF
    } else {
        0x7FFF_FFFF
    }
}

/// Walk the target's address space, copying each accepted region onto the
/// chunk queue. Read failures drop the region and keep walking; the queue is
/// closed when this returns (the sender is consumed).
pub(crate) fn stream_regions(
    process: &OwnedProcess,
    is_64bit: bool,
    filter: RegionFilter,
    chunk_tx: Sender<Chunk>,
    cancel: CancelToken,
) {
    let (mut addr, end_addr, min_region) = match &filter {
        RegionFilter::ModuleWritable { base, size } => (*base, *base + *size, V3_MIN_REGION),
        RegionFilter::PrivateReadWrite => (MIN_SCAN_ADDR, max_scan_addr(is_64bit), V4_MIN_REGION),
    };
    debug!(
        start = format_args!("{addr:#x}"),
        end = format_args!("{end_addr:#x}"),
        "walking target address space"
    );

    while addr < end_addr {
        if cancel.is_cancelled() {
            return;
        }

        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQueryEx(
                process.raw(),
                Some(addr as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            break;
        }

        let region_size = info.RegionSize as u64;
        if region_size < min_region {
            addr += region_size.max(1);
            continue;
        }

        if region_accepted(&filter, &info) {
            // Clamp to the scan range so module-bounded reads stay inside
            // the module.
            let read_len = region_size.min(end_addr - addr);
            match process.read_region(addr, read_len as usize) {
                Some(bytes) => {
                    debug!(
                        base = format_args!("{addr:#x}"),
                        len = bytes.len(),
                        "queueing region"
                    );
                    if !send_chunk(&chunk_tx, &cancel, Chunk::new(addr, bytes)) {
                        return;
                    }
                }
                None => debug!(base = format_args!("{addr:#x}"), "region read failed, skipped"),
            }
        }

        let next = (info.BaseAddress as usize as u64).saturating_add(region_size);
        if next <= addr {
            debug!(addr = format_args!("{addr:#x}"), "address space walk stalled");
            break;
        }
        addr = next;
    }
}

fn region_accepted(filter: &RegionFilter, info: &MEMORY_BASIC_INFORMATION) -> bool {
    if info.State != MEM_COMMIT {
        return false;
    }
    match filter {
        RegionFilter::ModuleWritable { .. } => {
            let writable = PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY;
            (info.Protect & writable).0 != 0
        }
        RegionFilter::PrivateReadWrite => {
            (info.Protect & PAGE_READWRITE).0 != 0 && info.Type == MEM_PRIVATE
        }
    }
}

/// Blocking send with cancellation; false means stop producing.
fn send_chunk(chunk_tx: &Sender<Chunk>, cancel: &CancelToken, chunk: Chunk) -> bool {
    let mut pending = chunk;
    loop {
        match chunk_tx.send_timeout(pending, SEND_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                pending = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
