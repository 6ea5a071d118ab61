//! V4 key search strategies.
//!
//! V4 clients vary by minor version: some keep the V3-style key descriptor,
//! newer builds only leave indirect traces (log strings near the key-install
//! path, the embedded SQLite runtime, loader artifacts). No single signature
//! is reliable, so every chunk is run through all strategies and the first
//! validator-approved candidate wins per key slot.

use std::ops::Range;

use byteorder::{ByteOrder, LE};
use memchr::memmem;

use super::{
    plausible_target_ptr, Chunk, KeyPair, KeySink, ScanContext, SearchStrategy, MIN_PTR_ADDR,
};
use crate::cancel::CancelToken;
use crate::validate::{Validator, DB_KEY_SIZE};

/// Three adjacent 64-bit words of the V4 key descriptor: a null field, the
/// key length 32 and the sibling field 47.
pub(crate) const V4_KEY_PATTERN: [u8; 24] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x2F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const PTR_SIZE: usize = 8;

const SET_DB_KEY_MARKER: &[u8] = b"SetDBKey";
const SET_DB_KEY_RANGE: usize = 200;

const UNOPENED_MARKER: &[u8] = b"unopened";
const UNOPENED_RANGE: usize = 1000;
const SQLITE_MARKERS: [&[u8]; 6] = [
    b"sqlite3_exec",
    b"sqlite3_prepare_v2",
    b"sqlite3_prepare",
    b"sqlite3_step",
    b"setCipherKey",
    b"WCDB",
];
const SQLITE_RANGE: usize = 500;

const WEIXIN_MARKERS: [&[u8]; 3] = [b"Weixin.dll", b"xwechat_files", b"db_storage"];
const WEIXIN_RANGE: usize = 500;

/// The full V4 strategy set, in the order a worker runs them over a chunk.
pub(crate) fn strategies() -> Vec<Box<dyn SearchStrategy>> {
    vec![
        Box::new(BasePattern),
        Box::new(PointerSentinel),
        Box::new(SetDbKeyLog),
        Box::new(SqliteSafety),
        Box::new(WeixinDll),
    ]
}

/// Scan one detached chunk with every V4 strategy. This is the surface the
/// end-to-end scenarios exercise; without a validator the first plausible
/// candidate fills the data slot.
pub fn search_chunk(cancel: &CancelToken, chunk: &Chunk, validator: Option<&Validator>) -> KeyPair {
    let ctx = ScanContext {
        reader: None,
        cancel,
    };
    let mut sink = KeySink::new(validator, validator.is_some());
    for strategy in strategies() {
        if cancel.is_cancelled() || strategy.search(chunk, &ctx, &mut sink) {
            break;
        }
    }
    sink.found().clone()
}

/// Backward scan for the key descriptor; the preceding 8 bytes are an offset
/// within the current chunk.
pub(crate) struct BasePattern;

impl SearchStrategy for BasePattern {
    fn name(&self) -> &'static str {
        "base_pattern"
    }

    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool {
        let hay = &chunk.bytes;
        if hay.len() < V4_KEY_PATTERN.len() + PTR_SIZE {
            return sink.complete();
        }
        let offset_limit = hay.len() - DB_KEY_SIZE;

        let mut end = hay.len();
        loop {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            let Some(hit) = memmem::rfind(&hay[..end], &V4_KEY_PATTERN) else {
                break;
            };
            if hit < PTR_SIZE {
                break;
            }

            let offset = LE::read_u64(&hay[hit - PTR_SIZE..hit]);
            if offset > MIN_PTR_ADDR && offset < offset_limit as u64 {
                let offset = offset as usize;
                let candidate = &hay[offset..offset + DB_KEY_SIZE];
                if sink.offer(chunk.base + offset as u64, candidate) {
                    return true;
                }
            }

            // The descriptor cannot overlap itself, so resume directly
            // before this hit.
            end = hit;
        }
        sink.complete()
    }
}

/// Backward scan for the same descriptor, reading the preceding 8 bytes as a
/// pointer into the target's address space. Covers the V4 builds that still
/// use the V3-style descriptor.
pub(crate) struct PointerSentinel;

impl SearchStrategy for PointerSentinel {
    fn name(&self) -> &'static str {
        "pointer_sentinel"
    }

    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool {
        let Some(reader) = ctx.reader else {
            return sink.complete();
        };
        let hay = &chunk.bytes;
        if hay.len() < V4_KEY_PATTERN.len() + PTR_SIZE {
            return sink.complete();
        }

        let mut end = hay.len();
        loop {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            let Some(hit) = memmem::rfind(&hay[..end], &V4_KEY_PATTERN) else {
                break;
            };
            if hit < PTR_SIZE {
                break;
            }

            let ptr = LE::read_u64(&hay[hit - PTR_SIZE..hit]);
            if plausible_target_ptr(ptr) {
                if let Some(candidate) = reader.read_bytes(ptr, DB_KEY_SIZE) {
                    if sink.offer(ptr, &candidate) {
                        return true;
                    }
                }
            }

            end = hit - 1;
        }
        sink.complete()
    }
}

/// Exhaustively test 32-byte windows inside `range`, and optionally every
/// 8-byte window as an in-chunk pointer. Returns true once the sink is
/// complete.
fn test_windows_in_range(
    chunk: &Chunk,
    range: Range<usize>,
    ctx: &ScanContext<'_>,
    sink: &mut KeySink<'_>,
    with_pointers: bool,
) -> bool {
    let hay = &chunk.bytes;
    let start = range.start;
    let end = range.end.min(hay.len());

    if end >= start + DB_KEY_SIZE {
        for offset in start..=end - DB_KEY_SIZE {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            if sink.offer(chunk.base + offset as u64, &hay[offset..offset + DB_KEY_SIZE]) {
                return true;
            }
        }
    }

    if with_pointers && end >= start + PTR_SIZE && hay.len() > DB_KEY_SIZE {
        let offset_limit = (hay.len() - DB_KEY_SIZE) as u64;
        for offset in start..=end - PTR_SIZE {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            let ptr = LE::read_u64(&hay[offset..offset + PTR_SIZE]);
            if ptr > MIN_PTR_ADDR && ptr < offset_limit {
                let ptr = ptr as usize;
                if sink.offer(chunk.base + ptr as u64, &hay[ptr..ptr + DB_KEY_SIZE]) {
                    return true;
                }
            }
        }
    }

    sink.complete()
}

/// Search around the "SetDBKey" log string that sits near the key-install
/// code path.
pub(crate) struct SetDbKeyLog;

impl SearchStrategy for SetDbKeyLog {
    fn name(&self) -> &'static str {
        "setdbkey_log"
    }

    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool {
        let hay = &chunk.bytes;
        for hit in memmem::find_iter(hay, SET_DB_KEY_MARKER) {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            let start = hit.saturating_sub(SET_DB_KEY_RANGE);
            let end = hit + SET_DB_KEY_MARKER.len() + SET_DB_KEY_RANGE;
            if test_windows_in_range(chunk, start..end, ctx, sink, true) {
                return true;
            }
        }
        sink.complete()
    }
}

/// Search around the SQLite "unopened" safety-check string, narrowing to the
/// sqlite3/WCDB symbols that sit near the cipher-key plumbing.
pub(crate) struct SqliteSafety;

impl SearchStrategy for SqliteSafety {
    fn name(&self) -> &'static str {
        "sqlite_safety"
    }

    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool {
        let hay = &chunk.bytes;
        for hit in memmem::find_iter(hay, UNOPENED_MARKER) {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            let window_start = hit.saturating_sub(UNOPENED_RANGE);
            let window_end = (hit + UNOPENED_MARKER.len() + UNOPENED_RANGE).min(hay.len());
            let window = &hay[window_start..window_end];

            for marker in SQLITE_MARKERS {
                for sub_hit in memmem::find_iter(window, marker) {
                    if ctx.cancel.is_cancelled() {
                        return sink.complete();
                    }
                    let anchor = window_start + sub_hit;
                    let start = anchor.saturating_sub(SQLITE_RANGE).max(window_start);
                    let end = (anchor + SQLITE_RANGE).min(window_end);
                    if test_windows_in_range(chunk, start..end, ctx, sink, true) {
                        return true;
                    }
                }
            }
        }
        sink.complete()
    }
}

/// Search around the loader artifacts of 4.1+ builds, which replaced
/// WeChatWin.dll with Weixin.dll and moved storage under xwechat_files.
pub(crate) struct WeixinDll;

impl SearchStrategy for WeixinDll {
    fn name(&self) -> &'static str {
        "weixin_dll"
    }

    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool {
        let hay = &chunk.bytes;
        for marker in WEIXIN_MARKERS {
            for hit in memmem::find_iter(hay, marker) {
                if ctx.cancel.is_cancelled() {
                    return sink.complete();
                }
                let anchor = hit + marker.len();
                let start = anchor.saturating_sub(WEIXIN_RANGE);
                let end = anchor + WEIXIN_RANGE;
                if test_windows_in_range(chunk, start..end, ctx, sink, false) {
                    return true;
                }
            }
        }
        sink.complete()
    }
}
