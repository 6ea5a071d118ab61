//! V3 key search: the pointer-adjacent-length scan.
//!
//! The V3 client keeps its database key in a structure that stores the key
//! pointer directly before the key length (always 32). Scanning backwards
//! for the little-endian encoding of 32 and dereferencing the preceding
//! pointer biases the search toward the most recently allocated instance,
//! which tracks the currently loaded session.

use memchr::memmem;

use super::{
    plausible_target_ptr, read_le_ptr, Chunk, KeySink, ScanContext, SearchStrategy,
};
use crate::validate::DB_KEY_SIZE;

/// Little-endian 64-bit encoding of the key length 32; 32-bit targets use
/// the first four bytes.
const LEN32_SENTINEL: [u8; 8] = [0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Backward sentinel scan over one chunk; pointer width follows the target
/// architecture.
pub(crate) struct SentinelScan {
    ptr_size: usize,
}

impl SentinelScan {
    pub fn for_arch(is_64bit: bool) -> Self {
        Self {
            ptr_size: if is_64bit { 8 } else { 4 },
        }
    }

    fn pattern(&self) -> &'static [u8] {
        &LEN32_SENTINEL[..self.ptr_size]
    }
}

impl SearchStrategy for SentinelScan {
    fn name(&self) -> &'static str {
        "length_sentinel"
    }

    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool {
        let Some(reader) = ctx.reader else {
            return sink.complete();
        };
        let pattern = self.pattern();
        let hay = &chunk.bytes;
        if hay.len() < pattern.len() + self.ptr_size {
            return sink.complete();
        }

        let mut end = hay.len();
        loop {
            if ctx.cancel.is_cancelled() {
                return sink.complete();
            }
            let Some(hit) = memmem::rfind(&hay[..end], pattern) else {
                break;
            };
            if hit < self.ptr_size {
                break;
            }

            let ptr = read_le_ptr(&hay[hit - self.ptr_size..hit], self.ptr_size);
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
