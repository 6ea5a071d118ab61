//! Chunk model and the seam between scanners and the rest of the core.
//!
//! A [`Chunk`] is an owned copy of one contiguous target region; ownership
//! moves from the producer to exactly one worker through the chunk queue, so
//! nothing locks its contents. Strategies read chunks, push candidates into
//! a [`KeySink`], and never mutate anything they are handed.

#[cfg_attr(not(windows), allow(dead_code))]
pub mod v3;
pub mod v4;

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::validate::{Validator, DB_KEY_SIZE, IMG_KEY_SIZE};

/// Lowest address worth dereferencing; user allocations start here.
pub(crate) const MIN_PTR_ADDR: u64 = 0x10000;
/// Highest user-mode address on 64-bit Windows.
pub(crate) const MAX_PTR_ADDR: u64 = 0x7FFF_FFFF_FFFF;

/// A copy of one contiguous region of the target's memory, tagged with the
/// region's base address in the target.
pub struct Chunk {
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl Chunk {
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }
}

/// Read access to the target's address space. Implemented by the process
/// handle on Windows and by fixtures in tests.
pub trait MemoryReader: Send + Sync {
    /// Read exactly `len` bytes at `addr`. `None` on failure or short read.
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>>;
}

/// Everything a strategy needs besides the chunk itself.
pub(crate) struct ScanContext<'a> {
    /// Dereference target for pointer candidates; absent when scanning a
    /// detached chunk (tests, single-chunk search).
    pub reader: Option<&'a dyn MemoryReader>,
    pub cancel: &'a CancelToken,
}

/// One named algorithm for locating key candidates within a chunk.
pub(crate) trait SearchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scan `chunk`, submitting candidates to `sink`. Returns true once the
    /// sink is complete and the worker can stop scanning.
    fn search(&self, chunk: &Chunk, ctx: &ScanContext<'_>, sink: &mut KeySink<'_>) -> bool;
}

/// The extraction result: either slot may be filled independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPair {
    /// 32-byte database key, lowercase hex.
    pub data: Option<String>,
    /// 16-byte image key, lowercase hex.
    pub image: Option<String>,
}

impl KeyPair {
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.image.is_none()
    }

    /// Monotonic fill: take `other`'s slots only where ours are empty.
    pub fn merge(&mut self, other: KeyPair) {
        if self.data.is_none() {
            self.data = other.data;
        }
        if self.image.is_none() {
            self.image = other.image;
        }
    }

    pub fn complete(&self, want_image: bool) -> bool {
        self.data.is_some() && (!want_image || self.image.is_some())
    }
}

/// Common candidate-submission path shared by every strategy: de-duplicates
/// by origin address, dispatches to the validator and fills the local result
/// monotonically. Without a validator it falls back to a plausibility check
/// and fills only the data slot, which is what detached-chunk scans use.
pub(crate) struct KeySink<'a> {
    validator: Option<&'a Validator>,
    want_image: bool,
    seen: HashSet<u64>,
    found: KeyPair,
}

impl<'a> KeySink<'a> {
    pub fn new(validator: Option<&'a Validator>, want_image: bool) -> Self {
        Self {
            validator,
            want_image,
            seen: HashSet::new(),
            found: KeyPair::default(),
        }
    }

    pub fn found(&self) -> &KeyPair {
        &self.found
    }

    pub fn complete(&self) -> bool {
        self.found.complete(self.want_image)
    }

    /// Submit a 32-byte candidate observed at `origin` (a target VA, or the
    /// chunk base plus offset for in-chunk finds). Returns `complete()`.
    pub fn offer(&mut self, origin: u64, candidate: &[u8]) -> bool {
        if self.complete() || candidate.len() != DB_KEY_SIZE {
            return self.complete();
        }
        if !self.seen.insert(origin) {
            return false;
        }

        match self.validator {
            Some(validator) => {
                if self.found.data.is_none() && validator.is_db_key(candidate) {
                    debug!(origin = format_args!("{origin:#x}"), "data key validated");
                    self.found.data = Some(hex::encode(candidate));
                } else if self.want_image
                    && self.found.image.is_none()
                    && validator.is_image_key(candidate)
                {
                    debug!(origin = format_args!("{origin:#x}"), "image key validated");
                    self.found.image = Some(hex::encode(&candidate[..IMG_KEY_SIZE]));
                }
            }
            None => {
                if self.found.data.is_none() && plausible_key(candidate) {
                    self.found.data = Some(hex::encode(candidate));
                }
            }
        }
        self.complete()
    }
}

/// Keys are random bytes: all-zero or single-valued windows cannot be one.
fn plausible_key(candidate: &[u8]) -> bool {
    let first = candidate[0];
    !candidate.iter().all(|&b| b == 0) && !candidate.iter().all(|&b| b == first)
}

/// Is `ptr` inside the user-mode address range worth dereferencing?
pub(crate) fn plausible_target_ptr(ptr: u64) -> bool {
    ptr > MIN_PTR_ADDR && ptr < MAX_PTR_ADDR
}

/// Decode a little-endian pointer of 4 or 8 bytes.
pub(crate) fn read_le_ptr(bytes: &[u8], ptr_size: usize) -> u64 {
    if ptr_size == 8 {
        LE::read_u64(&bytes[..8])
    } else {
        u64::from(LE::read_u32(&bytes[..4]))
    }
}
