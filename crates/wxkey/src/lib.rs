//! # wxkey
//!
//! Recovers a WeChat client's database key (and, for V4 clients, the media
//! key) from the memory of the running process. Given a PID, the extractor
//! walks the target's address space, pattern-scans candidate regions across
//! a pool of workers and checks every candidate against a known-ciphertext
//! oracle built from the user's own database.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use wxkey::{extract, CancelToken, ClientVersion, Platform, ProcessInfo, Validator};
//!
//! # fn main() -> Result<(), wxkey::ExtractError> {
//! let validator = Validator::new(
//!     Platform::Windows,
//!     ClientVersion::V4,
//!     Path::new(r"C:\Users\me\Documents\xwechat_files\wxid_xxx"),
//! )?;
//!
//! let process = ProcessInfo::from_pid(13676);
//! let cancel = CancelToken::new();
//! let keys = extract(&cancel, &process, &validator)?;
//!
//! if let Some(data_key) = &keys.data {
//!     println!("DataKey: {data_key}");
//! }
//! if let Some(image_key) = &keys.image {
//!     println!("ImageKey: {image_key}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Keys are returned in memory only; nothing is persisted. Extraction is
//! implemented for Windows targets; on other platforms [`extract`] returns
//! [`ExtractError::UnsupportedPlatform`], while the validator and the
//! chunk-level search remain usable everywhere.

mod cancel;
mod error;
#[cfg_attr(not(windows), allow(dead_code))]
mod pipeline;
mod process;
mod scan;
mod validate;
#[cfg(windows)]
mod windows;

pub use cancel::CancelToken;
pub use error::ExtractError;
pub use process::{
    locate_processes, ProcessInfo, ProcessStatus, V3_IMAGE_NAME, V4_IMAGE_NAME,
};
pub use scan::v4::search_chunk;
pub use scan::{Chunk, KeyPair, MemoryReader};
pub use validate::{
    ClientVersion, Platform, Validator, DB_KEY_SIZE, IMG_KEY_SIZE, PAGE_SIZE,
};

/// Extract the keys for the validator's client version from `process`.
///
/// Returns as soon as every wanted slot is filled, the address space is
/// exhausted, or `cancel` fires. Partial success is success: a pair with
/// only one slot filled is `Ok`.
pub fn extract(
    cancel: &CancelToken,
    process: &ProcessInfo,
    validator: &Validator,
) -> Result<KeyPair, ExtractError> {
    #[cfg(windows)]
    {
        match validator.version() {
            ClientVersion::V3 => windows::extract::extract_v3(cancel, process, validator),
            ClientVersion::V4 => windows::extract::extract_v4(cancel, process, validator),
        }
    }
    #[cfg(not(windows))]
    {
        let _ = (cancel, process, validator);
        Err(ExtractError::UnsupportedPlatform)
    }
}
