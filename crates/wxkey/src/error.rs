//! Error taxonomy for the extraction core.
//!
//! Only setup failures and the terminal "nothing validated" outcome surface
//! to callers. Per-region and per-candidate failures are logged inside the
//! scan and never propagate.

use std::path::PathBuf;

/// Errors that can terminate an extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The target process is not alive. Callers may re-discover and retry.
    #[error("WeChat process is not running")]
    WeChatOffline,

    /// The OS refused a read/query handle to the target. Usually a privilege
    /// problem, occasionally a race with process exit.
    #[error("failed to open WeChat process")]
    OpenProcessFailed(#[source] std::io::Error),

    /// The V3 main module is not loaded in the target, which normally means
    /// the client is not a V3 build.
    #[error("WeChatWin.dll not found in target process")]
    WeChatDllNotFound,

    /// The validator could not read the reference database page.
    #[error("reference database page missing or unreadable: {0}")]
    ReferencePageMissing(PathBuf),

    /// The scan ran to completion without a single validator-approved key.
    #[error("no valid key found")]
    NoValidKey,

    /// The caller's cancellation token fired.
    #[error("extraction cancelled")]
    Cancelled,

    /// Memory acquisition is only implemented for Windows targets.
    #[error("key extraction is not supported on this platform")]
    UnsupportedPlatform,
}
