//! Platform extraction entry points: wire the enumerator, scanners and
//! validator into the pipeline.

use std::sync::Arc;

use tracing::debug;

use super::handle::OwnedProcess;
use super::module::find_module;
use super::region::{stream_regions, RegionFilter};
use crate::cancel::CancelToken;
use crate::error::ExtractError;
use crate::pipeline::{run_scan, send_result};
use crate::process::{ProcessInfo, ProcessStatus};
use crate::scan::v3::SentinelScan;
use crate::scan::{v4, KeyPair, KeySink, ScanContext, SearchStrategy};
use crate::validate::Validator;

/// The V3 client keeps its key inside this module.
pub(crate) const V3_MODULE_NAME: &str = "WeChatWin.dll";

/// V3: scan the main DLL's writable pages for the key descriptor; a single
/// data key is the only possible output.
pub(crate) fn extract_v3(
    cancel: &CancelToken,
    process: &ProcessInfo,
    validator: &Validator,
) -> Result<KeyPair, ExtractError> {
    if process.status == ProcessStatus::Offline {
        return Err(ExtractError::WeChatOffline);
    }

    let handle = Arc::new(OwnedProcess::open(process.pid)?);
    let is_64bit = handle.is_64bit()?;
    let module =
        find_module(process.pid, V3_MODULE_NAME).ok_or(ExtractError::WeChatDllNotFound)?;
    debug!(
        base = format_args!("{:#x}", module.base),
        size = module.size,
        "located V3 key module"
    );

    let producer_handle = Arc::clone(&handle);
    run_scan(
        cancel,
        false,
        move |chunk_tx, token| {
            stream_regions(
                &producer_handle,
                is_64bit,
                RegionFilter::ModuleWritable {
                    base: module.base,
                    size: module.size,
                },
                chunk_tx,
                token,
            );
        },
        |chunk_rx, result_tx, token| {
            let strategy = SentinelScan::for_arch(is_64bit);
            let mut sink = KeySink::new(Some(validator), false);
            let ctx = ScanContext {
                reader: Some(&*handle),
                cancel: &token,
            };

            while let Ok(chunk) = chunk_rx.recv() {
                if token.is_cancelled() {
                    return;
                }
                if strategy.search(&chunk, &ctx, &mut sink) {
                    let _ = result_tx.try_send(sink.found().clone());
                    return;
                }
            }
        },
    )
}

/// V4: scan every private committed page with the full strategy set; up to
/// two keys come back.
pub(crate) fn extract_v4(
    cancel: &CancelToken,
    process: &ProcessInfo,
    validator: &Validator,
) -> Result<KeyPair, ExtractError> {
    if process.status == ProcessStatus::Offline {
        return Err(ExtractError::WeChatOffline);
    }

    let handle = Arc::new(OwnedProcess::open(process.pid)?);
    let is_64bit = handle.is_64bit()?;

    let producer_handle = Arc::clone(&handle);
    run_scan(
        cancel,
        true,
        move |chunk_tx, token| {
            stream_regions(
                &producer_handle,
                is_64bit,
                RegionFilter::PrivateReadWrite,
                chunk_tx,
                token,
            );
        },
        |chunk_rx, result_tx, token| {
            let strategies = v4::strategies();
            let mut sink = KeySink::new(Some(validator), true);
            let ctx = ScanContext {
                reader: Some(&*handle),
                cancel: &token,
            };

            while let Ok(chunk) = chunk_rx.recv() {
                if token.is_cancelled() {
                    return;
                }

                let before = sink.found().clone();
                let mut complete = false;
                for strategy in &strategies {
                    if token.is_cancelled() {
                        return;
                    }
                    if strategy.search(&chunk, &ctx, &mut sink) {
                        complete = true;
                        break;
                    }
                }

                // Report the moment a slot fills so the coordinator can
                // merge across workers without waiting for end-of-input.
                if *sink.found() != before {
                    send_result(&result_tx, &token, sink.found().clone());
                }
                if complete {
                    return;
                }
            }

            if !sink.found().is_empty() {
                let _ = result_tx.try_send(sink.found().clone());
            }
        },
    )
}
