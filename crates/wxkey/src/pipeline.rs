//! Producer/worker coordination for a scan.
//!
//! One producer copies candidate regions onto a bounded queue; W workers
//! drain it and report validated keys on a single result channel. The
//! coordinator merges results monotonically, cancels the scan once the
//! wanted slots are filled, and joins every task before returning so the
//! process handle outlives all of its users.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::ExtractError;
use crate::scan::{Chunk, KeyPair};

/// Chunk queue depth; bounds the scan's memory footprint to roughly this
/// many regions in flight.
pub(crate) const CHUNK_QUEUE_CAP: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(crate) fn worker_count() -> usize {
    num_cpus::get().clamp(2, 16)
}

/// Run one scan: spawn the producer and workers, merge their results and
/// map the terminal states.
///
/// `produce` must close the chunk queue on every exit path (dropping the
/// sender does); workers exit when the queue is drained or the scan token is
/// cancelled. Caller cancellation wins over any partial result.
pub(crate) fn run_scan<P, W>(
    cancel: &CancelToken,
    want_image: bool,
    produce: P,
    work: W,
) -> Result<KeyPair, ExtractError>
where
    P: FnOnce(Sender<Chunk>, CancelToken) + Send,
    W: Fn(Receiver<Chunk>, Sender<KeyPair>, CancelToken) + Sync,
{
    let scan_cancel = cancel.child();
    let (chunk_tx, chunk_rx) = bounded::<Chunk>(CHUNK_QUEUE_CAP);
    let (result_tx, result_rx) = bounded::<KeyPair>(1);

    let workers = worker_count();
    debug!(workers, "starting key search pipeline");

    let mut merged = KeyPair::default();

    std::thread::scope(|scope| {
        {
            let token = scan_cancel.clone();
            scope.spawn(move || produce(chunk_tx, token));
        }

        let work = &work;
        for _ in 0..workers {
            let rx = chunk_rx.clone();
            let tx = result_tx.clone();
            let token = scan_cancel.clone();
            scope.spawn(move || work(rx, tx, token));
        }
        drop(chunk_rx);
        drop(result_tx);

        // Drain until every worker is done even after an early fill, so no
        // worker blocks forever on a result send.
        loop {
            if cancel.is_cancelled() {
                scan_cancel.cancel();
            }
            match result_rx.recv_timeout(POLL_INTERVAL) {
                Ok(pair) => {
                    merged.merge(pair);
                    if merged.complete(want_image) {
                        scan_cancel.cancel();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    if cancel.is_cancelled() {
        return Err(ExtractError::Cancelled);
    }
    if merged.is_empty() {
        return Err(ExtractError::NoValidKey);
    }
    Ok(merged)
}

/// Deliver a (possibly partial) result, waiting for queue space unless the
/// scan is being torn down.
pub(crate) fn send_result(tx: &Sender<KeyPair>, cancel: &CancelToken, pair: KeyPair) {
    let mut pending = pair;
    loop {
        match tx.send_timeout(pending, POLL_INTERVAL) {
            Ok(()) => return,
            Err(SendTimeoutError::Timeout(back)) => {
                if cancel.is_cancelled() {
                    return;
                }
                pending = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(base: u64) -> Chunk {
        Chunk::new(base, vec![0u8; 16])
    }

    #[test]
    fn merges_partial_results_from_different_workers() {
        let cancel = CancelToken::new();
        let result = run_scan(
            &cancel,
            true,
            |tx, _token| {
                tx.send(chunk(1)).unwrap();
                tx.send(chunk(2)).unwrap();
            },
            |rx, tx, token| {
                while let Ok(chunk) = rx.recv() {
                    let pair = match chunk.base {
                        1 => KeyPair {
                            data: Some("aa".into()),
                            image: None,
                        },
                        2 => KeyPair {
                            data: None,
                            image: Some("bb".into()),
                        },
                        _ => continue,
                    };
                    send_result(&tx, &token, pair);
                }
            },
        )
        .unwrap();

        assert_eq!(result.data.as_deref(), Some("aa"));
        assert_eq!(result.image.as_deref(), Some("bb"));
    }

    #[test]
    fn first_fill_wins_per_slot() {
        let cancel = CancelToken::new();
        // One worker claims the data slot twice; the second value must lose.
        let result = run_scan(
            &cancel,
            false,
            |tx, _token| {
                tx.send(chunk(1)).unwrap();
            },
            |rx, tx, token| {
                while let Ok(_chunk) = rx.recv() {
                    send_result(
                        &tx,
                        &token,
                        KeyPair {
                            data: Some("first".into()),
                            image: None,
                        },
                    );
                    send_result(
                        &tx,
                        &token,
                        KeyPair {
                            data: Some("second".into()),
                            image: None,
                        },
                    );
                }
            },
        )
        .unwrap();

        assert_eq!(result.data.as_deref(), Some("first"));
    }

    #[test]
    fn empty_scan_reports_no_valid_key() {
        let cancel = CancelToken::new();
        let result = run_scan(
            &cancel,
            true,
            |tx, _token| {
                for base in 0..10 {
                    tx.send(chunk(base)).unwrap();
                }
            },
            |rx, _tx, _token| while rx.recv().is_ok() {},
        );
        assert!(matches!(result, Err(ExtractError::NoValidKey)));
    }

    #[test]
    fn caller_cancellation_discards_partial_results() {
        let cancel = CancelToken::new();
        let caller = cancel.clone();
        let result = run_scan(
            &cancel,
            true,
            |tx, token| {
                // Keep producing until the scan token observes the cancel.
                let mut base = 0;
                while !token.is_cancelled() {
                    if tx.send_timeout(chunk(base), POLL_INTERVAL).is_err() {
                        break;
                    }
                    base += 1;
                }
            },
            move |rx, tx, token| {
                while let Ok(chunk) = rx.recv() {
                    if chunk.base == 3 {
                        send_result(
                            &tx,
                            &token,
                            KeyPair {
                                data: Some("partial".into()),
                                image: None,
                            },
                        );
                        // The caller gives up mid-scan.
                        caller.cancel();
                        return;
                    }
                }
            },
        );
        assert!(matches!(result, Err(ExtractError::Cancelled)));
    }

    #[test]
    fn producer_backpressure_does_not_wedge_completion() {
        let cancel = CancelToken::new();
        let result = run_scan(
            &cancel,
            false,
            |tx, token| {
                // Flood far past the queue capacity.
                for base in 0..(CHUNK_QUEUE_CAP as u64 * 4) {
                    let mut pending = chunk(base);
                    loop {
                        match tx.send_timeout(pending, POLL_INTERVAL) {
                            Ok(()) => break,
                            Err(SendTimeoutError::Timeout(back)) => {
                                if token.is_cancelled() {
                                    return;
                                }
                                pending = back;
                            }
                            Err(SendTimeoutError::Disconnected(_)) => return,
                        }
                    }
                }
            },
            |rx, tx, token| {
                while let Ok(chunk) = rx.recv() {
                    if token.is_cancelled() {
                        return;
                    }
                    if chunk.base == 5 {
                        send_result(
                            &tx,
                            &token,
                            KeyPair {
                                data: Some("done".into()),
                                image: None,
                            },
                        );
                        return;
                    }
                }
            },
        )
        .unwrap();
        assert_eq!(result.data.as_deref(), Some("done"));
    }

    #[test]
    fn worker_limit_is_clamped() {
        let workers = worker_count();
        assert!((2..=16).contains(&workers));
    }
}
