//! Bounded, order-preserving fan-out of block work onto a rayon pool.
//!
//! The calling thread is the only producer and the only consumer: it reads
//! inputs, spawns one pool task per block and writes results in index order.
//! Workers never block on each other, so the pool cannot deadlock however
//! small it is.  At most `max_in_flight` blocks are dispatched but not yet
//! written, which also caps the reorder buffer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use super::JobError;

type Completion<T> = (u64, Result<T, JobError>);

/// Run `work` over every input yielded by `next` and feed the results to
/// `sink` in index order.
///
/// `next(index)` returns `Ok(None)` once the inputs are exhausted.  The first
/// error from any stage stops dispatch; blocks already running are drained
/// (their results discarded) before the error is returned.
pub fn run_ordered<I, T, N, F, S>(
    pool:          &rayon::ThreadPool,
    max_in_flight: usize,
    mut next:      N,
    work:          F,
    mut sink:      S,
) -> Result<u64, JobError>
where
    I: Send + 'static,
    T: Send + 'static,
    N: FnMut(u64) -> Result<Option<I>, JobError>,
    F: Fn(u64, I) -> Result<T, JobError> + Send + Sync + 'static,
    S: FnMut(u64, T) -> Result<(), JobError>,
{
    let max_in_flight = max_in_flight.max(1);
    let work = Arc::new(work);
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<Completion<T>>();

    let mut reorder: BTreeMap<u64, T> = BTreeMap::new();
    let mut dispatched = 0u64;
    let mut written = 0u64;
    let mut exhausted = false;
    let mut failure: Option<JobError> = None;

    loop {
        // Dispatch while the window has room.
        while failure.is_none() && !exhausted && dispatched - written < max_in_flight as u64 {
            match next(dispatched) {
                Ok(Some(input)) => {
                    let index = dispatched;
                    let (tx, work, cancel) = (tx.clone(), Arc::clone(&work), Arc::clone(&cancel));
                    pool.spawn(move || {
                        let result = if cancel.load(Ordering::Relaxed) {
                            Err(JobError::Cancelled)
                        } else {
                            work(index, input)
                        };
                        let _ = tx.send((index, result));
                    });
                    dispatched += 1;
                }
                Ok(None) => exhausted = true,
                Err(e) => failure = Some(e),
            }
        }

        let outstanding = dispatched - written - reorder.len() as u64;
        if outstanding == 0 && (failure.is_some() || reorder.is_empty()) {
            break;
        }

        match rx.recv() {
            Ok((index, Ok(value))) => {
                if failure.is_some() {
                    // Draining: count it as consumed.
                    written += 1;
                    continue;
                }
                reorder.insert(index, value);
            }
            Ok((_, Err(e))) => {
                written += 1;
                if failure.is_none() {
                    cancel.store(true, Ordering::Relaxed);
                    failure = Some(e);
                }
                continue;
            }
            Err(_) => {
                return Err(failure.unwrap_or(JobError::Cancelled));
            }
        }

        while let Some(value) = reorder.remove(&written) {
            if let Err(e) = sink(written, value) {
                cancel.store(true, Ordering::Relaxed);
                written += 1;
                failure = Some(e);
                break;
            }
            written += 1;
        }
        if failure.is_some() {
            written += reorder.len() as u64;
            reorder.clear();
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(written),
    }
}
