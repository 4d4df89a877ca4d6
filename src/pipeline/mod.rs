//! Job execution.
//!
//! A [`Pipeline`] owns one worker pool shared by every job it runs.  Jobs run
//! one after another; within a job, blocks are read and written on the
//! calling thread while trials and decoding run on the pool (see
//! [`scheduler::run_ordered`]).
//!
//! # Events
//! Each job reports through an `mpsc` channel: any number of rate-limited
//! [`Event::Progress`] messages followed by exactly one [`Event::Finished`].
//! A closed receiver never fails a job.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::codec::CodecError;
use crate::format::FormatError;
use crate::job::{ConfigError, Job, Mode};

mod compress;
mod decompress;
pub mod scheduler;

/// Minimum spacing between two progress events of one job.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(50);
/// Dispatch window per worker thread.
const IN_FLIGHT_PER_THREAD: usize = 4;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("format error: {0}")]
    Format(FormatError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("job cancelled")]
    Cancelled,
    #[error("worker pool: {0}")]
    Pool(String),
}

impl From<FormatError> for JobError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Io(io) => JobError::Io(io),
            other               => JobError::Format(other),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `position` of `total` image bytes processed, `written` output bytes.
    Progress { job: usize, position: u64, total: u64, written: u64 },
    Finished { job: usize, status: JobStatus, reason: String },
}

/// Result of a successful job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written  { raw_size: u64, written: u64 },
    Checksum { raw_size: u64, crc32: u32 },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Written { raw_size, written } => {
                write!(f, "complete, {raw_size} -> {written} bytes")
            }
            Outcome::Checksum { crc32, .. } => write!(f, "CRC32 {crc32:08x}"),
        }
    }
}

/// Rate-limited progress reporting for one job.
pub(crate) struct Progress<'a> {
    job:       usize,
    total:     u64,
    events:    &'a Sender<Event>,
    next_emit: Instant,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(job: usize, total: u64, events: &'a Sender<Event>) -> Self {
        Self { job, total, events, next_emit: Instant::now() }
    }

    pub(crate) fn update(&mut self, position: u64, written: u64) {
        let now = Instant::now();
        if now < self.next_emit && position < self.total {
            return;
        }
        self.next_emit = now + PROGRESS_INTERVAL;
        let _ = self.events.send(Event::Progress { job: self.job, position, total: self.total, written });
    }
}

/// Remove a partially written output after a failure.
pub(crate) fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove partial output");
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Worker threads; 0 means one per logical CPU.
    pub threads: usize,
}

pub struct Pipeline {
    pool:    rayon::ThreadPool,
    threads: usize,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Result<Self, JobError> {
        let threads = if options.threads == 0 { num_cpus::get() } else { options.threads };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("csopack-worker-{i}"))
            .build()
            .map_err(|e| JobError::Pool(e.to_string()))?;
        debug!(threads, "worker pool started");
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.threads * IN_FLIGHT_PER_THREAD
    }

    /// Run one job to completion.  Always sends exactly one
    /// [`Event::Finished`] for `id`.
    pub fn run(&self, id: usize, job: &Job, events: &Sender<Event>) -> Result<Outcome, JobError> {
        let span = info_span!("job", id, input = %job.input.display());
        let _guard = span.enter();
        let started = Instant::now();

        let result = match job.mode {
            Mode::Compress   => compress::run(self, id, job, events),
            Mode::Decompress => decompress::run(self, id, job, events),
            Mode::Checksum   => decompress::checksum(self, id, job, events),
        };

        let (status, reason) = match &result {
            Ok(outcome) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, %outcome, "job finished");
                (JobStatus::Success, outcome.to_string())
            }
            Err(e) => {
                warn!(error = %e, "job failed");
                (JobStatus::Failure, e.to_string())
            }
        };
        let _ = events.send(Event::Finished { job: id, status, reason });
        result
    }

    /// Run `jobs` in order; job ids are their positions.  A failed job does
    /// not stop the ones after it.
    pub fn run_all(&self, jobs: &[Job], events: &Sender<Event>) -> Vec<Result<Outcome, JobError>> {
        jobs.iter()
            .enumerate()
            .map(|(id, job)| self.run(id, job, events))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn pipeline(threads: usize) -> Pipeline {
        Pipeline::new(PipelineOptions { threads }).unwrap()
    }

    #[test]
    fn scheduler_preserves_order() {
        let p = pipeline(4);
        let mut seen = Vec::new();
        let written = scheduler::run_ordered(
            p.pool(),
            p.max_in_flight(),
            |i| Ok((i < 64).then_some(i)),
            |_, i: u64| {
                // Later blocks finish first.
                thread::sleep(Duration::from_micros((64 - i) * 50));
                Ok(i * 10)
            },
            |i, v| {
                assert_eq!(v, i * 10);
                seen.push(i);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(written, 64);
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn scheduler_bounds_in_flight_work() {
        let p = pipeline(2);
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let sunk = Cell::new(0u64);
        scheduler::run_ordered(
            p.pool(),
            3,
            |i| {
                assert!(i - sunk.get() < 3, "window exceeded at block {i}");
                Ok((i < 50).then_some(()))
            },
            move |_, ()| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_, ()| {
                sunk.set(sunk.get() + 1);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn scheduler_stops_on_worker_error() {
        let p = pipeline(2);
        let mut sunk = Vec::new();
        let err = scheduler::run_ordered(
            p.pool(),
            p.max_in_flight(),
            |i| Ok((i < 1000).then_some(i)),
            |_, i: u64| if i == 5 { Err(JobError::Cancelled) } else { Ok(i) },
            |i, _| {
                sunk.push(i);
                Ok(())
            },
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
        assert!(sunk.iter().all(|&i| i < 5));
        assert!(sunk.len() <= 5);
    }

    #[test]
    fn scheduler_stops_on_sink_error() {
        let p = pipeline(2);
        let mut pulled = 0u64;
        let err = scheduler::run_ordered(
            p.pool(),
            4,
            |i| {
                pulled = i + 1;
                Ok(Some(i))
            },
            |_, i: u64| Ok(i),
            |i, _| if i == 3 { Err(JobError::Pool("full".into())) } else { Ok(()) },
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Pool(_)));
        assert!(pulled <= 8);
    }

    #[test]
    fn progress_is_rate_limited() {
        let (tx, rx) = mpsc::channel();
        let mut progress = Progress::new(7, 1000, &tx);
        for pos in 0..100 {
            progress.update(pos, pos / 2);
        }
        progress.update(1000, 500);
        drop(tx);
        let events: Vec<Event> = rx.iter().collect();
        assert!(events.len() >= 2 && events.len() < 100);
        assert_eq!(
            events.last(),
            Some(&Event::Progress { job: 7, position: 1000, total: 1000, written: 500 })
        );
    }

    #[test]
    fn format_io_errors_become_io_errors() {
        let e: JobError = FormatError::Io(io::Error::new(io::ErrorKind::NotFound, "gone")).into();
        assert!(matches!(e, JobError::Io(_)));
        let e: JobError = FormatError::Truncated("x".into()).into();
        assert!(matches!(e, JobError::Format(_)));
    }
}
