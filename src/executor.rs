//! Bounded worker pool for solver jobs.
//!
//! Workers pull jobs from a shared queue and send results back over a
//! channel; the caller merges them after the fact, keyed by job id.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::settings::Settings;

/// Independent unit of work.
///
/// Implementations only hold read-only shared state. `cancel` is raised when
/// the executor stops collecting results; long-running jobs should poll it.
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    /// Identity of the job, unique within one execution.
    fn id(&self) -> String;

    fn run(&self, cancel: &AtomicBool) -> Result<Self::Output>;
}

/// Results of one execution.
#[derive(Debug)]
pub struct ExecutionReport<T> {
    pub results: BTreeMap<String, T>,
    /// Jobs that failed, when failures do not halt the execution.
    pub failures: BTreeMap<String, Error>,
    /// The time budget ran out before every job completed.
    pub partial: bool,
}

impl<T> Default for ExecutionReport<T> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
            partial: false,
        }
    }
}

impl<T> ExecutionReport<T> {
    pub fn is_complete(&self) -> bool {
        !self.partial && self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct JobExecutor {
    workers: usize,
    timeout: Option<Duration>,
    halt_on_first_failure: bool,
}

impl Default for JobExecutor {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}

type Message<T> = (String, Result<T>);

impl JobExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            workers: settings.num_workers(),
            timeout: settings.timeout(),
            halt_on_first_failure: settings.halt_on_first_failure,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run all jobs and collect their results.
    ///
    /// Returns `Err` only if halting on the first failure is enabled and a
    /// job fails; otherwise failures are recorded in the report. On timeout,
    /// jobs still running are abandoned and the report is marked partial.
    pub fn execute<J: Job>(&self, jobs: Vec<J>) -> Result<ExecutionReport<J::Output>> {
        let total = jobs.len();
        let mut report = ExecutionReport::default();
        if total == 0 {
            return Ok(report);
        }

        let workers = self.workers.clamp(1, total);
        info!("Executing {} jobs on {} workers", total, workers);

        let queue = Arc::new(Mutex::new(jobs.into_iter().collect::<VecDeque<J>>()));
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Message<J::Output>>();

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let cancel = Arc::clone(&cancel);
                let tx = tx.clone();
                thread::spawn(move || worker(&queue, &cancel, &tx))
            })
            .collect();
        drop(tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut received = 0;
        while received < total {
            let message = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(remaining) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!("Timed out with {} of {} jobs completed", received, total);
                            report.partial = true;
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            received += 1;

            let (id, result) = message;
            match result {
                Ok(output) => {
                    debug!("Job {} completed", id);
                    report.results.insert(id, output);
                }
                Err(e) if self.halt_on_first_failure => {
                    warn!("Job {} failed, halting: {}", id, e);
                    cancel.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Job {} failed: {}", id, e);
                    report.failures.insert(id, e);
                }
            }
        }

        if report.partial {
            // In-flight jobs are abandoned; idle workers see the flag and exit.
            cancel.store(true, Ordering::SeqCst);
            return Ok(report);
        }

        for handle in handles {
            if handle.join().is_err() {
                return Err(Error::WorkerPanicked);
            }
        }
        if received < total {
            return Err(Error::WorkerPanicked);
        }
        Ok(report)
    }
}

fn worker<J: Job>(queue: &Mutex<VecDeque<J>>, cancel: &AtomicBool, tx: &mpsc::Sender<Message<J::Output>>) {
    while !cancel.load(Ordering::SeqCst) {
        let job = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some(job) = job else {
            break;
        };
        let id = job.id();
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(cancel))).unwrap_or(Err(Error::WorkerPanicked));
        if tx.send((id, result)).is_err() {
            break;
        }
    }
}

/// Split `items` into batches of `ceil(len / workers)` items, clamped to
/// `1..=max_chunk_size`.
pub fn batches<T: Clone>(items: &[T], workers: usize, max_chunk_size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = items.len().div_ceil(workers.max(1)).clamp(1, max_chunk_size.max(1));
    items.chunks(size).map(<[T]>::to_vec).collect()
}
