use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs of one analysis run.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Number of worker threads; `0` means one per available core.
    pub workers: usize,
    /// Upper bound on the number of source locations per job.
    pub max_chunk_size: usize,
    /// Wall-clock budget in milliseconds.
    pub timeout: Option<u64>,
    pub halt_on_first_failure: bool,
    /// Specialize ACLs to the header space before line analysis.
    pub specialize: bool,
    /// Initial size of the BDD unique table, as a power of two.
    pub bdd_table_bits: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            max_chunk_size: 64,
            timeout: None,
            halt_on_first_failure: false,
            specialize: true,
            bdd_table_bits: 16,
        }
    }
}

impl Settings {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_halt_on_first_failure(mut self, halt: bool) -> Self {
        self.halt_on_first_failure = halt;
        self
    }

    pub fn with_specialize(mut self, specialize: bool) -> Self {
        self.specialize = specialize;
        self
    }

    pub fn with_bdd_table_bits(mut self, bits: usize) -> Self {
        self.bdd_table_bits = bits;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    /// Effective number of worker threads, at least one.
    pub fn num_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}
