//! Worker orchestration: the fixed thread pool, the per-candidate pipeline,
//! statistics, and the checkpoint lifecycle.
//!
//! Every worker runs the same loop: cursor -> fetch -> extract -> harness ->
//! admit -> persist, exiting early per step. Malformed candidates are skipped
//! and counted; fatal instrumentation failures trip the shared cancellation
//! token so the whole pool unwinds cooperatively. The checkpoint is written
//! only after all workers have joined, which is what makes it consistent
//! without any extra snapshot locking.

use crate::cancel::CancelToken;
use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::envelope;
use crate::fetch::{FetchClient, FetchError};
use crate::harness::{Harness, HarnessError};
use crate::index::{IndexCursor, IndexError, IndexRecord, IndexSource};
use crate::store::{CorpusStore, StoreError};
use crate::universe::{Admission, CoverageUniverse};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("index stream failed: {0}")]
    Index(#[from] IndexError),

    #[error("instrumentation failure: {0}")]
    Harness(#[from] HarnessError),

    #[error("corpus store failure: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub threads: usize,
    pub stats_interval: Duration,
    pub state_file: PathBuf,
    /// Tested count carried over from a resumed checkpoint.
    pub initial_tested: u64,
}

#[derive(Default)]
struct Counts {
    tested: u64,
    skipped: u64,
    admitted: u64,
}

struct Stats {
    started: Instant,
    counts: Mutex<Counts>,
}

impl Stats {
    fn new(initial_tested: u64) -> Self {
        Self {
            started: Instant::now(),
            counts: Mutex::new(Counts {
                tested: initial_tested,
                ..Counts::default()
            }),
        }
    }
}

/// Read-only statistics snapshot, taken without pausing workers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub tested: u64,
    pub skipped: u64,
    pub admitted: u64,
    pub edges: usize,
    pub elapsed: Duration,
    pub rate: f64,
}

/// Final outcome of a completed (or interrupted) run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub tested: u64,
    pub skipped: u64,
    pub admitted: u64,
    pub edges: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
}

pub struct Session<S: IndexSource, F: FetchClient, H: Harness> {
    cursor: IndexCursor<S>,
    fetch: F,
    harness: H,
    universe: CoverageUniverse,
    store: CorpusStore,
    cancel: CancelToken,
    stats: Stats,
    config: SessionConfig,
}

impl<S: IndexSource, F: FetchClient, H: Harness> Session<S, F, H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cursor: IndexCursor<S>,
        fetch: F,
        harness: H,
        universe: CoverageUniverse,
        store: CorpusStore,
        cancel: CancelToken,
        config: SessionConfig,
    ) -> Self {
        let stats = Stats::new(config.initial_tested);
        Self {
            cursor,
            fetch,
            harness,
            universe,
            store,
            cancel,
            stats,
            config,
        }
    }

    /// Token clone for external interrupt wiring (signal handlers).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let counts = self.stats.counts.lock();
        let elapsed = self.stats.started.elapsed();
        let secs = elapsed.as_secs_f64();
        StatsSnapshot {
            tested: counts.tested,
            skipped: counts.skipped,
            admitted: counts.admitted,
            edges: self.universe.edge_count(),
            elapsed,
            rate: if secs > 0.0 {
                counts.tested as f64 / secs
            } else {
                0.0
            },
        }
    }

    /// Runs the pool to stream exhaustion or interrupt, then checkpoints.
    ///
    /// A fatal instrumentation failure returns `Err` without writing a
    /// checkpoint; a clean drain or a cooperative interrupt returns `Ok`
    /// after the checkpoint is saved.
    pub fn run(&self) -> Result<RunSummary, SessionError> {
        let fatal: Mutex<Option<SessionError>> = Mutex::new(None);
        let live = AtomicUsize::new(self.config.threads);

        std::thread::scope(|scope| {
            for worker in 0..self.config.threads {
                let fatal = &fatal;
                let live = &live;
                scope.spawn(move || {
                    self.worker_loop(worker, fatal);
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }

            // Periodic observability; reads shared state without pausing
            // anyone, and dies once the last worker is gone.
            scope.spawn(|| {
                let mut last_report = Instant::now();
                while live.load(Ordering::SeqCst) > 0 {
                    std::thread::sleep(Duration::from_millis(200));
                    if last_report.elapsed() >= self.config.stats_interval {
                        let s = self.stats_snapshot();
                        info!(
                            tested = s.tested,
                            skipped = s.skipped,
                            admitted = s.admitted,
                            edges = s.edges,
                            rate_per_sec = format_args!("{:.1}", s.rate),
                            "progress"
                        );
                        last_report = Instant::now();
                    }
                }
            });
        });

        if let Some(err) = fatal.into_inner() {
            return Err(err);
        }

        let (coverage, next_corpus_id) = self.universe.snapshot();
        let snapshot = self.stats_snapshot();
        let checkpoint = Checkpoint {
            stream_position: self.cursor.checkpoint_position(),
            next_corpus_id,
            tested_count: snapshot.tested,
            coverage,
        };
        checkpoint.save(&self.config.state_file)?;
        debug!(path = ?self.config.state_file, "checkpoint saved");

        Ok(RunSummary {
            tested: snapshot.tested,
            skipped: snapshot.skipped,
            admitted: snapshot.admitted,
            edges: snapshot.edges,
            elapsed: snapshot.elapsed,
            interrupted: self.cancel.is_cancelled(),
        })
    }

    fn worker_loop(&self, worker: usize, fatal: &Mutex<Option<SessionError>>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let row = match self.cursor.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    self.record_fatal(fatal, e.into());
                    break;
                }
            };

            // Structurally invalid rows (header rows, bad numerics) are
            // dropped here, never re-queued.
            let Some(record) = IndexRecord::from_row(&row) else {
                continue;
            };

            let raw = match self.fetch.fetch(
                &record.archive_locator,
                record.offset,
                record.length,
                &self.cancel,
            ) {
                Ok(raw) => raw,
                Err(FetchError::Cancelled) => break,
            };

            let payload = match envelope::extract(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(worker, locator = %record.archive_locator, error = %e, "skipping malformed record");
                    self.stats.counts.lock().skipped += 1;
                    continue;
                }
            };

            let report = match self.harness.run(worker, &payload, &self.cancel) {
                Ok(report) => report,
                Err(HarnessError::Cancelled) => break,
                Err(e @ HarnessError::MalformedArtifact { .. }) => {
                    // Garbled instrumentation output: nothing downstream can
                    // be trusted, abort without checkpointing.
                    error!(worker, error = %e, "aborting run");
                    std::process::exit(2);
                }
                Err(e) => {
                    self.record_fatal(fatal, e.into());
                    break;
                }
            };

            match self.universe.admit(&report.edges) {
                Admission::Admitted { id, new_edges } => {
                    if let Err(e) = self.store.persist(id, &payload, &report.artifact) {
                        self.record_fatal(fatal, e.into());
                        break;
                    }
                    self.stats.counts.lock().admitted += 1;
                    debug!(worker, id, new_edges, url = %record.source_url, "admitted candidate");
                }
                Admission::Rejected => {}
            }

            self.stats.counts.lock().tested += 1;
        }

        self.harness.cleanup(worker);
        debug!(worker, "worker finished");
    }

    fn record_fatal(&self, fatal: &Mutex<Option<SessionError>>, err: SessionError) {
        let mut slot = fatal.lock();
        if slot.is_none() {
            error!(error = %err, "fatal failure, shutting down all workers");
            *slot = Some(err);
        }
        self.cancel.cancel();
    }
}
