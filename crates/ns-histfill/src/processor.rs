//! Parallel driver: one accumulator per partition, reduced at the end.
//!
//! Partitions are handed to rayon workers. Every worker builds its own
//! expression pool from the shared [`Registry`], fills a private
//! [`HistogramSet`] and returns it by value; partial sets are then merged
//! with rayon's associative reduce.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::accumulator::Accumulator;
use crate::definition::Registry;
use crate::error::{HistError, Result};
use crate::histogram::FilledHistogram;
use crate::merge::{HistogramSet, RunSummary};
use crate::record::RecordBatch;

/// Processor options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Worker threads. Unset or `0` uses rayon's global pool; a positive value
    /// is capped at the number of CPUs; a negative value leaves that many CPUs idle.
    pub threads: Option<i32>,
    /// Stop each partition after this many records.
    pub max_records: Option<u64>,
}

impl ProcessorConfig {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread request.
    pub fn threads(mut self, n: i32) -> Self {
        self.threads = Some(n);
        self
    }

    /// Limit records per partition.
    pub fn max_records(mut self, n: u64) -> Self {
        self.max_records = Some(n);
        self
    }
}

/// Translate a thread request into a pool size, given `cpus` available cores.
///
/// `None` means "use the global rayon pool".
pub fn resolve_threads(requested: Option<i32>, cpus: usize) -> Option<usize> {
    let cpus = cpus.max(1);
    match requested? {
        0 => None,
        n if n > 0 => Some((n as usize).min(cpus)),
        n => Some(cpus.saturating_sub(n.unsigned_abs() as usize).max(1)),
    }
}

/// Shared flag asking running partitions to stop.
///
/// Cancelled partitions still return valid, mergeable partial results.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// `true` once [`cancel`](Self::cancel) was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs a validated registry over partitioned input.
#[derive(Debug, Clone)]
pub struct Processor {
    registry: Arc<Registry>,
    config: ProcessorConfig,
    cancel: CancelToken,
}

impl Processor {
    /// Processor over `registry`.
    pub fn new(registry: impl Into<Arc<Registry>>, config: ProcessorConfig) -> Self {
        Self { registry: registry.into(), config, cancel: CancelToken::new() }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this processor's runs.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The registry being filled.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Options.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process every partition and merge the results.
    ///
    /// Each partition is an iterator of batches, consumed in order by one
    /// worker. A batch error or a schema violation fails the whole run;
    /// per-record errors are only counted in the returned summary.
    pub fn run<P>(&self, partitions: Vec<P>) -> Result<HistogramSet>
    where
        P: IntoIterator<Item = Result<RecordBatch>> + Send,
    {
        let start = Instant::now();
        let n_partitions = partitions.len();
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = resolve_threads(self.config.threads, cpus);

        let reduce = || -> Result<Option<HistogramSet>> {
            partitions
                .into_par_iter()
                .map(|p| self.run_partition(p))
                .try_reduce_with(|a, b| a.merged(b))
                .transpose()
        };

        let merged = match threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| HistError::ThreadPool(e.to_string()))?;
                pool.install(reduce)?
            }
            None => reduce()?,
        };
        let out = merged.unwrap_or_else(|| self.empty_set());

        log::info!(
            "filled {} histograms ({} expressions, {} duplicate definitions) over {} partitions \
             on {} threads in {:.3}s: {}",
            self.registry.len(),
            self.registry.n_expressions(),
            self.registry.duplicates(),
            n_partitions,
            threads.unwrap_or_else(rayon::current_num_threads),
            start.elapsed().as_secs_f64(),
            out.summary
        );
        if out.summary.is_partial() {
            log::warn!(
                "run cancelled: {} of {} partitions incomplete",
                out.summary.cancelled_partitions,
                out.summary.partitions
            );
        }
        Ok(out)
    }

    /// Treat each batch as its own partition.
    pub fn run_batches(&self, batches: Vec<RecordBatch>) -> Result<HistogramSet> {
        self.run(batches.into_iter().map(|b| std::iter::once(Ok::<_, HistError>(b))).collect())
    }

    fn run_partition<P>(&self, partition: P) -> Result<HistogramSet>
    where
        P: IntoIterator<Item = Result<RecordBatch>>,
    {
        let mut acc = Accumulator::new(&self.registry)?;
        log::debug!(
            "partition worker: {} expressions in {} sync groups",
            acc.pool().len(),
            acc.plan().groups().len()
        );
        let limit = self.config.max_records.unwrap_or(u64::MAX);

        let mut batches = partition.into_iter();
        'batches: loop {
            // Checked before pulling the next batch from the source.
            if self.cancel.is_cancelled() {
                acc.mark_cancelled();
                break;
            }
            let Some(batch) = batches.next() else { break };
            let batch = batch?;
            batch.check_schema(self.registry.schema())?;
            for row in batch.rows() {
                if acc.summary().records_processed >= limit {
                    log::debug!("partition reached max_records={limit}");
                    break 'batches;
                }
                if self.cancel.is_cancelled() {
                    acc.mark_cancelled();
                    break 'batches;
                }
                acc.process_record(&row);
            }
        }
        Ok(acc.finish())
    }

    fn empty_set(&self) -> HistogramSet {
        HistogramSet {
            histograms: self.registry.definitions().iter().map(FilledHistogram::empty).collect(),
            summary: RunSummary::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::HistogramDef;
    use crate::schema::Schema;

    fn registry() -> Registry {
        Registry::from_defs(
            Schema::new().scalar("x"),
            [HistogramDef::new("x").axis("x", &[0.0, 5.0, 10.0])],
        )
        .unwrap()
    }

    fn batch(xs: &[f64]) -> RecordBatch {
        RecordBatch::new(xs.len()).with_scalar("x", xs.to_vec()).unwrap()
    }

    #[test]
    fn thread_resolution() {
        assert_eq!(resolve_threads(None, 8), None);
        assert_eq!(resolve_threads(Some(0), 8), None);
        assert_eq!(resolve_threads(Some(4), 8), Some(4));
        assert_eq!(resolve_threads(Some(16), 8), Some(8));
        assert_eq!(resolve_threads(Some(-2), 8), Some(6));
        assert_eq!(resolve_threads(Some(-20), 8), Some(1));
    }

    #[test]
    fn run_merges_partitions() {
        let p = Processor::new(registry(), ProcessorConfig::new().threads(2));
        let out = p.run_batches(vec![batch(&[1.0, 6.0]), batch(&[7.0]), batch(&[])]).unwrap();
        assert_eq!(out.get("x").unwrap().content(), vec![1.0, 2.0]);
        assert_eq!(out.summary.partitions, 3);
        assert_eq!(out.summary.records_processed, 3);
    }

    #[test]
    fn no_partitions_yields_empty_histograms() {
        let p = Processor::new(registry(), ProcessorConfig::new());
        let out = p.run_batches(Vec::new()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("x").unwrap().entries(), 0);
    }

    #[test]
    fn max_records_per_partition() {
        let p = Processor::new(registry(), ProcessorConfig::new().max_records(2));
        let part: Vec<Result<RecordBatch>> = vec![Ok(batch(&[1.0])), Ok(batch(&[2.0, 3.0, 4.0]))];
        let out = p.run(vec![part]).unwrap();
        assert_eq!(out.summary.records_processed, 2);
        assert!(!out.summary.is_partial());
    }

    #[test]
    fn cancelled_run_is_partial_but_valid() {
        let p = Processor::new(registry(), ProcessorConfig::new());
        p.cancel_token().cancel();
        let out = p.run_batches(vec![batch(&[1.0]), batch(&[2.0])]).unwrap();
        assert_eq!(out.summary.cancelled_partitions, 2);
        assert_eq!(out.summary.records_processed, 0);
        assert_eq!(out.len(), 1);
    }

    /// Yields `batches`, cancelling `token` while the second one is pulled.
    struct CancelOnSecondPull {
        batches: std::vec::IntoIter<RecordBatch>,
        token: CancelToken,
        pulls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Iterator for CancelOnSecondPull {
        type Item = Result<RecordBatch>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.pulls.fetch_add(1, Ordering::Relaxed) == 1 {
                self.token.cancel();
            }
            self.batches.next().map(Ok)
        }
    }

    #[test]
    fn cancelled_worker_stops_pulling_batches() {
        let p = Processor::new(registry(), ProcessorConfig::new());
        let pulls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let part = CancelOnSecondPull {
            batches: vec![batch(&[1.0, 6.0]), batch(&[2.0]), batch(&[3.0])].into_iter(),
            token: p.cancel_token(),
            pulls: Arc::clone(&pulls),
        };
        let out = p.run(vec![part]).unwrap();
        assert_eq!(out.summary.records_processed, 2);
        assert_eq!(out.summary.cancelled_partitions, 1);
        assert_eq!(out.get("x").unwrap().content(), vec![1.0, 1.0]);
        assert_eq!(pulls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn batch_error_fails_run() {
        let p = Processor::new(registry(), ProcessorConfig::new());
        let part: Vec<Result<RecordBatch>> =
            vec![Ok(batch(&[1.0])), Err(HistError::InvalidBatch("truncated".into()))];
        assert!(matches!(p.run(vec![part]), Err(HistError::InvalidBatch(_))));
    }
}
