//! Single-worker histogram filling.
//!
//! An [`Accumulator`] owns one expression pool, one sync plan and one partial
//! histogram per registered definition. It is never shared between threads;
//! parallel runs give each partition its own accumulator and merge the
//! results afterwards.

use crate::definition::Registry;
use crate::error::{HistError, Result};
use crate::histogram::FilledHistogram;
use crate::merge::{HistogramSet, RunSummary};
use crate::plan::{EventValues, HistSlots, Readiness, SyncPlan};
use crate::pool::ExprPool;
use crate::record::{Record, RecordBatch};

/// Per-worker filling state.
#[derive(Debug)]
pub struct Accumulator<'r> {
    registry: &'r Registry,
    pool: ExprPool,
    plan: SyncPlan,
    ev: EventValues,
    hists: Vec<FilledHistogram>,
    summary: RunSummary,
    coords: Vec<f64>,
}

impl<'r> Accumulator<'r> {
    /// Compile `registry`'s expressions into a private pool and allocate empty histograms.
    pub fn new(registry: &'r Registry) -> Result<Self> {
        let mut pool = registry.new_pool();
        let plan = SyncPlan::build(registry, &mut pool)?;
        let ev = plan.new_event_values();
        let hists = registry.definitions().iter().map(FilledHistogram::empty).collect();
        Ok(Self {
            registry,
            pool,
            plan,
            ev,
            hists,
            summary: RunSummary { partitions: 1, ..Default::default() },
            coords: Vec::with_capacity(crate::definition::MAX_DIMENSIONS),
        })
    }

    /// Fill every histogram from one record.
    ///
    /// Each expression is evaluated once. Histograms whose sync group has a
    /// cardinality mismatch, or whose expressions failed to evaluate, skip
    /// this record; all others fill normally.
    pub fn process_record(&mut self, record: &dyn Record) {
        self.plan.evaluate(&self.pool, record, &mut self.ev);
        self.summary.records_processed += 1;

        let mut mismatched = false;
        let mut failed = false;
        for (i, h) in self.hists.iter_mut().enumerate() {
            match self.plan.readiness(i, &self.ev) {
                Readiness::Ready(n) => {
                    fill_slots(h, &self.plan.hists()[i], &self.ev, n, &mut self.coords);
                }
                Readiness::CardinalityMismatch => {
                    h.skipped_records += 1;
                    mismatched = true;
                }
                Readiness::EvaluationFailed => {
                    h.skipped_records += 1;
                    failed = true;
                }
            }
        }

        if mismatched {
            self.summary.records_skipped += 1;
        }
        if failed {
            self.summary.records_with_evaluation_errors += 1;
        }
        self.log_errors();
    }

    fn log_errors(&mut self) {
        let record = self.summary.records_processed - 1;
        for e in self.ev.errors() {
            let first = match e {
                HistError::CardinalityMismatch { .. } => {
                    self.summary.cardinality_errors += 1;
                    self.summary.cardinality_errors == 1
                }
                _ => {
                    self.summary.evaluation_errors += 1;
                    self.summary.evaluation_errors == 1
                }
            };
            if first {
                log::warn!("record {record}: {e} (further errors of this kind logged at debug)");
            } else {
                log::debug!("record {record}: {e}");
            }
        }
    }

    /// Fill from every record of `batch`.
    ///
    /// Fails without filling anything if a column contradicts the schema.
    pub fn process_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        batch.check_schema(self.registry.schema())?;
        for row in batch.rows() {
            self.process_record(&row);
        }
        Ok(())
    }

    /// Record that this worker stopped before exhausting its input.
    pub fn mark_cancelled(&mut self) {
        self.summary.cancelled_partitions = 1;
    }

    /// Private expression pool.
    pub fn pool(&self) -> &ExprPool {
        &self.pool
    }

    /// Sync plan derived from the registry.
    pub fn plan(&self) -> &SyncPlan {
        &self.plan
    }

    /// Counters so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Partial histogram by name.
    pub fn histogram(&self, name: &str) -> Option<&FilledHistogram> {
        self.hists.iter().find(|h| h.name == name)
    }

    /// Hand over the partial result.
    pub fn finish(self) -> HistogramSet {
        HistogramSet { histograms: self.hists, summary: self.summary }
    }
}

fn fill_slots(
    h: &mut FilledHistogram,
    slots: &HistSlots,
    ev: &EventValues,
    n: usize,
    coords: &mut Vec<f64>,
) {
    for slot in 0..n {
        if let Some(sel) = slots.selection {
            let pass = ev.value(sel, slot);
            if pass == 0.0 || pass.is_nan() {
                continue;
            }
        }
        let weight = slots.weight.map_or(1.0, |w| ev.value(w, slot));
        coords.clear();
        coords.extend(slots.axes.iter().map(|&a| ev.value(a, slot)));
        h.fill(coords, weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::HistogramDef;
    use crate::schema::Schema;
    use approx::assert_relative_eq;

    fn schema() -> Schema {
        Schema::new().scalar("mu").scalar("w").jagged("pt").jagged("eta").jagged("q")
    }

    #[test]
    fn scalar_record_fills_once() {
        let reg =
            Registry::from_defs(schema(), [HistogramDef::new("mu").axis("mu", &[0.0, 10.0, 20.0])])
                .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(3).with_scalar("mu", vec![5.0, 15.0, 15.5]).unwrap();
        acc.process_batch(&batch).unwrap();
        let out = acc.finish();
        assert_eq!(out.get("mu").unwrap().content(), vec![1.0, 2.0]);
        assert_eq!(out.summary.records_processed, 3);
    }

    #[test]
    fn jagged_axis_scalar_weight() {
        let reg = Registry::from_defs(
            schema(),
            [HistogramDef::new("pt").axis("pt", &[0.0, 10.0, 20.0]).weight("w")],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(1)
            .with_scalar("w", vec![0.5])
            .unwrap()
            .with_jagged("pt", vec![vec![1.0, 2.0, 12.0]])
            .unwrap();
        acc.process_batch(&batch).unwrap();
        let h = acc.histogram("pt").unwrap();
        assert_eq!(h.entries(), 3);
        assert_relative_eq!(h.content()[0], 1.0);
        assert_relative_eq!(h.content()[1], 0.5);
        assert_relative_eq!(h.sumw2()[0], 0.5);
    }

    #[test]
    fn selection_per_slot() {
        let reg = Registry::from_defs(
            schema(),
            [HistogramDef::new("pos").axis("pt", &[0.0, 100.0]).selection("q > 0 && abs(eta) < 2.5")],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(1)
            .with_jagged("pt", vec![vec![10.0, 20.0, 30.0]])
            .unwrap()
            .with_jagged("eta", vec![vec![0.0, 3.0, -1.0]])
            .unwrap()
            .with_jagged("q", vec![vec![1.0, 1.0, -1.0]])
            .unwrap();
        acc.process_batch(&batch).unwrap();
        assert_eq!(acc.histogram("pos").unwrap().content(), vec![1.0]);
    }

    #[test]
    fn nan_selection_fails_the_cut() {
        let reg = Registry::from_defs(
            schema(),
            [HistogramDef::new("pt").axis("pt", &[0.0, 100.0]).selection("sqrt(q)")],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(1)
            .with_jagged("pt", vec![vec![10.0, 20.0, 30.0]])
            .unwrap()
            .with_jagged("q", vec![vec![1.0, -1.0, 0.0]])
            .unwrap();
        acc.process_batch(&batch).unwrap();
        assert_eq!(acc.histogram("pt").unwrap().entries(), 1);
    }

    #[test]
    fn mismatch_skips_only_affected_group() {
        let reg = Registry::from_defs(
            schema(),
            [
                HistogramDef::new("pt_eta").axis("pt", &[0.0, 100.0]).axis("eta", &[-5.0, 5.0]),
                HistogramDef::new("mu").axis("mu", &[0.0, 100.0]),
                HistogramDef::new("q").axis("q", &[-2.0, 2.0]),
            ],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(2)
            .with_scalar("mu", vec![10.0, 20.0])
            .unwrap()
            .with_jagged("pt", vec![vec![1.0, 2.0], vec![3.0]])
            .unwrap()
            .with_jagged("eta", vec![vec![0.1], vec![0.2]])
            .unwrap()
            .with_jagged("q", vec![vec![1.0], vec![-1.0, 1.0]])
            .unwrap();
        acc.process_batch(&batch).unwrap();

        let s = *acc.summary();
        assert_eq!(s.records_processed, 2);
        assert_eq!(s.records_skipped, 1);
        assert_eq!(s.cardinality_errors, 1);
        let out = acc.finish();
        assert_eq!(out.get("pt_eta").unwrap().entries(), 1);
        assert_eq!(out.get("pt_eta").unwrap().skipped_records, 1);
        assert_eq!(out.get("mu").unwrap().entries(), 2);
        assert_eq!(out.get("q").unwrap().entries(), 3);
    }

    #[test]
    fn empty_collection_fills_nothing() {
        let reg = Registry::from_defs(
            schema(),
            [HistogramDef::new("pt").axis("pt", &[0.0, 100.0]).weight("w")],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(1)
            .with_scalar("w", vec![2.0])
            .unwrap()
            .with_jagged("pt", vec![vec![]])
            .unwrap();
        acc.process_batch(&batch).unwrap();
        let out = acc.finish();
        assert_eq!(out.get("pt").unwrap().entries(), 0);
        assert_eq!(out.summary.records_skipped, 0);
    }

    #[test]
    fn missing_field_counts_evaluation_error() {
        let reg = Registry::from_defs(
            schema(),
            [
                HistogramDef::new("mu").axis("mu", &[0.0, 100.0]).weight("w"),
                HistogramDef::new("pt").axis("pt", &[0.0, 100.0]),
            ],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(2)
            .with_scalar("mu", vec![1.0, 2.0])
            .unwrap()
            .with_jagged("pt", vec![vec![1.0], vec![2.0]])
            .unwrap();
        acc.process_batch(&batch).unwrap();
        let out = acc.finish();
        assert_eq!(out.summary.evaluation_errors, 2);
        assert_eq!(out.summary.records_with_evaluation_errors, 2);
        assert_eq!(out.get("mu").unwrap().entries(), 0);
        assert_eq!(out.get("pt").unwrap().entries(), 2);
    }

    #[test]
    fn record_with_wrong_kind_counts_evaluation_error() {
        use crate::record::FieldValues;
        use std::collections::HashMap;

        let reg = Registry::from_defs(
            schema(),
            [
                HistogramDef::new("mu").axis("mu", &[0.0, 100.0]),
                HistogramDef::new("pt").axis("pt", &[0.0, 100.0]),
            ],
        )
        .unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let pt = [5.0, 6.0];
        let two = [1.0, 2.0];
        for mu in [FieldValues::Jagged(&[]), FieldValues::Jagged(&two)] {
            let rec: HashMap<String, FieldValues<'_>> = HashMap::from([
                ("mu".to_string(), mu),
                ("pt".to_string(), FieldValues::Jagged(&pt)),
            ]);
            acc.process_record(&rec);
        }

        let out = acc.finish();
        assert_eq!(out.summary.records_processed, 2);
        assert_eq!(out.summary.evaluation_errors, 2);
        assert_eq!(out.summary.records_with_evaluation_errors, 2);
        assert_eq!(out.get("mu").unwrap().entries(), 0);
        assert_eq!(out.get("mu").unwrap().skipped_records, 2);
        assert_eq!(out.get("pt").unwrap().entries(), 4);
    }

    #[test]
    fn batch_with_wrong_kind_rejected() {
        let reg =
            Registry::from_defs(schema(), [HistogramDef::new("mu").axis("mu", &[0.0, 1.0])]).unwrap();
        let mut acc = Accumulator::new(&reg).unwrap();
        let batch = RecordBatch::new(1).with_jagged("mu", vec![vec![0.5]]).unwrap();
        assert!(matches!(acc.process_batch(&batch), Err(HistError::InvalidBatch(_))));
        assert_eq!(acc.summary().records_processed, 0);
    }
}
