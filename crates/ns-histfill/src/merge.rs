//! Combining partial results from independent partitions.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HistError, Result};
use crate::histogram::FilledHistogram;

/// Bookkeeping for one or more processed partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Partitions contributing to this result.
    pub partitions: u64,
    /// Partitions that stopped early on cancellation.
    pub cancelled_partitions: u64,
    /// Records consumed.
    pub records_processed: u64,
    /// Records that lost at least one histogram fill to a cardinality mismatch.
    pub records_skipped: u64,
    /// Cardinality mismatches raised (one per failing sync group per record).
    pub cardinality_errors: u64,
    /// Records that lost at least one histogram fill to an evaluation error.
    pub records_with_evaluation_errors: u64,
    /// Evaluation errors raised.
    pub evaluation_errors: u64,
}

impl RunSummary {
    /// Add `other`'s counters into `self`.
    pub fn merge(&mut self, other: &RunSummary) {
        self.partitions += other.partitions;
        self.cancelled_partitions += other.cancelled_partitions;
        self.records_processed += other.records_processed;
        self.records_skipped += other.records_skipped;
        self.cardinality_errors += other.cardinality_errors;
        self.records_with_evaluation_errors += other.records_with_evaluation_errors;
        self.evaluation_errors += other.evaluation_errors;
    }

    /// `true` if any partition stopped before consuming all of its input.
    pub fn is_partial(&self) -> bool {
        self.cancelled_partitions > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {} records, skipped {} due to cardinality errors",
            self.records_processed, self.records_skipped
        )?;
        if self.records_with_evaluation_errors > 0 {
            write!(f, ", {} with evaluation errors", self.records_with_evaluation_errors)?;
        }
        if self.cancelled_partitions > 0 {
            write!(f, " ({} of {} partitions cancelled)", self.cancelled_partitions, self.partitions)?;
        }
        Ok(())
    }
}

/// The final (or partial) output of a run: one histogram per definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    /// Histograms in registration order.
    pub histograms: Vec<FilledHistogram>,
    /// Run bookkeeping.
    pub summary: RunSummary,
}

impl HistogramSet {
    /// Histogram by name.
    pub fn get(&self, name: &str) -> Option<&FilledHistogram> {
        self.histograms.iter().find(|h| h.name == name)
    }

    /// Number of histograms.
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    /// `true` if the set holds no histograms.
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    /// Add `other` into `self`, matching histograms by name.
    ///
    /// Both sets must contain the same histograms with identical shapes.
    pub fn merge(&mut self, other: &HistogramSet) -> Result<()> {
        if self.histograms.len() != other.histograms.len() {
            return Err(HistError::merge_shape(
                "*",
                format!(
                    "sets hold {} and {} histograms",
                    self.histograms.len(),
                    other.histograms.len()
                ),
            ));
        }
        let index: HashMap<&str, usize> =
            self.histograms.iter().enumerate().map(|(i, h)| (h.name.as_str(), i)).collect();
        let mut pairs = Vec::with_capacity(other.histograms.len());
        for h in &other.histograms {
            let i = index.get(h.name.as_str()).copied().ok_or_else(|| {
                HistError::merge_shape(&h.name, "histogram missing from the other partition")
            })?;
            pairs.push((i, h));
        }
        // Validate every pair before touching any bin so a failed merge leaves `self` intact.
        for &(i, h) in &pairs {
            let mine = &self.histograms[i];
            if mine.hash != h.hash || mine.edges != h.edges {
                return Err(HistError::merge_shape(&h.name, "definitions differ between partitions"));
            }
        }
        for (i, h) in pairs {
            self.histograms[i].merge(h)?;
        }
        self.summary.merge(&other.summary);
        Ok(())
    }

    /// Consuming form of [`merge`](Self::merge).
    pub fn merged(mut self, other: HistogramSet) -> Result<HistogramSet> {
        self.merge(&other)?;
        Ok(self)
    }

    /// Scale every histogram by `factor` (e.g. a cross-section weight).
    pub fn scale(&mut self, factor: f64) {
        for h in &mut self.histograms {
            h.scale(factor);
        }
    }
}

/// Merge any number of sets with a pairwise tree reduction.
///
/// Returns `None` for an empty input.
pub fn reduce(sets: impl IntoIterator<Item = HistogramSet>) -> Result<Option<HistogramSet>> {
    let mut level: Vec<HistogramSet> = sets.into_iter().collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.into_iter();
        while let Some(a) = it.next() {
            match it.next() {
                Some(b) => next.push(a.merged(b)?),
                None => next.push(a),
            }
        }
        level = next;
    }
    Ok(level.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{HistId, HistogramDef, RegisteredDef};

    fn set(fills: &[f64]) -> HistogramSet {
        let mut histograms = Vec::new();
        for name in ["a", "b"] {
            let def = HistogramDef::new(name).axis("x", &[0.0, 1.0, 2.0]);
            let hash = def.content_hash();
            let mut h = FilledHistogram::empty(&RegisteredDef { id: HistId(0), def, hash });
            for &x in fills {
                h.fill(&[x], 1.0);
            }
            histograms.push(h);
        }
        let summary =
            RunSummary { partitions: 1, records_processed: fills.len() as u64, ..Default::default() };
        HistogramSet { histograms, summary }
    }

    #[test]
    fn merge_is_order_independent() {
        let ab = set(&[0.5]).merged(set(&[1.5, 1.5])).unwrap();
        let ba = set(&[1.5, 1.5]).merged(set(&[0.5])).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.get("a").unwrap().content(), vec![1.0, 2.0]);
        assert_eq!(ab.summary.records_processed, 3);
        assert_eq!(ab.summary.partitions, 2);
    }

    #[test]
    fn merge_matches_by_name() {
        let mut a = set(&[0.5]);
        let mut b = set(&[1.5]);
        b.histograms.reverse();
        a.merge(&b).unwrap();
        assert_eq!(a.histograms[0].name, "a");
        assert_eq!(a.get("b").unwrap().content(), vec![1.0, 1.0]);
    }

    #[test]
    fn merge_rejects_missing_histogram() {
        let mut a = set(&[0.5]);
        let mut b = set(&[0.5]);
        b.histograms[1].name = "c".into();
        let err = a.merge(&b).unwrap_err();
        assert!(matches!(err, HistError::MergeShapeMismatch { .. }));
        assert_eq!(a.get("a").unwrap().entries(), 1);
    }

    #[test]
    fn tree_reduce() {
        let sets: Vec<_> = (0..5).map(|_| set(&[0.5])).collect();
        let total = reduce(sets).unwrap().unwrap();
        assert_eq!(total.get("a").unwrap().content(), vec![5.0, 0.0]);
        assert_eq!(total.summary.partitions, 5);
        assert!(reduce(Vec::new()).unwrap().is_none());
    }

    #[test]
    fn summary_display() {
        let s = RunSummary { records_processed: 10, records_skipped: 2, ..Default::default() };
        assert_eq!(s.to_string(), "processed 10 records, skipped 2 due to cardinality errors");
    }
}
