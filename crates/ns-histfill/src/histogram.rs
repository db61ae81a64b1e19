//! Binned N-dimensional histogram with variance tracking.

use serde::{Deserialize, Serialize};

use crate::definition::RegisteredDef;
use crate::error::{HistError, Result};

/// Counters of one bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BinStat {
    /// Sum of weights.
    pub sumw: f64,
    /// Sum of squared weights.
    pub sumw2: f64,
    /// Number of fills.
    pub entries: u64,
}

impl BinStat {
    #[inline]
    fn fill(&mut self, weight: f64) {
        self.sumw += weight;
        self.sumw2 += weight * weight;
        self.entries += 1;
    }

    fn add(&mut self, other: &BinStat) {
        self.sumw += other.sumw;
        self.sumw2 += other.sumw2;
        self.entries += other.entries;
    }
}

/// Index of `val` along an axis with `edges`, counting flow bins.
///
/// `0` is underflow, `1..=n` are the half-open bins `[edges[i-1], edges[i])`,
/// `n + 1` is overflow (values at or above the last edge, and NaN).
pub fn find_bin(edges: &[f64], val: f64) -> usize {
    let n = edges.len() - 1;
    if val.is_nan() || val >= edges[n] {
        return n + 1;
    }
    if val < edges[0] {
        return 0;
    }
    edges.partition_point(|e| *e <= val)
}

/// A filled histogram, including under- and overflow bins on every axis.
///
/// Bins are stored flat with the x index varying fastest:
/// `global = ix + (nx + 2) * (iy + (ny + 2) * iz)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledHistogram {
    /// Histogram name.
    pub name: String,
    /// Content hash of the definition that produced it.
    pub hash: String,
    /// Axis expressions, x first.
    pub axis_exprs: Vec<String>,
    /// Bin edges per axis.
    pub edges: Vec<Vec<f64>>,
    /// All bins, flow bins included.
    pub bins: Vec<BinStat>,
    /// Records whose contribution was dropped (cardinality or evaluation errors).
    #[serde(default)]
    pub skipped_records: u64,
}

impl FilledHistogram {
    /// Empty histogram shaped after a registered definition.
    pub fn empty(reg: &RegisteredDef) -> Self {
        let edges: Vec<Vec<f64>> = reg.def.axes.iter().map(|a| a.edges.clone()).collect();
        let n_cells = edges.iter().map(|e| e.len() + 1).product();
        Self {
            name: reg.def.name.clone(),
            hash: reg.hash.clone(),
            axis_exprs: reg.def.axes.iter().map(|a| a.expr.clone()).collect(),
            edges,
            bins: vec![BinStat::default(); n_cells],
            skipped_records: 0,
        }
    }

    /// Number of axes.
    pub fn dimensionality(&self) -> usize {
        self.edges.len()
    }

    /// Number of in-range bins along `axis`.
    pub fn n_bins(&self, axis: usize) -> usize {
        self.edges[axis].len() - 1
    }

    /// Flat index of per-axis bin indices (flow-inclusive, see [`find_bin`]).
    pub fn global_bin(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.dimensionality());
        let mut global = 0;
        let mut stride = 1;
        for (i, e) in idx.iter().zip(&self.edges) {
            global += i * stride;
            stride *= e.len() + 1;
        }
        global
    }

    /// Bin at per-axis indices (flow-inclusive).
    pub fn bin(&self, idx: &[usize]) -> &BinStat {
        &self.bins[self.global_bin(idx)]
    }

    /// Fill one entry at `coords` (one value per axis).
    #[inline]
    pub fn fill(&mut self, coords: &[f64], weight: f64) {
        let mut global = 0;
        let mut stride = 1;
        for (v, e) in coords.iter().zip(&self.edges) {
            global += find_bin(e, *v) * stride;
            stride *= e.len() + 1;
        }
        self.bins[global].fill(weight);
    }

    /// Bin-wise add `other` into `self`.
    ///
    /// Both histograms must come from the same definition (name, hash and binning).
    pub fn merge(&mut self, other: &FilledHistogram) -> Result<()> {
        if self.name != other.name {
            return Err(HistError::merge_shape(
                &self.name,
                format!("name differs from '{}'", other.name),
            ));
        }
        if self.hash != other.hash {
            return Err(HistError::merge_shape(&self.name, "definition hash differs"));
        }
        if self.dimensionality() != other.dimensionality() {
            return Err(HistError::merge_shape(
                &self.name,
                format!("dimensionality {} vs {}", self.dimensionality(), other.dimensionality()),
            ));
        }
        if self.edges != other.edges || self.bins.len() != other.bins.len() {
            return Err(HistError::merge_shape(&self.name, "bin edges differ"));
        }
        for (a, b) in self.bins.iter_mut().zip(&other.bins) {
            a.add(b);
        }
        self.skipped_records += other.skipped_records;
        Ok(())
    }

    /// Multiply weights by `factor` (sum of weights squared by `factor²`).
    pub fn scale(&mut self, factor: f64) {
        let f2 = factor * factor;
        for b in &mut self.bins {
            b.sumw *= factor;
            b.sumw2 *= f2;
        }
    }

    /// Total number of fills, flow bins included.
    pub fn entries(&self) -> u64 {
        self.bins.iter().map(|b| b.entries).sum()
    }

    /// Total sum of weights, flow bins included.
    pub fn sum_of_weights(&self) -> f64 {
        self.bins.iter().map(|b| b.sumw).sum()
    }

    fn in_range(&self) -> impl Iterator<Item = &BinStat> + '_ {
        self.bins.iter().enumerate().filter_map(move |(global, b)| {
            let mut rest = global;
            for e in &self.edges {
                let i = rest % (e.len() + 1);
                if i == 0 || i == e.len() {
                    return None;
                }
                rest /= e.len() + 1;
            }
            Some(b)
        })
    }

    /// Sum of weights of in-range bins, in flat order.
    pub fn content(&self) -> Vec<f64> {
        self.in_range().map(|b| b.sumw).collect()
    }

    /// Sum of squared weights of in-range bins, in flat order.
    pub fn sumw2(&self) -> Vec<f64> {
        self.in_range().map(|b| b.sumw2).collect()
    }

    /// Entry counts of in-range bins, in flat order.
    pub fn entry_counts(&self) -> Vec<u64> {
        self.in_range().map(|b| b.entries).collect()
    }

    /// Underflow bin of a 1D histogram.
    pub fn underflow(&self) -> Option<&BinStat> {
        (self.dimensionality() == 1).then(|| &self.bins[0])
    }

    /// Overflow bin of a 1D histogram.
    pub fn overflow(&self) -> Option<&BinStat> {
        (self.dimensionality() == 1).then(|| &self.bins[self.bins.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{HistId, HistogramDef};

    fn h1(edges: &[f64]) -> FilledHistogram {
        let def = HistogramDef::new("h").axis("x", edges);
        let hash = def.content_hash();
        FilledHistogram::empty(&RegisteredDef { id: HistId(0), def, hash })
    }

    #[test]
    fn find_bin_edge_cases() {
        let edges = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(find_bin(&edges, -0.5), 0);
        assert_eq!(find_bin(&edges, 0.0), 1);
        assert_eq!(find_bin(&edges, 1.0), 2);
        assert_eq!(find_bin(&edges, 2.99), 3);
        assert_eq!(find_bin(&edges, 3.0), 4);
        assert_eq!(find_bin(&edges, 1e9), 4);
        assert_eq!(find_bin(&edges, f64::NAN), 4);
    }

    #[test]
    fn variable_width_fill() {
        let mut h = h1(&[0.0, 1.0, 10.0]);
        h.fill(&[0.5], 2.0);
        h.fill(&[5.0], 3.0);
        h.fill(&[5.0], 1.0);
        h.fill(&[-1.0], 1.0);
        h.fill(&[10.0], 1.0);
        assert_eq!(h.content(), vec![2.0, 4.0]);
        assert_eq!(h.sumw2(), vec![4.0, 10.0]);
        assert_eq!(h.entry_counts(), vec![1, 2]);
        assert_eq!(h.underflow().unwrap().entries, 1);
        assert_eq!(h.overflow().unwrap().sumw, 1.0);
        assert_eq!(h.entries(), 5);
    }

    #[test]
    fn two_dimensional_layout() {
        let def = HistogramDef::new("h2").axis("x", &[0.0, 1.0, 2.0]).axis("y", &[0.0, 1.0]);
        let hash = def.content_hash();
        let mut h = FilledHistogram::empty(&RegisteredDef { id: HistId(0), def, hash });
        assert_eq!(h.bins.len(), 4 * 3);
        h.fill(&[1.5, 0.5], 1.0);
        h.fill(&[1.5, 7.0], 1.0);
        assert_eq!(h.bin(&[2, 1]).entries, 1);
        assert_eq!(h.bin(&[2, 2]).entries, 1);
        assert_eq!(h.content(), vec![0.0, 1.0]);
        assert!(h.underflow().is_none());
    }

    #[test]
    fn merge_and_scale() {
        let mut a = h1(&[0.0, 1.0]);
        let mut b = h1(&[0.0, 1.0]);
        a.fill(&[0.5], 2.0);
        b.fill(&[0.5], 3.0);
        a.merge(&b).unwrap();
        assert_eq!(a.content(), vec![5.0]);
        assert_eq!(a.sumw2(), vec![13.0]);
        a.scale(2.0);
        assert_eq!(a.content(), vec![10.0]);
        assert_eq!(a.sumw2(), vec![52.0]);
        assert_eq!(a.entries(), 2);
    }

    #[test]
    fn merge_rejects_other_binning() {
        let mut a = h1(&[0.0, 1.0]);
        let b = h1(&[0.0, 2.0]);
        let err = a.merge(&b).unwrap_err();
        assert!(matches!(err, HistError::MergeShapeMismatch { .. }));
    }
}
