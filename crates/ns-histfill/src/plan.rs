//! Synchronization of slot counts across expressions.
//!
//! Expressions that appear together in one histogram must yield the same
//! number of slots per record so that slot `i` of every axis, the selection
//! and the weight refer to the same collection element. Jagged expressions
//! are grouped by union-find over the registered definitions; scalar
//! expressions broadcast to any slot count.
//!
//! Per record, one representative of each group fixes the slot count `N` and
//! every other member is checked against it. A disagreement invalidates that
//! group (and only that group) for the record.

use std::collections::HashMap;

use crate::definition::Registry;
use crate::error::{HistError, Result};
use crate::pool::{ExprHandle, ExprPool};
use crate::record::Record;

/// Expression handles used by one histogram.
#[derive(Debug, Clone)]
pub struct HistSlots {
    /// Axis expressions, x first.
    pub axes: Vec<ExprHandle>,
    /// Selection expression.
    pub selection: Option<ExprHandle>,
    /// Weight expression.
    pub weight: Option<ExprHandle>,
    /// Sync group of the jagged expressions, `None` if all are scalar.
    pub group: Option<usize>,
}

impl HistSlots {
    fn handles(&self) -> impl Iterator<Item = ExprHandle> + '_ {
        self.axes.iter().copied().chain(self.selection).chain(self.weight)
    }
}

/// A set of jagged expressions that must agree on slot count per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroup {
    /// Members in handle order; the first is the representative.
    pub members: Vec<ExprHandle>,
}

impl SyncGroup {
    /// Expression evaluated first to discover the group's slot count.
    pub fn representative(&self) -> ExprHandle {
        self.members[0]
    }
}

struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), size: vec![1; n] }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

/// Per-record evaluation plan for all registered histograms.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    hists: Vec<HistSlots>,
    groups: Vec<SyncGroup>,
    scalars: Vec<ExprHandle>,
    broadcast: Vec<bool>,
}

impl SyncPlan {
    /// Intern every expression of `registry` into `pool` and group them.
    pub fn build(registry: &Registry, pool: &mut ExprPool) -> Result<Self> {
        let mut hists = Vec::with_capacity(registry.len());
        for reg in registry.definitions() {
            let def = &reg.def;
            let axes = def.axes.iter().map(|a| pool.intern(&a.expr)).collect::<Result<Vec<_>>>()?;
            let selection = def.selection.as_deref().map(|s| pool.intern(s)).transpose()?;
            let weight = def.weight.as_deref().map(|s| pool.intern(s)).transpose()?;
            hists.push(HistSlots { axes, selection, weight, group: None });
        }

        let handles: Vec<ExprHandle> = pool.handles().collect();
        let n = handles.len();
        let broadcast: Vec<bool> = handles.iter().map(|&h| pool.is_scalar(h)).collect();

        let mut uf = UnionFind::new(n);
        for h in &hists {
            let mut jagged = h.handles().filter(|e| !broadcast[e.index()]);
            if let Some(first) = jagged.next() {
                for other in jagged {
                    uf.union(first.index(), other.index());
                }
            }
        }

        // Dense group ids in order of each group's lowest handle.
        let mut root_to_group: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<SyncGroup> = Vec::new();
        let mut scalars = Vec::new();
        for (i, &handle) in handles.iter().enumerate() {
            if broadcast[i] {
                scalars.push(handle);
                continue;
            }
            let root = uf.find(i);
            let g = *root_to_group.entry(root).or_insert_with(|| {
                groups.push(SyncGroup { members: Vec::new() });
                groups.len() - 1
            });
            groups[g].members.push(handle);
        }

        for h in &mut hists {
            let first = h.handles().find(|e| !broadcast[e.index()]);
            h.group = first.map(|e| root_to_group[&uf.find(e.index())]);
        }

        for (g, group) in groups.iter().enumerate() {
            log::debug!(
                "sync group {}: {}",
                g,
                group.members.iter().map(|m| pool.text(*m)).collect::<Vec<_>>().join(", ")
            );
        }

        Ok(Self { hists, groups, scalars, broadcast })
    }

    /// Handles used by each histogram, in registry order.
    pub fn hists(&self) -> &[HistSlots] {
        &self.hists
    }

    /// All sync groups.
    pub fn groups(&self) -> &[SyncGroup] {
        &self.groups
    }

    /// Scalar (broadcast) expressions.
    pub fn scalars(&self) -> &[ExprHandle] {
        &self.scalars
    }

    /// Fresh per-record scratch space sized for this plan.
    pub fn new_event_values(&self) -> EventValues {
        EventValues {
            values: vec![Vec::new(); self.broadcast.len()],
            scalar_ok: vec![false; self.broadcast.len()],
            groups: vec![GroupState::Failed; self.groups.len()],
            broadcast: self.broadcast.clone(),
            errors: Vec::new(),
        }
    }

    /// Evaluate every expression once for `record`.
    pub fn evaluate(&self, pool: &ExprPool, record: &dyn Record, ev: &mut EventValues) {
        ev.errors.clear();

        for &h in &self.scalars {
            let i = h.index();
            match pool.evaluate_into(h, record, &mut ev.values[i]) {
                Ok(()) => ev.scalar_ok[i] = true,
                Err(e) => {
                    ev.scalar_ok[i] = false;
                    ev.errors.push(e);
                }
            }
        }

        for (g, group) in self.groups.iter().enumerate() {
            ev.groups[g] = match eval_group(pool, group, record, &mut ev.values) {
                Ok(n) => GroupState::Ready(n),
                Err(e) => {
                    let state = match e {
                        HistError::CardinalityMismatch { .. } => GroupState::Mismatch,
                        _ => GroupState::Failed,
                    };
                    ev.errors.push(e);
                    state
                }
            };
        }
    }

    /// Whether histogram `index` can be filled from `ev`, and with how many slots.
    pub fn readiness(&self, index: usize, ev: &EventValues) -> Readiness {
        let slots = &self.hists[index];
        if let Some(g) = slots.group {
            match ev.groups[g] {
                GroupState::Ready(_) => {}
                GroupState::Mismatch => return Readiness::CardinalityMismatch,
                GroupState::Failed => return Readiness::EvaluationFailed,
            }
        }
        if slots.handles().any(|h| ev.broadcast[h.index()] && !ev.scalar_ok[h.index()]) {
            return Readiness::EvaluationFailed;
        }
        match slots.group.map(|g| ev.groups[g]) {
            Some(GroupState::Ready(n)) => Readiness::Ready(n),
            _ => Readiness::Ready(1),
        }
    }
}

fn eval_group(
    pool: &ExprPool,
    group: &SyncGroup,
    record: &dyn Record,
    values: &mut [Vec<f64>],
) -> Result<usize> {
    let rep = group.representative();
    pool.evaluate_into(rep, record, &mut values[rep.index()])?;
    let n = values[rep.index()].len();
    for &member in &group.members[1..] {
        let out = &mut values[member.index()];
        pool.evaluate_into(member, record, out)?;
        if out.len() != n {
            return Err(HistError::CardinalityMismatch {
                expr: pool.text(member).to_string(),
                expected: n,
                found: out.len(),
            });
        }
    }
    Ok(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Ready(usize),
    Mismatch,
    Failed,
}

/// Outcome of planning one histogram for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Fill `N` slots.
    Ready(usize),
    /// Jagged members of the histogram's group disagree on length.
    CardinalityMismatch,
    /// An expression could not be evaluated.
    EvaluationFailed,
}

/// Values of every expression for the current record.
#[derive(Debug)]
pub struct EventValues {
    values: Vec<Vec<f64>>,
    scalar_ok: Vec<bool>,
    groups: Vec<GroupState>,
    broadcast: Vec<bool>,
    errors: Vec<HistError>,
}

impl EventValues {
    /// Value of `handle` at `slot`; scalar expressions broadcast.
    #[inline]
    pub fn value(&self, handle: ExprHandle, slot: usize) -> f64 {
        let v = &self.values[handle.index()];
        if self.broadcast[handle.index()] { v[0] } else { v[slot] }
    }

    /// Errors raised while evaluating the current record.
    pub fn errors(&self) -> &[HistError] {
        &self.errors
    }
}
