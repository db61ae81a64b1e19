//! Histogram definitions and the registry that validates them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HistError, Result};
use crate::expr::{Compiler, ExprCompiler};
use crate::pool::ExprPool;
use crate::schema::Schema;

/// Maximum number of axes per histogram.
pub const MAX_DIMENSIONS: usize = 3;

/// One histogram axis: an expression and its bin edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Expression for the axis variable (e.g. `"TauJets.pt / 1000"`).
    pub expr: String,
    /// Bin edges (strictly increasing, length = n_bins + 1).
    pub edges: Vec<f64>,
}

impl Axis {
    /// Create an axis.
    pub fn new(expr: impl Into<String>, edges: &[f64]) -> Self {
        Self { expr: expr.into(), edges: edges.to_vec() }
    }

    /// Number of in-range bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }
}

/// Description of one output histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramDef {
    /// Histogram name, unique within a run.
    pub name: String,
    /// Axes in x, y, z order.
    pub axes: Vec<Axis>,
    /// Selection expression; a slot passes if it evaluates non-zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    /// Weight expression (defaults to 1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
}

impl HistogramDef {
    /// Create a definition with no axes yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), axes: Vec::new(), selection: None, weight: None }
    }

    /// Append an axis.
    pub fn axis(mut self, expr: impl Into<String>, edges: &[f64]) -> Self {
        self.axes.push(Axis::new(expr, edges));
        self
    }

    /// Set the selection expression.
    pub fn selection(mut self, expr: impl Into<String>) -> Self {
        self.selection = Some(expr.into());
        self
    }

    /// Set the weight expression.
    pub fn weight(mut self, expr: impl Into<String>) -> Self {
        self.weight = Some(expr.into());
        self
    }

    /// Number of axes.
    pub fn dimensionality(&self) -> usize {
        self.axes.len()
    }

    /// All expression texts referenced: axes, then selection, then weight.
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.axes
            .iter()
            .map(|a| a.expr.as_str())
            .chain(self.selection.as_deref())
            .chain(self.weight.as_deref())
    }

    /// Content hash over axis expressions, binning, selection and weight.
    ///
    /// Two definitions with the same hash fill identical histograms.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for i in 0..MAX_DIMENSIONS {
            match self.axes.get(i) {
                Some(axis) => {
                    hasher.update(axis.expr.trim().as_bytes());
                    hasher.update(format!("{:?}", axis.edges).as_bytes());
                }
                None => hasher.update(b"None"),
            }
            hasher.update(b"|");
        }
        for expr in [&self.selection, &self.weight] {
            match expr {
                Some(e) => hasher.update(e.trim().as_bytes()),
                None => hasher.update(b"None"),
            }
            hasher.update(b"|");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Treat blank selection/weight text as absent.
    fn normalized(mut self) -> Self {
        if self.selection.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.selection = None;
        }
        if self.weight.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.weight = None;
        }
        self
    }

    fn validate_shape(&self) -> Result<()> {
        let fail = |reason: String| Err(HistError::invalid_definition(&self.name, reason));
        if self.name.trim().is_empty() {
            return fail("name must not be empty".into());
        }
        if self.axes.is_empty() || self.axes.len() > MAX_DIMENSIONS {
            return fail(format!(
                "dimensionality must be 1..={MAX_DIMENSIONS}, got {} axis expression(s)",
                self.axes.len()
            ));
        }
        for (i, axis) in self.axes.iter().enumerate() {
            if axis.expr.trim().is_empty() {
                return fail(format!("axis {i} has an empty expression"));
            }
            if axis.edges.len() < 2 {
                return fail(format!("axis {i} needs at least 2 bin edges, got {}", axis.edges.len()));
            }
            if let Some(bad) = axis.edges.iter().find(|e| !e.is_finite()) {
                return fail(format!("axis {i} has a non-finite bin edge {bad}"));
            }
            if let Some(w) = axis.edges.windows(2).find(|w| w[1] <= w[0]) {
                return fail(format!(
                    "axis {i} bin edges must be strictly increasing ({} then {})",
                    w[0], w[1]
                ));
            }
        }
        Ok(())
    }
}

/// Index of a registered histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistId(pub(crate) usize);

impl HistId {
    /// Registration order of this histogram.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A definition accepted by the [`Registry`].
#[derive(Debug, Clone)]
pub struct RegisteredDef {
    /// Registry index.
    pub id: HistId,
    /// The normalized definition.
    pub def: HistogramDef,
    /// [`HistogramDef::content_hash`] of `def`.
    pub hash: String,
}

/// Validated, immutable-once-built set of histogram definitions.
///
/// Every expression is compiled against the schema at registration, so a run
/// only starts from a fully valid configuration. The registry is shared
/// read-only by all workers.
#[derive(Debug)]
pub struct Registry {
    compiler: Arc<dyn Compiler>,
    schema: Arc<Schema>,
    validator: ExprPool,
    defs: Vec<RegisteredDef>,
    by_name: HashMap<String, HistId>,
    duplicates: usize,
}

impl Registry {
    /// Empty registry using the built-in expression compiler.
    pub fn new(schema: Schema) -> Self {
        Self::with_compiler(schema, Arc::new(ExprCompiler))
    }

    /// Empty registry using a custom compiler.
    pub fn with_compiler(schema: Schema, compiler: Arc<dyn Compiler>) -> Self {
        let schema = Arc::new(schema);
        let validator = ExprPool::new(Arc::clone(&compiler), Arc::clone(&schema));
        Self { compiler, schema, validator, defs: Vec::new(), by_name: HashMap::new(), duplicates: 0 }
    }

    /// Build a registry from `defs`, failing on the first invalid one.
    pub fn from_defs(schema: Schema, defs: impl IntoIterator<Item = HistogramDef>) -> Result<Self> {
        let mut reg = Self::new(schema);
        for def in defs {
            reg.register(def)?;
        }
        Ok(reg)
    }

    /// Validate and add a definition.
    ///
    /// Re-registering an identical definition returns the existing id.
    pub fn register(&mut self, def: HistogramDef) -> Result<HistId> {
        let def = def.normalized();
        def.validate_shape()?;
        let hash = def.content_hash();

        if let Some(&id) = self.by_name.get(&def.name) {
            if self.defs[id.0].hash == hash {
                self.duplicates += 1;
                log::debug!("histogram '{}' registered twice; reusing", def.name);
                return Ok(id);
            }
            return Err(HistError::invalid_definition(
                &def.name,
                "name already registered with a different definition",
            ));
        }

        for text in def.expressions() {
            if let Err(e) = self.validator.intern(text) {
                log::warn!("rejecting histogram '{}': {}", def.name, e);
                return Err(e);
            }
        }

        let id = HistId(self.defs.len());
        self.by_name.insert(def.name.clone(), id);
        self.defs.push(RegisteredDef { id, def, hash });
        Ok(id)
    }

    /// Registered definitions in registration order.
    pub fn definitions(&self) -> &[RegisteredDef] {
        &self.defs
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredDef> {
        self.by_name.get(name).map(|id| &self.defs[id.0])
    }

    /// Number of registered histograms.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Number of identical re-registrations that were folded.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Number of distinct expressions across all definitions.
    pub fn n_expressions(&self) -> usize {
        self.validator.len()
    }

    /// Declared schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Fresh, empty expression pool for one unit of work.
    pub fn new_pool(&self) -> ExprPool {
        ExprPool::new(Arc::clone(&self.compiler), Arc::clone(&self.schema))
    }
}
