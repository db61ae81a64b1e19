//! Deduplicated pool of compiled expressions, keyed by source text.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{HistError, Result};
use crate::expr::{Compiler, Expression};
use crate::record::{FieldValues, Record};
use crate::schema::Schema;

/// Stable reference to an expression interned in an [`ExprPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprHandle(usize);

impl ExprHandle {
    /// Dense index of this handle within its pool.
    pub fn index(self) -> usize {
        self.0
    }
}

struct PoolEntry {
    text: String,
    expr: Box<dyn Expression>,
    scalar: bool,
}

/// Owns every compiled expression of one unit of work.
///
/// Interning the same text twice returns the same handle and compiles once.
/// Pools are not shared between workers; each partition builds its own.
pub struct ExprPool {
    compiler: Arc<dyn Compiler>,
    schema: Arc<Schema>,
    by_text: HashMap<String, ExprHandle>,
    failed: HashMap<String, String>,
    entries: Vec<PoolEntry>,
    compile_count: usize,
}

impl std::fmt::Debug for ExprPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprPool")
            .field("expressions", &self.entries.iter().map(|e| &e.text).collect::<Vec<_>>())
            .field("compile_count", &self.compile_count)
            .finish()
    }
}

impl ExprPool {
    /// Create an empty pool compiling against `schema`.
    pub fn new(compiler: Arc<dyn Compiler>, schema: Arc<Schema>) -> Self {
        Self {
            compiler,
            schema,
            by_text: HashMap::new(),
            failed: HashMap::new(),
            entries: Vec::new(),
            compile_count: 0,
        }
    }

    /// Intern `text`, compiling it on first sight.
    ///
    /// Surrounding whitespace is ignored. A text that failed to compile keeps
    /// failing with the same error without being recompiled.
    pub fn intern(&mut self, text: &str) -> Result<ExprHandle> {
        let key = text.trim();
        if let Some(&h) = self.by_text.get(key) {
            return Ok(h);
        }
        if let Some(reason) = self.failed.get(key) {
            return Err(HistError::compile(key, reason.clone()));
        }

        self.compile_count += 1;
        let expr = match self.compiler.compile(key, &self.schema) {
            Ok(expr) => expr,
            Err(e) => {
                let reason = match &e {
                    HistError::CompileError { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                self.failed.insert(key.to_string(), reason.clone());
                return Err(HistError::compile(key, reason));
            }
        };
        let scalar = expr.fields().iter().all(|f| !self.schema.is_jagged(f));
        let handle = ExprHandle(self.entries.len());
        log::debug!("compiled expression #{} '{}' (scalar={})", handle.0, key, scalar);
        self.entries.push(PoolEntry { text: key.to_string(), expr, scalar });
        self.by_text.insert(key.to_string(), handle);
        Ok(handle)
    }

    /// Handle for already-interned `text`, if any.
    pub fn get(&self, text: &str) -> Option<ExprHandle> {
        self.by_text.get(text.trim()).copied()
    }

    /// Source text of `handle`.
    pub fn text(&self, handle: ExprHandle) -> &str {
        &self.entries[handle.0].text
    }

    /// Compiled expression behind `handle`.
    pub fn expression(&self, handle: ExprHandle) -> &dyn Expression {
        self.entries[handle.0].expr.as_ref()
    }

    /// `true` if `handle` references no jagged field, i.e. always yields one slot.
    pub fn is_scalar(&self, handle: ExprHandle) -> bool {
        self.entries[handle.0].scalar
    }

    /// All handles in interning order.
    pub fn handles(&self) -> impl Iterator<Item = ExprHandle> + use<> {
        (0..self.entries.len()).map(ExprHandle)
    }

    /// Number of distinct expressions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of compiler invocations so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    /// Schema expressions are resolved against.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Evaluate `handle` for `record`, one value per slot.
    pub fn evaluate(&self, handle: ExprHandle, record: &dyn Record) -> Result<Vec<f64>> {
        let mut out = Vec::new();
        self.evaluate_into(handle, record, &mut out)?;
        Ok(out)
    }

    /// Like [`evaluate`](Self::evaluate), reusing `out`'s allocation.
    ///
    /// Scalar fields broadcast across slots; all jagged fields referenced by the
    /// expression must have the same length in `record`.
    pub fn evaluate_into(
        &self,
        handle: ExprHandle,
        record: &dyn Record,
        out: &mut Vec<f64>,
    ) -> Result<()> {
        let entry = &self.entries[handle.0];
        let fields = entry.expr.fields();

        let mut inputs: Vec<FieldValues<'_>> = Vec::with_capacity(fields.len());
        let mut n_slots: Option<usize> = None;
        for name in fields {
            let values = record.field(name).ok_or_else(|| HistError::Evaluation {
                expr: entry.text.clone(),
                reason: format!("field '{name}' missing from record"),
            })?;
            // Broadcast expressions must yield exactly one value.
            if entry.scalar && !values.is_scalar() {
                return Err(HistError::Evaluation {
                    expr: entry.text.clone(),
                    reason: format!(
                        "field '{name}' is not jagged but the record holds {} values",
                        values.len()
                    ),
                });
            }
            if let FieldValues::Jagged(v) = values {
                match n_slots {
                    None => n_slots = Some(v.len()),
                    Some(n) if n != v.len() => {
                        return Err(HistError::CardinalityMismatch {
                            expr: entry.text.clone(),
                            expected: n,
                            found: v.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
            inputs.push(values);
        }

        out.clear();
        let n_slots = n_slots.unwrap_or(1);
        let mut row = vec![0.0f64; inputs.len()];
        for slot in 0..n_slots {
            for (j, values) in inputs.iter().enumerate() {
                row[j] = values.get(slot);
            }
            out.push(entry.expr.eval_row(&row));
        }
        Ok(())
    }
}
