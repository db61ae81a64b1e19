//! Record access and an in-memory columnar batch.
//!
//! The engine only needs field lookup by name; [`RecordBatch`] is the columnar
//! implementation used by the processor and tests. Jagged columns are stored
//! flat with per-record offsets.

use std::collections::HashMap;

use crate::error::{HistError, Result};
use crate::schema::{FieldKind, Schema};

/// Values of one field for one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValues<'a> {
    /// Single value.
    Scalar(f64),
    /// Zero or more values.
    Jagged(&'a [f64]),
}

impl FieldValues<'_> {
    /// Number of values (1 for scalars).
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Scalar(_) => 1,
            FieldValues::Jagged(v) => v.len(),
        }
    }

    /// `true` for an empty jagged field.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` for the scalar variant.
    pub fn is_scalar(&self) -> bool {
        matches!(self, FieldValues::Scalar(_))
    }

    /// Value at `slot`; scalars broadcast to every slot.
    #[inline]
    pub fn get(&self, slot: usize) -> f64 {
        match self {
            FieldValues::Scalar(v) => *v,
            FieldValues::Jagged(v) => v[slot],
        }
    }
}

/// One unit of input (one event).
pub trait Record {
    /// Values of field `name` for this record, or `None` if the record lacks it.
    fn field(&self, name: &str) -> Option<FieldValues<'_>>;
}

/// A jagged column: flat values plus per-record boundaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JaggedCol {
    /// Flat array of all values across all records.
    pub flat: Vec<f64>,
    /// Record boundaries: `offsets.len() == n_records + 1`.
    pub offsets: Vec<usize>,
}

impl JaggedCol {
    /// Build from one `Vec` per record.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        offsets.push(0);
        let mut flat = Vec::with_capacity(rows.iter().map(Vec::len).sum());
        for row in rows {
            flat.extend(row);
            offsets.push(flat.len());
        }
        Self { flat, offsets }
    }

    /// Values of record `row`.
    #[inline]
    pub fn row(&self, row: usize) -> &[f64] {
        &self.flat[self.offsets[row]..self.offsets[row + 1]]
    }

    /// Number of records.
    pub fn n_entries(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.offsets.first() != Some(&0) {
            return Err("offsets must start at 0".into());
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err("offsets must be non-decreasing".into());
        }
        if self.offsets.last() != Some(&self.flat.len()) {
            return Err(format!(
                "last offset {:?} does not match flat length {}",
                self.offsets.last(),
                self.flat.len()
            ));
        }
        Ok(())
    }
}

/// Storage for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// One value per record.
    Scalar(Vec<f64>),
    /// Variable number of values per record.
    Jagged(JaggedCol),
}

impl Column {
    /// Kind of this column.
    pub fn kind(&self) -> FieldKind {
        match self {
            Column::Scalar(_) => FieldKind::Scalar,
            Column::Jagged(_) => FieldKind::Jagged,
        }
    }

    fn n_entries(&self) -> usize {
        match self {
            Column::Scalar(v) => v.len(),
            Column::Jagged(j) => j.n_entries(),
        }
    }
}

/// A batch of records stored column-wise.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    n_records: usize,
    columns: HashMap<String, Column>,
}

impl RecordBatch {
    /// Empty batch of `n_records` records with no columns.
    pub fn new(n_records: usize) -> Self {
        Self { n_records, columns: HashMap::new() }
    }

    /// Add a scalar column.
    pub fn with_scalar(self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.with_column(name, Column::Scalar(values))
    }

    /// Add a jagged column from one `Vec` per record.
    pub fn with_jagged(self, name: impl Into<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        self.with_column(name, Column::Jagged(JaggedCol::from_rows(rows)))
    }

    /// Add a jagged column from flat values and offsets.
    pub fn with_jagged_flat(
        self,
        name: impl Into<String>,
        flat: Vec<f64>,
        offsets: Vec<usize>,
    ) -> Result<Self> {
        self.with_column(name, Column::Jagged(JaggedCol { flat, offsets }))
    }

    /// Add a column, checking that it covers exactly `len()` records.
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self> {
        let name = name.into();
        if let Column::Jagged(j) = &column {
            j.validate().map_err(|e| HistError::InvalidBatch(format!("column '{name}': {e}")))?;
        }
        if column.n_entries() != self.n_records {
            return Err(HistError::InvalidBatch(format!(
                "column '{name}' has {} records, batch has {}",
                column.n_entries(),
                self.n_records
            )));
        }
        self.columns.insert(name, column);
        Ok(self)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.n_records
    }

    /// `true` if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.n_records == 0
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Check that every column declared in `schema` has the declared kind.
    ///
    /// Columns absent from the batch are allowed; expressions needing them fail per record.
    pub fn check_schema(&self, schema: &Schema) -> Result<()> {
        for (name, col) in &self.columns {
            if let Some(kind) = schema.kind(name)
                && kind != col.kind()
            {
                return Err(HistError::InvalidBatch(format!(
                    "column '{name}' is {:?} but the schema declares {:?}",
                    col.kind(),
                    kind
                )));
            }
        }
        Ok(())
    }

    /// View of record `index`.
    ///
    /// # Panics
    /// If `index >= len()`.
    pub fn row(&self, index: usize) -> Row<'_> {
        assert!(index < self.n_records, "row {index} out of range ({})", self.n_records);
        Row { batch: self, index }
    }

    /// Iterate over all records in order.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.n_records).map(move |index| Row { batch: self, index })
    }

    /// Split into consecutive batches of records `[0, at)` and `[at, len)`.
    pub fn split_at(&self, at: usize) -> (RecordBatch, RecordBatch) {
        let at = at.min(self.n_records);
        (self.slice(0, at), self.slice(at, self.n_records))
    }

    /// Copy of records `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> RecordBatch {
        let end = end.min(self.n_records);
        let start = start.min(end);
        let columns = self
            .columns
            .iter()
            .map(|(name, col)| {
                let col = match col {
                    Column::Scalar(v) => Column::Scalar(v[start..end].to_vec()),
                    Column::Jagged(j) => {
                        let base = j.offsets[start];
                        Column::Jagged(JaggedCol {
                            flat: j.flat[base..j.offsets[end]].to_vec(),
                            offsets: j.offsets[start..=end].iter().map(|o| o - base).collect(),
                        })
                    }
                };
                (name.clone(), col)
            })
            .collect();
        RecordBatch { n_records: end - start, columns }
    }
}

/// Borrowed view of one record within a [`RecordBatch`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    batch: &'a RecordBatch,
    index: usize,
}

impl Row<'_> {
    /// Position of this record within its batch.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Record for Row<'_> {
    fn field(&self, name: &str) -> Option<FieldValues<'_>> {
        match self.batch.columns.get(name)? {
            Column::Scalar(v) => Some(FieldValues::Scalar(v[self.index])),
            Column::Jagged(j) => Some(FieldValues::Jagged(j.row(self.index))),
        }
    }
}

impl<'v> Record for HashMap<String, FieldValues<'v>> {
    fn field(&self, name: &str) -> Option<FieldValues<'_>> {
        self.get(name).copied()
    }
}
