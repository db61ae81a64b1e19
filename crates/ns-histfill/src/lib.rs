//! # ns-histfill
//!
//! Expression-driven N-dimensional histogram filling for NextStat.
//!
//! Histograms are declared as axis expressions plus bin edges, with an
//! optional selection and weight, over a schema of scalar and jagged (one
//! value per collection element) event fields. Every distinct expression is
//! compiled once and evaluated once per record; jagged expressions that
//! appear together in a histogram are paired slot by slot, with length
//! disagreements detected and reported instead of silently truncated.
//! Partitions are filled in parallel and merged.
//!
//! ## Example
//!
//! ```no_run
//! use ns_histfill::{HistogramDef, Processor, ProcessorConfig, RecordBatch, Registry, Schema};
//!
//! let schema = Schema::new().scalar("mu").jagged("tau_pt");
//! let registry = Registry::from_defs(
//!     schema,
//!     [HistogramDef::new("tau_pt").axis("tau_pt", &[0.0, 20.0, 50.0, 100.0]).selection("mu < 60")],
//! )
//! .unwrap();
//!
//! let batch = RecordBatch::new(2)
//!     .with_scalar("mu", vec![30.0, 70.0])
//!     .unwrap()
//!     .with_jagged("tau_pt", vec![vec![25.0, 60.0], vec![10.0]])
//!     .unwrap();
//!
//! let out = Processor::new(registry, ProcessorConfig::new()).run_batches(vec![batch]).unwrap();
//! println!("{:?} ({})", out.get("tau_pt").unwrap().content(), out.summary);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accumulator;
pub mod config;
pub mod definition;
pub mod error;
pub mod expr;
pub mod histogram;
pub mod merge;
pub mod plan;
pub mod pool;
pub mod processor;
pub mod record;
pub mod schema;

pub use accumulator::Accumulator;
pub use config::RunConfig;
pub use definition::{Axis, HistId, HistogramDef, MAX_DIMENSIONS, RegisteredDef, Registry};
pub use error::{HistError, Result};
pub use expr::{CompiledExpr, Compiler, ExprCompiler, Expression};
pub use histogram::{BinStat, FilledHistogram, find_bin};
pub use merge::{HistogramSet, RunSummary, reduce};
pub use plan::{Readiness, SyncGroup, SyncPlan};
pub use pool::{ExprHandle, ExprPool};
pub use processor::{CancelToken, Processor, ProcessorConfig, resolve_threads};
pub use record::{Column, FieldValues, JaggedCol, Record, RecordBatch, Row};
pub use schema::{FieldKind, Schema};
