//! JSON run configuration: schema, histogram definitions and processor options.
//!
//! ```json
//! {
//!   "schema": { "mu": "scalar", "TauJets.pt": "jagged" },
//!   "histograms": [
//!     { "name": "tau_pt", "axes": [{ "expr": "TauJets.pt", "edges": [0, 20, 50, 100] }],
//!       "selection": "mu < 60" }
//!   ],
//!   "processor": { "threads": -1 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::definition::{HistogramDef, Registry};
use crate::error::Result;
use crate::processor::{Processor, ProcessorConfig};
use crate::schema::Schema;

/// Everything needed to start a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Declared input fields.
    pub schema: Schema,
    /// Histograms to fill.
    pub histograms: Vec<HistogramDef>,
    /// Worker options.
    #[serde(default)]
    pub processor: ProcessorConfig,
}

impl RunConfig {
    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("loaded run config from {}", path.as_ref().display());
        Self::from_json(&text)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate and register every histogram.
    pub fn registry(&self) -> Result<Registry> {
        Registry::from_defs(self.schema.clone(), self.histograms.iter().cloned())
    }

    /// Registry plus processor configured from this run.
    pub fn into_processor(self) -> Result<Processor> {
        let registry = self.registry()?;
        Ok(Processor::new(registry, self.processor))
    }
}
