//! Interface to the formula-to-source generator.
//!
//! Vesta does not translate formulas into CUDA itself. Callers provide a
//! [`SourceGenerator`], which is only consulted on a cache miss.

use serde::{Deserialize, Serialize};

use crate::compile::TargetFormat;
use crate::error::Result;

/// A reduction formula as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Formula {
    /// Identity of the formula and its reduction arguments.
    pub id: String,

    /// Compile for half precision (adds the fp16 include path).
    pub reduced_precision: bool,
}

impl Formula {
    /// A full-precision formula.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reduced_precision: false,
        }
    }

    /// Switch to half precision.
    pub fn with_reduced_precision(mut self, reduced: bool) -> Self {
        self.reduced_precision = reduced;
        self
    }
}

/// Shape information recorded next to each compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormulaMetadata {
    /// Whether the reduction runs over the first variable index.
    pub is_indexed_by_first_variable: bool,

    /// Dimension of the reduction output.
    pub output_dimension: usize,
}

/// Kernel source produced for a formula.
#[derive(Debug, Clone)]
pub struct GeneratedKernel {
    pub source: String,
    pub metadata: FormulaMetadata,
}

/// Turns formulas into CUDA kernel source.
pub trait SourceGenerator {
    /// Generate the kernel source and its metadata.
    fn generate(
        &self,
        formula: &Formula,
        target: TargetFormat,
        device_id: u32,
    ) -> Result<GeneratedKernel>;
}
