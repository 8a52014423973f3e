//! Compile command implementation for Vesta CLI.
//!
//! Feeds a CUDA source file through the artifact cache, so that hand-written
//! kernels can be compiled and cached the same way generated ones are.

use std::fs;
use std::path::Path;
use std::time::Instant;

use vesta_core::{
    ArtifactOrigin, Formula, FormulaMetadata, GeneratedKernel, JitContext, Settings,
    SourceGenerator, TargetFormat,
};

use crate::colors;

/// Options of the compile command.
pub struct CompileOptions {
    pub device: u32,
    pub half: bool,
    pub indexed_by_first: bool,
    pub dim: usize,
    pub id: Option<String>,
}

/// Generator returning a fixed source text.
struct FileSource {
    source: String,
    metadata: FormulaMetadata,
}

impl SourceGenerator for FileSource {
    fn generate(
        &self,
        _formula: &Formula,
        _target: TargetFormat,
        _device_id: u32,
    ) -> vesta_core::Result<GeneratedKernel> {
        Ok(GeneratedKernel {
            source: self.source.clone(),
            metadata: self.metadata,
        })
    }
}

/// Compile `source_path` for one device and print the artifact path.
pub fn execute(settings: Settings, source_path: &Path, options: CompileOptions) -> anyhow::Result<()> {
    if !source_path.exists() {
        anyhow::bail!("Source file not found: {}", source_path.display());
    }
    let source = fs::read_to_string(source_path)?;

    let start = Instant::now();
    let ctx = JitContext::new(settings)?;

    let formula = Formula::new(options.id.unwrap_or_else(|| source.clone()))
        .with_reduced_precision(options.half);
    let generator = FileSource {
        source,
        metadata: FormulaMetadata {
            is_indexed_by_first_variable: options.indexed_by_first,
            output_dimension: options.dim,
        },
    };

    let artifact = ctx.get_or_compile(&formula, &generator, options.device)?;

    let (color, label) = match artifact.origin {
        ArtifactOrigin::Compiled => (colors::GREEN, "Compiled"),
        ArtifactOrigin::Disk => (colors::CYAN, "Cached"),
    };
    println!(
        "{}{}{} {} ({}, device {}) in {:.2}s",
        color,
        label,
        colors::RESET,
        artifact.fingerprint,
        artifact.target_format,
        artifact.device_id,
        start.elapsed().as_secs_f64()
    );
    println!("{}", artifact.binary_path.display());

    Ok(())
}
