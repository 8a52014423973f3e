//! Fingerprint-addressed artifact cache.
//!
//! Each compiled kernel is stored flat in the build folder as
//! `<prefix><fingerprint>` next to a JSON sidecar describing it. An artifact
//! only ever reaches its final name through an atomic rename, so its presence
//! together with a matching sidecar is a complete cache hit.
//!
//! # Lookup order
//!
//! 1. In-memory handle table (same `Arc` returned again)
//! 2. Artifact + sidecar on disk
//! 3. Compile under a per-fingerprint advisory lock

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::lock::BuildLock;
use crate::paths::{BuildDirs, write_atomic};
use crate::progress;
use crate::source::{Formula, FormulaMetadata, GeneratedKernel, SourceGenerator};

use super::probe::{TargetFormat, ToolchainProfile};

/// Sidecar format version.
///
/// Increment when [`ArtifactRecord`] changes incompatibly; older sidecars
/// are then treated as misses and their artifacts recompiled.
pub const RECORD_VERSION: u32 = 1;

/// Stable cache key of a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest of the formula identity, precision, target format and device.
    pub fn compute(formula: &Formula, format: TargetFormat, device_id: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(formula.id.as_bytes());
        hasher.update([0u8, u8::from(formula.reduced_precision)]);
        hasher.update(format.prefix().as_bytes());
        hasher.update(device_id.to_le_bytes());
        let digest = hasher.finalize();

        Self(digest[..8].iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a returned artifact was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOrigin {
    /// Compiled by this call.
    Compiled,
    /// Found on disk from an earlier run.
    Disk,
}

/// A compiled kernel on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub fingerprint: Fingerprint,

    /// Path to the CUBIN or PTX file.
    pub binary_path: PathBuf,

    /// Path to the JSON sidecar.
    pub metadata_path: PathBuf,

    pub target_format: TargetFormat,

    pub device_id: u32,

    /// Metadata reported by the source generator.
    pub metadata: FormulaMetadata,

    pub origin: ArtifactOrigin,
}

impl CompiledArtifact {
    /// Whether the artifact file is still present.
    pub fn exists(&self) -> bool {
        self.binary_path.exists()
    }
}

/// Sidecar file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub version: u32,
    pub fingerprint: Fingerprint,
    pub formula_id: String,
    pub target_format: TargetFormat,
    pub device_id: u32,
    pub reduced_precision: bool,
    pub toolchain_version: i32,
    pub metadata: FormulaMetadata,
    /// Unix timestamp of compilation.
    pub created_at: u64,
}

impl ArtifactRecord {
    /// Whether this record describes `formula` compiled by `profile`'s
    /// toolchain for `device_id`.
    fn describes(&self, profile: &ToolchainProfile, formula: &Formula, device_id: u32) -> bool {
        self.version == RECORD_VERSION
            && self.formula_id == formula.id
            && self.reduced_precision == formula.reduced_precision
            && self.target_format == profile.target_format
            && self.toolchain_version == profile.toolchain_version
            && self.device_id == device_id
    }
}

/// Everything needed to resolve one formula.
pub struct CompileJob<'a> {
    pub profile: &'a ToolchainProfile,
    pub formula: &'a Formula,
    pub device_id: u32,
    pub generator: &'a dyn SourceGenerator,
}

/// Artifact cache over one build folder.
pub struct ArtifactCache {
    /// Build folder layout
    dirs: BuildDirs,

    /// Dump generated source next to each artifact
    keep_sources: bool,

    /// Report compilations at info level
    pub(crate) verbose: bool,

    /// Handles resolved by this process
    handles: Mutex<FxHashMap<Fingerprint, Arc<CompiledArtifact>>>,
}

impl ArtifactCache {
    /// Create a cache over `dirs`.
    pub fn new(dirs: BuildDirs, keep_sources: bool, verbose: bool) -> Self {
        Self {
            dirs,
            keep_sources,
            verbose,
            handles: Mutex::new(FxHashMap::default()),
        }
    }

    /// Build folder layout this cache resolves against.
    pub fn dirs(&self) -> &BuildDirs {
        &self.dirs
    }

    /// Number of handles held in memory.
    pub fn len(&self) -> usize {
        self.handles().len()
    }

    /// Whether no handles are held in memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all in-memory handles. Files on disk are kept.
    pub fn invalidate(&self) {
        let mut handles = self.handles();
        if !handles.is_empty() {
            tracing::debug!("Dropping {} cached artifact handle(s)", handles.len());
        }
        handles.clear();
    }

    /// Look up an artifact without compiling.
    pub fn lookup(
        &self,
        profile: &ToolchainProfile,
        formula: &Formula,
        device_id: u32,
    ) -> Option<Arc<CompiledArtifact>> {
        let fingerprint = Fingerprint::compute(formula, profile.target_format, device_id);
        self.lookup_fingerprint(&fingerprint, profile, formula, device_id)
    }

    fn lookup_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        profile: &ToolchainProfile,
        formula: &Formula,
        device_id: u32,
    ) -> Option<Arc<CompiledArtifact>> {
        if let Some(handle) = self.handles().get(fingerprint) {
            if handle.exists() {
                return Some(Arc::clone(handle));
            }
            tracing::debug!("Artifact {} vanished from disk", handle.binary_path.display());
        }

        let artifact = Arc::new(self.load_from_disk(fingerprint, profile, formula, device_id)?);
        self.handles()
            .insert(fingerprint.clone(), Arc::clone(&artifact));
        Some(artifact)
    }

    /// Resolve `job` to an artifact, compiling on a miss.
    ///
    /// `compile` receives the generated kernel and the final artifact path,
    /// and must leave a complete artifact at that path or fail.
    pub fn get_or_compile<F>(&self, job: &CompileJob<'_>, compile: F) -> Result<Arc<CompiledArtifact>>
    where
        F: FnOnce(&GeneratedKernel, &Path) -> Result<()>,
    {
        let format = job.profile.target_format;
        let fingerprint = Fingerprint::compute(job.formula, format, job.device_id);

        if let Some(hit) = self.lookup_fingerprint(&fingerprint, job.profile, job.formula, job.device_id) {
            tracing::debug!("Cache hit {}{}", format.prefix(), fingerprint);
            return Ok(hit);
        }

        let _lock = BuildLock::acquire(&self.dirs.artifact_lock_path(format, fingerprint.as_str()))?;
        if let Some(hit) = self.lookup_fingerprint(&fingerprint, job.profile, job.formula, job.device_id) {
            tracing::debug!("Artifact {} compiled by another process", fingerprint);
            return Ok(hit);
        }

        let binary_path = self.dirs.artifact_path(format, fingerprint.as_str());
        let metadata_path = self.dirs.metadata_path(format, fingerprint.as_str());

        progress!(
            self.verbose,
            "Compiling {}{} for device {}...",
            format.prefix(),
            fingerprint,
            job.device_id
        );

        let kernel = job.generator.generate(job.formula, format, job.device_id)?;
        if self.keep_sources {
            let dump = self.dirs.source_dump_path(format, fingerprint.as_str());
            if let Err(e) = fs::write(&dump, &kernel.source) {
                tracing::warn!("Failed to keep kernel source {}: {}", dump.display(), e);
            }
        }

        compile(&kernel, &binary_path).map_err(|e| match e {
            Error::Compilation { message, .. } => Error::Compilation {
                fingerprint: Some(fingerprint.to_string()),
                message,
            },
            other => other,
        })?;

        let record = ArtifactRecord {
            version: RECORD_VERSION,
            fingerprint: fingerprint.clone(),
            formula_id: job.formula.id.clone(),
            target_format: format,
            device_id: job.device_id,
            reduced_precision: job.formula.reduced_precision,
            toolchain_version: job.profile.toolchain_version,
            metadata: kernel.metadata,
            created_at: unix_now(),
        };
        write_record(&metadata_path, &record)?;

        let artifact = Arc::new(CompiledArtifact {
            fingerprint: fingerprint.clone(),
            binary_path,
            metadata_path,
            target_format: format,
            device_id: job.device_id,
            metadata: kernel.metadata,
            origin: ArtifactOrigin::Compiled,
        });
        self.handles().insert(fingerprint, Arc::clone(&artifact));
        Ok(artifact)
    }

    /// Read an artifact and its sidecar from disk, if both are valid.
    fn load_from_disk(
        &self,
        fingerprint: &Fingerprint,
        profile: &ToolchainProfile,
        formula: &Formula,
        device_id: u32,
    ) -> Option<CompiledArtifact> {
        let format = profile.target_format;
        let binary_path = self.dirs.artifact_path(format, fingerprint.as_str());
        if !binary_path.exists() {
            return None;
        }

        let metadata_path = self.dirs.metadata_path(format, fingerprint.as_str());
        let record = match read_record(&metadata_path) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    "Ignoring artifact {} with unreadable sidecar: {}",
                    binary_path.display(),
                    e
                );
                return None;
            }
        };

        if !record.describes(profile, formula, device_id) {
            tracing::warn!(
                "Sidecar {} does not match the requested formula or toolchain, recompiling",
                metadata_path.display()
            );
            return None;
        }

        Some(CompiledArtifact {
            fingerprint: fingerprint.clone(),
            binary_path,
            metadata_path,
            target_format: format,
            device_id,
            metadata: record.metadata,
            origin: ArtifactOrigin::Disk,
        })
    }

    fn handles(&self) -> MutexGuard<'_, FxHashMap<Fingerprint, Arc<CompiledArtifact>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read a sidecar file.
pub fn read_record(path: &Path) -> Result<ArtifactRecord> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn write_record(path: &Path, record: &ArtifactRecord) -> Result<()> {
    let bytes =
        serde_json::to_vec_pretty(record).map_err(|e| Error::Serialization(e.to_string()))?;
    write_atomic(path, &bytes)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
