//! Build folder layout.
//!
//! Every file Vesta produces lives flat inside a single build folder:
//!
//! ```text
//! <build>/
//! ├── vesta_nvrtc.cpp     # Bootstrap driver source (written on build)
//! ├── libvesta_nvrtc.so   # Bootstrap driver
//! ├── vesta_nvrtc.json    # Configuration the driver was built for
//! ├── vesta_nvrtc.lock    # Advisory lock for driver builds
//! ├── cubin_<fp>          # Compiled artifact (or ptx_<fp>)
//! ├── cubin_<fp>.json     # Sidecar metadata
//! ├── cubin_<fp>.lock     # Advisory lock for artifact builds
//! └── cubin_<fp>.cu       # Kernel source (only with keep_sources)
//! ```

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::compile::TargetFormat;
use crate::error::{Error, Result};

/// Base name of the bootstrap driver files.
pub const DRIVER_STEM: &str = "vesta_nvrtc";

/// Directory layout of a Vesta build folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDirs {
    /// The build folder itself.
    pub root: PathBuf,
}

impl BuildDirs {
    /// Open a build folder, creating it if it doesn't exist.
    ///
    /// # Errors
    /// Returns [`Error::CachePath`] if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::cache_path(&root, e))?;
        Ok(Self { root })
    }

    /// Path of the bootstrap driver shared library.
    pub fn driver_path(&self) -> PathBuf {
        self.root.join(format!(
            "{}{}.{}",
            dylib_prefix(),
            DRIVER_STEM,
            dylib_extension()
        ))
    }

    /// Path the driver's C++ source is written to before compiling.
    pub fn driver_source_path(&self) -> PathBuf {
        self.root.join(format!("{}.cpp", DRIVER_STEM))
    }

    /// Path of the record describing the configuration the driver was built for.
    pub fn driver_record_path(&self) -> PathBuf {
        self.root.join(format!("{}.json", DRIVER_STEM))
    }

    /// Path of the lock file guarding driver builds.
    pub fn driver_lock_path(&self) -> PathBuf {
        self.root.join(format!("{}.lock", DRIVER_STEM))
    }

    /// Path of the compiled artifact for a fingerprint.
    pub fn artifact_path(&self, format: TargetFormat, fingerprint: &str) -> PathBuf {
        self.root.join(artifact_name(format, fingerprint))
    }

    /// Path of the sidecar metadata for a fingerprint.
    pub fn metadata_path(&self, format: TargetFormat, fingerprint: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", artifact_name(format, fingerprint)))
    }

    /// Path of the lock file guarding an artifact build.
    pub fn artifact_lock_path(&self, format: TargetFormat, fingerprint: &str) -> PathBuf {
        self.root
            .join(format!("{}.lock", artifact_name(format, fingerprint)))
    }

    /// Path the generated kernel source is dumped to.
    pub fn source_dump_path(&self, format: TargetFormat, fingerprint: &str) -> PathBuf {
        self.root
            .join(format!("{}.cu", artifact_name(format, fingerprint)))
    }

    /// Remove everything inside the build folder except lock files.
    ///
    /// Lock files stay in place: another process may hold one, and unlinking
    /// it would let a newcomer lock a fresh inode while the holder still
    /// builds under the old one.
    pub fn clean(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| Error::cache_path(&self.root, e))?;
        let entries = fs::read_dir(&self.root).map_err(|e| Error::cache_path(&self.root, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::cache_path(&self.root, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "lock") {
                continue;
            }

            let file_type = entry
                .file_type()
                .map_err(|e| Error::cache_path(&path, e))?;
            let removed = if file_type.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| Error::cache_path(&path, e))?;
        }
        Ok(())
    }
}

fn artifact_name(format: TargetFormat, fingerprint: &str) -> String {
    format!("{}{}", format.prefix(), fingerprint)
}

/// Platform-specific dynamic library extension.
pub fn dylib_extension() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
    #[cfg(target_os = "macos")]
    {
        "dylib"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "so"
    }
}

/// Platform-specific dynamic library prefix.
pub fn dylib_prefix() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        ""
    }
    #[cfg(not(target_os = "windows"))]
    {
        "lib"
    }
}

/// A sibling of `path` with a unique suffix, for write-then-rename.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Write `bytes` to `path` via a temp file and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = temp_sibling(path);
    let written = fs::write(&temp, bytes).and_then(|()| fs::rename(&temp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(Error::cache_path(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_is_flat() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = BuildDirs::new(temp.path().join("build")).expect("Failed to create dirs");

        assert!(dirs.root.exists());
        assert_eq!(dirs.driver_path().parent(), Some(dirs.root.as_path()));
        assert_eq!(
            dirs.artifact_path(TargetFormat::Cubin, "abc"),
            dirs.root.join("cubin_abc")
        );
        assert_eq!(
            dirs.metadata_path(TargetFormat::Ptx, "abc"),
            dirs.root.join("ptx_abc.json")
        );
        assert_eq!(
            dirs.artifact_lock_path(TargetFormat::Ptx, "abc"),
            dirs.root.join("ptx_abc.lock")
        );
    }

    #[test]
    fn test_clean() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = BuildDirs::new(temp.path().join("build")).expect("Failed to create dirs");

        let artifact = dirs.artifact_path(TargetFormat::Cubin, "abc");
        fs::write(&artifact, "binary").expect("Failed to write artifact");
        assert!(artifact.exists());

        dirs.clean().expect("Failed to clean");
        assert!(!artifact.exists());
        assert!(dirs.root.exists());
    }

    #[test]
    fn test_clean_keeps_lock_files() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = BuildDirs::new(temp.path().join("build")).expect("Failed to create dirs");

        let lock = dirs.artifact_lock_path(TargetFormat::Cubin, "abc");
        let record = dirs.metadata_path(TargetFormat::Cubin, "abc");
        let nested = dirs.root.join("scratch");
        fs::write(&lock, "").expect("Failed to write lock");
        fs::write(dirs.driver_lock_path(), "").expect("Failed to write driver lock");
        fs::write(&record, "{}").expect("Failed to write record");
        fs::write(dirs.driver_path(), "driver").expect("Failed to write driver");
        fs::create_dir_all(nested.join("deep")).expect("Failed to create dir");

        dirs.clean().expect("Failed to clean");

        assert!(lock.exists());
        assert!(dirs.driver_lock_path().exists());
        assert!(!record.exists());
        assert!(!dirs.driver_path().exists());
        assert!(!nested.exists());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let target = temp.path().join("record.json");

        write_atomic(&target, b"{}").expect("Failed to write");
        assert_eq!(fs::read(&target).unwrap(), b"{}");

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
