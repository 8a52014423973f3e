//! Error types for vesta-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for vesta-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vesta-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable accelerator or CUDA toolchain was detected.
    #[error("platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// The host compiler failed while building the bootstrap driver.
    #[error("bootstrap driver build failed: {message}\n  command: {command}")]
    DriverBuild { command: String, message: String },

    /// Runtime compilation did not produce an artifact.
    #[error("compilation failed{}: {message}", fingerprint.as_ref().map(|fp| format!(" for {}", fp)).unwrap_or_default())]
    Compilation {
        fingerprint: Option<String>,
        message: String,
    },

    /// The build folder could not be created, read or written.
    #[error("cache path error at {}: {message}", path.display())]
    CachePath { path: PathBuf, message: String },

    /// Requested device index is out of range.
    #[error("invalid device {device_id}: {device_count} device(s) detected")]
    InvalidDevice { device_id: u32, device_count: usize },

    /// Host compiler or CUDA installation not found.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// Failed to load dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Sidecar metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::CachePath`] from an IO failure on `path`.
    pub fn cache_path(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::CachePath {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Render the error followed by a short recovery hint.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::PlatformUnavailable(_) => Some(
                "check that an NVIDIA driver is installed and that libcuda/libcudart are on the \
                 library search path",
            ),
            Self::DriverBuild { .. } => Some(
                "fix the compiler error above, then run `vesta driver --force`; set CXX or \
                 CUDA_HOME if the wrong toolchain was picked",
            ),
            Self::Compilation { .. } => {
                Some("inspect the kernel source (set VESTA_KEEP_SOURCES=1 to keep it on disk)")
            }
            Self::CachePath { .. } => Some(
                "check permissions on the build folder or relocate it with --build-folder / \
                 VESTA_BUILD_FOLDER",
            ),
            Self::InvalidDevice { .. } => Some("run `vesta status` to list detected devices"),
            Self::Toolchain(_) => Some("set CXX to a C++ compiler and CUDA_HOME to the CUDA root"),
            Self::LibraryLoad(_) => Some("run `vesta driver --force` to rebuild the driver"),
            Self::Serialization(_) | Self::Io(_) => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
