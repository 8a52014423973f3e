//! Runtime configuration.
//!
//! Settings are read once from the environment and then owned by a
//! [`JitContext`](crate::JitContext). Changing the build folder afterwards
//! goes through the context so that cached handles are invalidated.

use std::path::PathBuf;

/// Environment variable overriding the build folder.
pub const ENV_BUILD_FOLDER: &str = "VESTA_BUILD_FOLDER";
/// Environment variable controlling verbosity (`"0"` turns it off).
pub const ENV_VERBOSE: &str = "VESTA_VERBOSE";
/// Environment variable enabling kernel source dumps.
pub const ENV_KEEP_SOURCES: &str = "VESTA_KEEP_SOURCES";

/// Configuration for a JIT context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Folder holding the driver, artifacts and sidecars.
    pub build_folder: PathBuf,

    /// Report compilation progress at info level instead of debug.
    pub verbose: bool,

    /// Host C++ compiler for the bootstrap driver. Detected from PATH if None.
    pub cxx_compiler: Option<PathBuf>,

    /// CUDA installation root. Detected if None.
    pub cuda_home: Option<PathBuf>,

    /// Additional flags passed to the host compiler.
    pub extra_cxx_flags: Vec<String>,

    /// Write generated kernel source next to each artifact.
    pub keep_sources: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_folder: default_build_folder(),
            verbose: true,
            cxx_compiler: None,
            cuda_home: None,
            extra_cxx_flags: Vec::new(),
            keep_sources: false,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(folder) = lookup(ENV_BUILD_FOLDER).filter(|v| !v.is_empty()) {
            settings.build_folder = PathBuf::from(folder);
        }
        if let Some(verbose) = lookup(ENV_VERBOSE) {
            settings.verbose = verbose.trim() != "0";
        }
        if let Some(cxx) = lookup("CXX").filter(|v| !v.is_empty()) {
            settings.cxx_compiler = Some(PathBuf::from(cxx));
        }
        settings.cuda_home = lookup("CUDA_HOME")
            .or_else(|| lookup("CUDA_PATH"))
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        if let Some(keep) = lookup(ENV_KEEP_SOURCES) {
            settings.keep_sources = matches!(keep.trim(), "1" | "true" | "yes");
        }

        settings
    }

    /// Use a specific build folder.
    pub fn with_build_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.build_folder = folder.into();
        self
    }
}

/// `<user cache dir>/vesta/<version>/build`, or a temp-dir fallback.
fn default_build_folder() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vesta")
        .join(env!("CARGO_PKG_VERSION"))
        .join("build")
}
