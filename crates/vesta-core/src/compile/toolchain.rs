//! Native toolchain discovery.
//!
//! Locates the host C++ compiler and the CUDA installation used to build
//! the bootstrap driver.

use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Host compilers tried, in order, when none is configured.
const CXX_CANDIDATES: &[&str] = &["g++", "c++", "clang++"];

/// Host compiler plus CUDA paths for building the driver.
#[derive(Debug, Clone)]
pub struct NativeToolchain {
    /// Path to the C++ compiler.
    cxx: PathBuf,

    /// CUDA installation root.
    cuda_home: PathBuf,

    /// Extra user flags appended to every build.
    extra_flags: Vec<String>,
}

impl NativeToolchain {
    /// Detect the toolchain, honoring explicit settings first.
    pub fn detect(settings: &Settings) -> Result<Self> {
        let cxx = match &settings.cxx_compiler {
            Some(cxx) if cxx.components().count() > 1 => cxx.clone(),
            Some(cxx) => which::which(cxx).map_err(|_| {
                Error::Toolchain(format!("C++ compiler '{}' not found in PATH", cxx.display()))
            })?,
            None => Self::find_cxx()?,
        };

        let cuda_home = match &settings.cuda_home {
            Some(home) => home.clone(),
            None => Self::find_cuda_home()?,
        };

        Ok(Self {
            cxx,
            cuda_home,
            extra_flags: settings.extra_cxx_flags.clone(),
        })
    }

    /// Get the C++ compiler path.
    pub fn cxx(&self) -> &Path {
        &self.cxx
    }

    /// Get the CUDA installation root.
    pub fn cuda_home(&self) -> &Path {
        &self.cuda_home
    }

    /// CUDA header directory.
    pub fn include_dir(&self) -> PathBuf {
        self.cuda_home.join("include")
    }

    /// CUDA library directory (`lib64` when present).
    pub fn lib_dir(&self) -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            self.cuda_home.join("lib").join("x64")
        }
        #[cfg(not(target_os = "windows"))]
        {
            let lib64 = self.cuda_home.join("lib64");
            if lib64.exists() {
                lib64
            } else {
                self.cuda_home.join("lib")
            }
        }
    }

    /// Include path handed to NVRTC for `cuda_fp16.h`, with a trailing separator.
    pub fn fp16_include_path(&self) -> String {
        format!(
            "{}{}",
            self.include_dir().display(),
            std::path::MAIN_SEPARATOR
        )
    }

    /// Flags producing a position-independent shared library.
    pub fn shared_library_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = ["-shared", "-fPIC", "-O3", "-std=c++11"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        flags.extend(self.extra_flags.iter().cloned());
        flags
    }

    /// Header search flags.
    pub fn include_flags(&self) -> Vec<String> {
        vec![format!("-I{}", self.include_dir().display())]
    }

    /// Library search and link flags for NVRTC and the driver API.
    pub fn link_flags(&self) -> Vec<String> {
        let lib_dir = self.lib_dir();
        let mut flags = vec![format!("-L{}", lib_dir.display())];
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        flags.push(format!("-Wl,-rpath,{}", lib_dir.display()));
        flags.push("-lnvrtc".to_string());
        flags.push("-lcuda".to_string());
        flags
    }

    /// Find a C++ compiler in PATH.
    fn find_cxx() -> Result<PathBuf> {
        CXX_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                Error::Toolchain(format!(
                    "no C++ compiler found in PATH (tried {})",
                    CXX_CANDIDATES.join(", ")
                ))
            })
    }

    /// Find the CUDA root from `nvcc` in PATH or the conventional location.
    fn find_cuda_home() -> Result<PathBuf> {
        if let Ok(nvcc) = which::which("nvcc")
            && let Some(home) = nvcc.parent().and_then(Path::parent)
        {
            return Ok(home.to_path_buf());
        }

        let conventional = PathBuf::from("/usr/local/cuda");
        if conventional.join("include").join("nvrtc.h").exists() {
            return Ok(conventional);
        }

        Err(Error::Toolchain(
            "CUDA installation not found (set CUDA_HOME)".to_string(),
        ))
    }
}
