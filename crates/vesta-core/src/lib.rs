//! Core engine for Vesta, a JIT compiler and artifact cache for GPU kernels.
//!
//! This crate provides:
//! - Platform probing (CUDA version, devices, CUBIN vs PTX selection)
//! - A bootstrap driver, built once, wrapping NVRTC runtime compilation
//! - A fingerprint-addressed artifact cache with sidecar metadata
//! - An explicit [`JitContext`] holding all process-wide state

/// Log a progress message at info level when verbose, debug otherwise.
macro_rules! progress {
    ($verbose:expr, $($arg:tt)*) => {
        if $verbose {
            tracing::info!($($arg)*);
        } else {
            tracing::debug!($($arg)*);
        }
    };
}

pub(crate) use progress;

pub mod compile;
pub mod config;
pub mod context;
pub mod error;
mod lock;
pub mod paths;
pub mod source;

pub use compile::{
    ArtifactOrigin, BootstrapDriver, CompileRequest, CompiledArtifact, CudaProbe, DeviceProps,
    DriverLoader, Fingerprint, KernelCompiler, NativeLoader, PlatformProbe, TargetFormat,
    ToolchainProfile,
};
pub use config::Settings;
pub use context::{JitContext, JitStatus, ResetOptions};
pub use error::{Error, Result};
pub use paths::BuildDirs;
pub use source::{Formula, FormulaMetadata, GeneratedKernel, SourceGenerator};
