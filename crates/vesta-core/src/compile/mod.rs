//! Compilation pipeline for GPU kernels.
//!
//! This module handles:
//! - Probing the CUDA toolchain and devices
//! - Resolving the host C++ toolchain
//! - Building the NVRTC bootstrap driver
//! - Invoking the driver for each kernel
//! - Caching compiled artifacts by fingerprint

mod cache;
mod driver;
mod invoker;
mod probe;
mod toolchain;

pub use cache::{
    ArtifactCache, ArtifactOrigin, ArtifactRecord, CompileJob, CompiledArtifact, Fingerprint,
    RECORD_VERSION, read_record,
};
pub use driver::{
    BootstrapDriver, DRIVER_RECORD_VERSION, DriverBuilder, DriverRecord, driver_defines,
};
pub use invoker::{
    CompileEntryFn, CompileRequest, DriverLoader, ENTRY_SYMBOL, JitInvoker, KernelCompiler,
    NativeDriver, NativeLoader,
};
pub use probe::{
    CUBIN_MIN_VERSION, CudaProbe, DeviceProps, PlatformProbe, TargetFormat, ToolchainProfile,
};
pub use toolchain::NativeToolchain;
