//! Platform capability probe.
//!
//! Detects the CUDA runtime version and the visible devices, and decides
//! which artifact format the runtime compiler can emit.

use std::fmt;
use std::path::PathBuf;

use libc::c_int;
use libloading::{Library, Symbol};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// First CUDA version (11.1) whose NVRTC can emit CUBIN directly.
pub const CUBIN_MIN_VERSION: i32 = 11010;

const CUDA_SUCCESS: c_int = 0;
const CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK: c_int = 1;
const CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK: c_int = 8;

/// Kind of artifact produced by runtime compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    /// Device binary, loadable without a further JIT step.
    Cubin,
    /// Virtual ISA assembly, finalized by the driver at load time.
    Ptx,
}

impl TargetFormat {
    /// Select the format supported by a CUDA toolchain version.
    pub fn for_version(toolchain_version: i32) -> Self {
        if toolchain_version >= CUBIN_MIN_VERSION {
            Self::Cubin
        } else {
            Self::Ptx
        }
    }

    /// File name prefix of artifacts in this format.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Cubin => "cubin_",
            Self::Ptx => "ptx_",
        }
    }

    /// Architecture tag passed to NVRTC (`sm_XY` vs `compute_XY`).
    pub fn arch_tag(self) -> &'static str {
        match self {
            Self::Cubin => "sm",
            Self::Ptx => "compute",
        }
    }

    /// NVRTC function retrieving the compiled artifact.
    pub fn nvrtc_getter(self) -> &'static str {
        match self {
            Self::Cubin => "nvrtcGetCUBIN",
            Self::Ptx => "nvrtcGetPTX",
        }
    }

    /// NVRTC function retrieving the compiled artifact's size.
    pub fn nvrtc_size_getter(self) -> &'static str {
        match self {
            Self::Cubin => "nvrtcGetCUBINSize",
            Self::Ptx => "nvrtcGetPTXSize",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cubin => write!(f, "CUBIN"),
            Self::Ptx => write!(f, "PTX"),
        }
    }
}

/// Launch limits of one device, baked into the bootstrap driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProps {
    pub max_threads_per_block: i32,
    pub shared_mem_per_block: i32,
}

/// What the installed toolchain and hardware can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainProfile {
    /// CUDA version as reported by the runtime (e.g. 12040 for 12.4).
    pub toolchain_version: i32,

    /// Artifact format selected from `toolchain_version`.
    pub target_format: TargetFormat,

    /// Number of visible devices.
    pub device_count: usize,

    /// Per-device launch limits, indexed by device id.
    pub devices: Vec<DeviceProps>,

    /// Preprocessor flags describing the devices.
    pub device_compile_flags: String,
}

impl ToolchainProfile {
    /// Assemble a profile from a toolchain version and the visible devices.
    pub fn new(toolchain_version: i32, devices: Vec<DeviceProps>) -> Self {
        let device_compile_flags = device_compile_flags(&devices);
        Self {
            toolchain_version,
            target_format: TargetFormat::for_version(toolchain_version),
            device_count: devices.len(),
            devices,
            device_compile_flags,
        }
    }

    /// Human-readable toolchain version, e.g. `12.4`.
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}",
            self.toolchain_version / 1000,
            (self.toolchain_version % 1000) / 10
        )
    }
}

/// Render `-DMAXIDGPU=.. -DMAXTHREADSPERBLOCK<i>=.. -DSHAREDMEMPERBLOCK<i>=..`.
fn device_compile_flags(devices: &[DeviceProps]) -> String {
    if devices.is_empty() {
        return String::new();
    }

    let mut flags = vec![format!("-DMAXIDGPU={}", devices.len() - 1)];
    for (i, props) in devices.iter().enumerate() {
        flags.push(format!(
            "-DMAXTHREADSPERBLOCK{}={}",
            i, props.max_threads_per_block
        ));
        flags.push(format!(
            "-DSHAREDMEMPERBLOCK{}={}",
            i, props.shared_mem_per_block
        ));
    }
    flags.join(" ")
}

/// Source of a [`ToolchainProfile`].
pub trait PlatformProbe: Send + Sync {
    /// Inspect the platform.
    ///
    /// # Errors
    /// Returns [`Error::PlatformUnavailable`] when no device or toolchain is usable.
    fn probe(&self) -> Result<ToolchainProfile>;
}

/// Probe backed by the CUDA runtime and driver libraries, loaded at runtime.
#[derive(Debug, Clone, Default)]
pub struct CudaProbe {
    cuda_home: Option<PathBuf>,
}

type CudaRuntimeGetVersionFn = unsafe extern "C" fn(*mut c_int) -> c_int;
type CuInitFn = unsafe extern "C" fn(u32) -> c_int;
type CuDeviceGetCountFn = unsafe extern "C" fn(*mut c_int) -> c_int;
type CuDeviceGetFn = unsafe extern "C" fn(*mut c_int, c_int) -> c_int;
type CuDeviceGetAttributeFn = unsafe extern "C" fn(*mut c_int, c_int, c_int) -> c_int;

impl CudaProbe {
    /// Create a probe, optionally searching a CUDA root for the runtime library.
    pub fn new(cuda_home: Option<PathBuf>) -> Self {
        Self { cuda_home }
    }

    fn runtime_candidates(&self) -> Vec<PathBuf> {
        let mut names: Vec<PathBuf> = Vec::new();
        if let Some(home) = &self.cuda_home {
            #[cfg(target_os = "windows")]
            names.push(home.join("bin").join("cudart64_12.dll"));
            #[cfg(not(target_os = "windows"))]
            {
                names.push(home.join("lib64").join("libcudart.so"));
                names.push(home.join("lib").join("libcudart.so"));
            }
        }
        #[cfg(target_os = "windows")]
        names.extend(["cudart64_12.dll", "cudart64_110.dll"].map(PathBuf::from));
        #[cfg(target_os = "macos")]
        names.push(PathBuf::from("libcudart.dylib"));
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        names.extend(
            ["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"].map(PathBuf::from),
        );
        names
    }

    fn driver_candidates() -> &'static [&'static str] {
        #[cfg(target_os = "windows")]
        {
            &["nvcuda.dll"]
        }
        #[cfg(target_os = "macos")]
        {
            &["libcuda.dylib"]
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            &["libcuda.so.1", "libcuda.so"]
        }
    }

    fn toolchain_version(&self) -> Result<i32> {
        let runtime = open_first(self.runtime_candidates())
            .ok_or_else(|| unavailable("CUDA runtime library (libcudart) not found"))?;

        let mut version: c_int = 0;
        // SAFETY: symbol signature matches cudaRuntimeGetVersion(int*).
        let status = unsafe {
            let get_version: Symbol<CudaRuntimeGetVersionFn> =
                runtime.get(b"cudaRuntimeGetVersion")?;
            get_version(&mut version)
        };
        if status != CUDA_SUCCESS || version <= 0 {
            return Err(unavailable(format!(
                "cudaRuntimeGetVersion failed with code {}",
                status
            )));
        }
        Ok(version)
    }

    fn devices(&self) -> Result<Vec<DeviceProps>> {
        let driver = open_first(Self::driver_candidates().iter().map(PathBuf::from))
            .ok_or_else(|| unavailable("CUDA driver library (libcuda) not found"))?;

        // SAFETY: signatures match the CUDA driver API declarations in cuda.h.
        unsafe {
            let cu_init: Symbol<CuInitFn> = driver.get(b"cuInit")?;
            let cu_count: Symbol<CuDeviceGetCountFn> = driver.get(b"cuDeviceGetCount")?;
            let cu_device: Symbol<CuDeviceGetFn> = driver.get(b"cuDeviceGet")?;
            let cu_attr: Symbol<CuDeviceGetAttributeFn> = driver.get(b"cuDeviceGetAttribute")?;

            let status = cu_init(0);
            if status != CUDA_SUCCESS {
                return Err(unavailable(format!("cuInit failed with code {}", status)));
            }

            let mut count: c_int = 0;
            let status = cu_count(&mut count);
            if status != CUDA_SUCCESS {
                return Err(unavailable(format!(
                    "cuDeviceGetCount failed with code {}",
                    status
                )));
            }

            let mut devices = Vec::with_capacity(count.max(0) as usize);
            for ordinal in 0..count {
                let mut device: c_int = 0;
                if cu_device(&mut device, ordinal) != CUDA_SUCCESS {
                    return Err(unavailable(format!("cuDeviceGet({}) failed", ordinal)));
                }
                let mut threads: c_int = 0;
                let mut shared: c_int = 0;
                if cu_attr(&mut threads, CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK, device)
                    != CUDA_SUCCESS
                    || cu_attr(
                        &mut shared,
                        CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
                        device,
                    ) != CUDA_SUCCESS
                {
                    return Err(unavailable(format!(
                        "cuDeviceGetAttribute failed for device {}",
                        ordinal
                    )));
                }
                devices.push(DeviceProps {
                    max_threads_per_block: threads,
                    shared_mem_per_block: shared,
                });
            }
            Ok(devices)
        }
    }
}

impl PlatformProbe for CudaProbe {
    fn probe(&self) -> Result<ToolchainProfile> {
        let version = self.toolchain_version()?;
        let devices = self.devices()?;
        if devices.is_empty() {
            return Err(unavailable("no CUDA device detected"));
        }

        let profile = ToolchainProfile::new(version, devices);
        tracing::debug!(
            "CUDA {} with {} device(s), target format {}",
            profile.version_string(),
            profile.device_count,
            profile.target_format
        );
        Ok(profile)
    }
}

fn open_first(candidates: impl IntoIterator<Item = PathBuf>) -> Option<Library> {
    candidates.into_iter().find_map(|name| {
        // SAFETY: CUDA libraries have no unsound initializers.
        match unsafe { Library::new(&name) } {
            Ok(lib) => Some(lib),
            Err(e) => {
                tracing::trace!("Could not load {}: {}", name.display(), e);
                None
            }
        }
    })
}

fn unavailable(message: impl Into<String>) -> Error {
    Error::PlatformUnavailable(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> DeviceProps {
        DeviceProps {
            max_threads_per_block: 1024,
            shared_mem_per_block: 49152,
        }
    }

    #[test]
    fn test_cubin_threshold_boundary() {
        assert_eq!(TargetFormat::for_version(11010), TargetFormat::Cubin);
        assert_eq!(TargetFormat::for_version(11009), TargetFormat::Ptx);
        assert_eq!(TargetFormat::for_version(12040), TargetFormat::Cubin);
        assert_eq!(TargetFormat::for_version(10020), TargetFormat::Ptx);

        assert_eq!(TargetFormat::for_version(11010).prefix(), "cubin_");
        assert_eq!(TargetFormat::for_version(11009).prefix(), "ptx_");
    }

    #[test]
    fn test_format_symbols() {
        assert_eq!(TargetFormat::Cubin.arch_tag(), "sm");
        assert_eq!(TargetFormat::Ptx.arch_tag(), "compute");
        assert_eq!(TargetFormat::Cubin.nvrtc_getter(), "nvrtcGetCUBIN");
        assert_eq!(TargetFormat::Ptx.nvrtc_size_getter(), "nvrtcGetPTXSize");
    }

    #[test]
    fn test_profile_flags() {
        let profile = ToolchainProfile::new(12040, vec![props(), props()]);

        assert_eq!(profile.device_count, 2);
        assert_eq!(profile.target_format, TargetFormat::Cubin);
        assert_eq!(
            profile.device_compile_flags,
            "-DMAXIDGPU=1 -DMAXTHREADSPERBLOCK0=1024 -DSHAREDMEMPERBLOCK0=49152 \
             -DMAXTHREADSPERBLOCK1=1024 -DSHAREDMEMPERBLOCK1=49152"
        );
        assert_eq!(profile.version_string(), "12.4");
    }

    #[test]
    fn test_profile_without_devices() {
        let profile = ToolchainProfile::new(11000, Vec::new());
        assert_eq!(profile.device_count, 0);
        assert!(profile.device_compile_flags.is_empty());
        assert_eq!(profile.target_format, TargetFormat::Ptx);
    }

    #[test]
    fn test_format_serializes_lowercase() {
        let json = serde_json::to_string(&TargetFormat::Cubin).unwrap();
        assert_eq!(json, "\"cubin\"");
    }
}
