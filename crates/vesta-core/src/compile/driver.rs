//! Bootstrap driver builder.
//!
//! The bootstrap driver is a small shared library wrapping NVRTC. It is
//! compiled once per build folder with the host C++ compiler and then loaded
//! by the [`JitInvoker`](super::JitInvoker) for every kernel compilation.
//!
//! The target format and device limits are baked into the binary, so a
//! [`DriverRecord`] is kept next to it. A driver whose record does not match
//! the current profile is treated as missing and rebuilt.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::lock::BuildLock;
use crate::paths::{BuildDirs, temp_sibling, write_atomic};
use crate::progress;

use super::probe::{TargetFormat, ToolchainProfile};
use super::toolchain::NativeToolchain;

/// C++ source of the driver, embedded at build time.
const DRIVER_SOURCE: &str = include_str!("../../native/vesta_nvrtc.cpp");

/// Driver record format version.
pub const DRIVER_RECORD_VERSION: u32 = 1;

/// Configuration a driver binary was compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub version: u32,
    pub target_format: TargetFormat,
    pub toolchain_version: i32,
    /// `-DMAXIDGPU=..` and per-device limits.
    pub device_compile_flags: String,
}

impl DriverRecord {
    /// The record a driver built for `profile` carries.
    pub fn for_profile(profile: &ToolchainProfile) -> Self {
        Self {
            version: DRIVER_RECORD_VERSION,
            target_format: profile.target_format,
            toolchain_version: profile.toolchain_version,
            device_compile_flags: profile.device_compile_flags.clone(),
        }
    }
}

/// A bootstrap driver present on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapDriver {
    /// Path to the driver shared library.
    pub binary_path: PathBuf,

    /// Whether this call produced the binary.
    pub built: bool,
}

/// Builds the bootstrap driver on demand.
pub struct DriverBuilder {
    /// Build folder layout
    dirs: BuildDirs,

    /// Settings used to resolve the native toolchain
    settings: Settings,

    /// Report builds at info level
    pub(crate) verbose: bool,
}

impl DriverBuilder {
    /// Create a builder for a build folder.
    pub fn new(dirs: BuildDirs, settings: &Settings) -> Self {
        Self {
            dirs,
            settings: settings.clone(),
            verbose: settings.verbose,
        }
    }

    /// Path the driver is expected at.
    pub fn driver_path(&self) -> PathBuf {
        self.dirs.driver_path()
    }

    /// Whether a driver binary is present, whatever it was built for.
    pub fn is_built(&self) -> bool {
        self.driver_path().exists()
    }

    /// Record of the driver on disk, if it has a readable one.
    pub fn record(&self) -> Option<DriverRecord> {
        let path = self.dirs.driver_record_path();
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!("Unreadable driver record {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Whether the driver on disk was built for `profile`.
    pub fn is_current(&self, profile: &ToolchainProfile) -> bool {
        self.is_built() && self.record() == Some(DriverRecord::for_profile(profile))
    }

    /// Return the driver, compiling it first if it is missing or was built
    /// for another configuration.
    ///
    /// Concurrent callers, in this or other processes, serialize on an
    /// advisory lock; only the first one compiles.
    pub fn ensure_built(&self, profile: &ToolchainProfile) -> Result<BootstrapDriver> {
        let binary_path = self.driver_path();
        if self.is_current(profile) {
            return Ok(BootstrapDriver {
                binary_path,
                built: false,
            });
        }

        let _lock = BuildLock::acquire(&self.dirs.driver_lock_path())?;
        if self.is_current(profile) {
            tracing::debug!("Bootstrap driver built by another process");
            return Ok(BootstrapDriver {
                binary_path,
                built: false,
            });
        }

        if self.is_built() {
            progress!(
                self.verbose,
                "Bootstrap driver {} was built for another configuration, rebuilding",
                binary_path.display()
            );
        }
        self.remove_record()?;
        self.build(profile)?;

        let record = DriverRecord::for_profile(profile);
        let bytes =
            serde_json::to_vec_pretty(&record).map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(&self.dirs.driver_record_path(), &bytes)?;

        Ok(BootstrapDriver {
            binary_path,
            built: true,
        })
    }

    /// Delete the driver binary so the next request rebuilds it.
    pub fn remove(&self) -> Result<()> {
        self.remove_record()?;
        let path = self.driver_path();
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::cache_path(&path, e))?;
            tracing::debug!("Removed bootstrap driver {}", path.display());
        }
        Ok(())
    }

    fn remove_record(&self) -> Result<()> {
        let path = self.dirs.driver_record_path();
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::cache_path(&path, e))?;
        }
        Ok(())
    }

    /// Compile the driver. Caller must hold the driver lock.
    fn build(&self, profile: &ToolchainProfile) -> Result<()> {
        let toolchain = NativeToolchain::detect(&self.settings).map_err(|e| Error::DriverBuild {
            command: "<host compiler not resolved>".to_string(),
            message: e.to_string(),
        })?;

        progress!(
            self.verbose,
            "Compiling bootstrap driver for {} ({})...",
            profile.target_format,
            self.driver_path().display()
        );
        let start = Instant::now();

        let source_path = self.dirs.driver_source_path();
        fs::write(&source_path, DRIVER_SOURCE).map_err(|e| Error::cache_path(&source_path, e))?;

        let final_path = self.driver_path();
        let staging = temp_sibling(&final_path);
        let mut cmd = build_command(&toolchain, profile, &source_path, &staging);
        let command = render_command(&cmd);
        tracing::debug!("Driver build command: {}", command);

        let output = cmd.output().map_err(|e| Error::DriverBuild {
            command: command.clone(),
            message: format!("failed to run {}: {}", toolchain.cxx().display(), e),
        })?;

        let produced = fs::metadata(&staging).map(|m| m.len() > 0).unwrap_or(false);
        if !output.status.success() || !produced {
            let _ = fs::remove_file(&staging);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if !output.status.success() {
                format!("compiler exited with {}:\n{}", output.status, stderr.trim())
            } else {
                "compiler reported success but produced no library".to_string()
            };
            return Err(Error::DriverBuild { command, message });
        }

        fs::rename(&staging, &final_path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            Error::cache_path(&final_path, e)
        })?;

        progress!(
            self.verbose,
            "Bootstrap driver built in {} ms",
            start.elapsed().as_millis()
        );
        Ok(())
    }
}

/// Preprocessor defines selecting the NVRTC getters and architecture tag.
pub fn driver_defines(format: TargetFormat) -> Vec<String> {
    vec![
        format!("-DnvrtcGetTARGET={}", format.nvrtc_getter()),
        format!("-DnvrtcGetTARGETSize={}", format.nvrtc_size_getter()),
        format!("-DARCHTAG=\"{}\"", format.arch_tag()),
    ]
}

fn build_command(
    toolchain: &NativeToolchain,
    profile: &ToolchainProfile,
    source: &Path,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(toolchain.cxx());
    cmd.args(toolchain.shared_library_flags())
        .args(driver_defines(profile.target_format))
        .args(toolchain.include_flags())
        .args(profile.device_compile_flags.split_whitespace())
        .arg(source)
        .arg("-o")
        .arg(output)
        .args(toolchain.link_flags());
    cmd
}

fn render_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::DeviceProps;
    use tempfile::TempDir;

    fn profile(version: i32) -> ToolchainProfile {
        ToolchainProfile::new(
            version,
            vec![DeviceProps {
                max_threads_per_block: 1024,
                shared_mem_per_block: 49152,
            }],
        )
    }

    #[test]
    fn test_driver_defines_cubin() {
        let defines = driver_defines(TargetFormat::Cubin);
        assert_eq!(
            defines,
            vec![
                "-DnvrtcGetTARGET=nvrtcGetCUBIN",
                "-DnvrtcGetTARGETSize=nvrtcGetCUBINSize",
                "-DARCHTAG=\"sm\"",
            ]
        );
    }

    #[test]
    fn test_driver_defines_ptx() {
        let defines = driver_defines(TargetFormat::Ptx);
        assert!(defines.contains(&"-DnvrtcGetTARGET=nvrtcGetPTX".to_string()));
        assert!(defines.contains(&"-DARCHTAG=\"compute\"".to_string()));
    }

    #[test]
    fn test_embedded_source_uses_defines() {
        assert!(DRIVER_SOURCE.contains("nvrtcGetTARGET("));
        assert!(DRIVER_SOURCE.contains("nvrtcGetTARGETSize("));
        assert!(DRIVER_SOURCE.contains("extern \"C\" void Compile("));
    }

    fn write_record(dirs: &BuildDirs, record: &DriverRecord) {
        fs::write(
            dirs.driver_record_path(),
            serde_json::to_vec(record).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_record_follows_profile() {
        let cubin = DriverRecord::for_profile(&profile(12040));
        let ptx = DriverRecord::for_profile(&profile(11000));

        assert_eq!(cubin.target_format, TargetFormat::Cubin);
        assert_eq!(ptx.target_format, TargetFormat::Ptx);
        assert_ne!(cubin, ptx);
        assert!(cubin.device_compile_flags.contains("-DMAXIDGPU=0"));
    }

    #[test]
    fn test_existing_driver_is_reused() {
        let temp = TempDir::new().unwrap();
        let dirs = BuildDirs::new(temp.path()).unwrap();
        fs::write(dirs.driver_path(), b"driver").unwrap();
        write_record(&dirs, &DriverRecord::for_profile(&profile(12040)));

        // No compiler configured: reaching the build step would fail.
        let settings = Settings {
            cxx_compiler: Some(temp.path().join("missing-cxx")),
            ..Settings::default()
        };
        let builder = DriverBuilder::new(dirs.clone(), &settings);

        let driver = builder.ensure_built(&profile(12040)).expect("reuse");
        assert!(!driver.built);
        assert_eq!(driver.binary_path, dirs.driver_path());
        assert!(builder.is_current(&profile(12040)));
        assert!(!builder.is_current(&profile(11000)));
    }

    #[test]
    fn test_driver_without_record_is_stale() {
        let temp = TempDir::new().unwrap();
        let dirs = BuildDirs::new(temp.path()).unwrap();
        fs::write(dirs.driver_path(), b"driver").unwrap();

        let settings = Settings {
            cxx_compiler: Some(temp.path().join("missing-cxx")),
            ..Settings::default()
        };
        let builder = DriverBuilder::new(dirs.clone(), &settings);

        assert!(builder.is_built());
        assert!(!builder.is_current(&profile(12040)));
        let err = builder.ensure_built(&profile(12040)).unwrap_err();
        assert!(matches!(err, Error::DriverBuild { .. }));
    }

    #[cfg(unix)]
    mod fake_compiler {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script standing in for the C++ compiler.
        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-cxx");
            fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn succeeding(dir: &Path, log: &Path) -> PathBuf {
            write_script(
                dir,
                &format!(
                    r#"echo "$@" >> "{}"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
printf 'driver' > "$out"
"#,
                    log.display()
                ),
            )
        }

        fn settings_with(cxx: PathBuf, cuda_home: &Path) -> Settings {
            Settings {
                cxx_compiler: Some(cxx),
                cuda_home: Some(cuda_home.to_path_buf()),
                verbose: false,
                ..Settings::default()
            }
        }

        fn invocations(log: &Path) -> usize {
            fs::read_to_string(log)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        #[test]
        fn test_build_once_then_reuse() {
            let temp = TempDir::new().unwrap();
            let log = temp.path().join("cxx.log");
            let cxx = succeeding(temp.path(), &log);
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let builder = DriverBuilder::new(dirs.clone(), &settings_with(cxx, temp.path()));

            let first = builder.ensure_built(&profile(12040)).expect("build");
            assert!(first.built);
            assert!(dirs.driver_path().exists());
            assert!(dirs.driver_source_path().exists());

            let second = builder.ensure_built(&profile(12040)).expect("reuse");
            assert!(!second.built);
            assert_eq!(invocations(&log), 1);

            let args = fs::read_to_string(&log).unwrap();
            assert!(args.contains("-DnvrtcGetTARGET=nvrtcGetCUBIN"));
            assert!(args.contains("-DARCHTAG=\"sm\""));
            assert!(args.contains("-DMAXIDGPU=0"));
        }

        #[test]
        fn test_rebuild_after_removal() {
            let temp = TempDir::new().unwrap();
            let log = temp.path().join("cxx.log");
            let cxx = succeeding(temp.path(), &log);
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let builder = DriverBuilder::new(dirs.clone(), &settings_with(cxx, temp.path()));

            builder.ensure_built(&profile(11000)).expect("build");
            fs::remove_file(dirs.driver_path()).unwrap();

            let rebuilt = builder.ensure_built(&profile(11000)).expect("rebuild");
            assert!(rebuilt.built);
            assert_eq!(invocations(&log), 2);
            assert!(fs::read_to_string(&log).unwrap().contains("nvrtcGetPTX"));
        }

        #[test]
        fn test_failed_build_leaves_no_driver() {
            let temp = TempDir::new().unwrap();
            let cxx = write_script(
                temp.path(),
                r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
printf 'partial' > "$out"
echo "fatal error: nvrtc.h: No such file or directory" >&2
exit 1
"#,
            );
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let builder = DriverBuilder::new(dirs.clone(), &settings_with(cxx, temp.path()));

            let err = builder.ensure_built(&profile(12040)).unwrap_err();
            match err {
                Error::DriverBuild { command, message } => {
                    assert!(command.contains("fake-cxx"));
                    assert!(message.contains("nvrtc.h"));
                }
                other => panic!("expected DriverBuild, got {:?}", other),
            }

            assert!(!builder.is_built());
            let leftovers: Vec<_> = fs::read_dir(&dirs.root)
                .unwrap()
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
                .collect();
            assert!(leftovers.is_empty());
        }

        #[test]
        fn test_missing_compiler_is_a_driver_build_error() {
            let temp = TempDir::new().unwrap();
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let settings = settings_with(temp.path().join("no-such-cxx"), temp.path());
            let builder = DriverBuilder::new(dirs, &settings);

            let err = builder.ensure_built(&profile(12040)).unwrap_err();
            assert!(matches!(err, Error::DriverBuild { .. }));
            assert!(!builder.is_built());
        }

        #[test]
        fn test_format_change_rebuilds_driver() {
            let temp = TempDir::new().unwrap();
            let log = temp.path().join("cxx.log");
            let cxx = succeeding(temp.path(), &log);
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let settings = settings_with(cxx, temp.path());

            let ptx = DriverBuilder::new(dirs.clone(), &settings)
                .ensure_built(&profile(11000))
                .expect("ptx build");
            assert!(ptx.built);

            let builder = DriverBuilder::new(dirs.clone(), &settings);
            let cubin = builder.ensure_built(&profile(12040)).expect("cubin build");

            assert!(cubin.built);
            assert_eq!(invocations(&log), 2);
            let last = fs::read_to_string(&log).unwrap().lines().last().unwrap().to_string();
            assert!(last.contains("-DnvrtcGetTARGET=nvrtcGetCUBIN"));
            assert!(last.contains("-DARCHTAG=\"sm\""));
            assert_eq!(
                builder.record().map(|r| r.target_format),
                Some(TargetFormat::Cubin)
            );
        }

        #[test]
        fn test_device_change_rebuilds_driver() {
            let temp = TempDir::new().unwrap();
            let log = temp.path().join("cxx.log");
            let cxx = succeeding(temp.path(), &log);
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let builder = DriverBuilder::new(dirs, &settings_with(cxx, temp.path()));

            builder.ensure_built(&profile(12040)).expect("one device");
            let two_devices = ToolchainProfile::new(
                12040,
                vec![
                    DeviceProps {
                        max_threads_per_block: 1024,
                        shared_mem_per_block: 49152,
                    };
                    2
                ],
            );
            let rebuilt = builder.ensure_built(&two_devices).expect("two devices");

            assert!(rebuilt.built);
            assert_eq!(invocations(&log), 2);
            assert!(fs::read_to_string(&log).unwrap().contains("-DMAXIDGPU=1"));
            assert!(!builder.ensure_built(&two_devices).unwrap().built);
        }

        #[test]
        fn test_concurrent_callers_build_once() {
            let temp = TempDir::new().unwrap();
            let log = temp.path().join("cxx.log");
            let cxx = write_script(
                temp.path(),
                &format!(
                    r#"echo "$@" >> "{}"
sleep 0.3
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
printf 'driver' > "$out"
"#,
                    log.display()
                ),
            );
            let dirs = BuildDirs::new(temp.path().join("build")).unwrap();
            let settings = settings_with(cxx, temp.path());
            let profile = profile(12040);

            let built: Vec<bool> = std::thread::scope(|scope| {
                let workers: Vec<_> = (0..6)
                    .map(|_| {
                        let builder = DriverBuilder::new(dirs.clone(), &settings);
                        let profile = &profile;
                        scope.spawn(move || builder.ensure_built(profile).map(|d| d.built))
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|w| w.join().unwrap().unwrap())
                    .collect()
            });

            assert_eq!(invocations(&log), 1);
            assert_eq!(built.iter().filter(|b| **b).count(), 1);
            assert!(dirs.driver_path().exists());
        }
    }
}
