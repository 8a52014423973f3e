//! The JIT context.
//!
//! A [`JitContext`] owns everything that lives for the duration of a
//! process: settings, the probed toolchain profile, the bootstrap driver,
//! the loaded driver module and the in-memory artifact handles. Callers
//! create one and pass it around explicitly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::compile::{
    ArtifactCache, BootstrapDriver, CompileJob, CompileRequest, CompiledArtifact, CudaProbe,
    DriverBuilder, DriverLoader, JitInvoker, NativeLoader, NativeToolchain, PlatformProbe,
    ToolchainProfile,
};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::paths::BuildDirs;
use crate::progress;
use crate::source::{Formula, SourceGenerator};

/// Options for [`JitContext::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Delete the bootstrap driver and build it again.
    pub rebuild_driver: bool,
}

/// Snapshot of a context, for display.
#[derive(Debug, Clone)]
pub struct JitStatus {
    pub build_folder: PathBuf,

    /// Probed profile, or the reason probing failed.
    pub profile: std::result::Result<ToolchainProfile, String>,

    pub driver_path: PathBuf,

    pub driver_built: bool,

    /// Artifact handles held in memory.
    pub cached_handles: usize,
}

/// Process-wide JIT state.
pub struct JitContext {
    settings: Settings,
    probe: Box<dyn PlatformProbe>,
    /// Probe result, computed on first use
    profile: OnceLock<std::result::Result<ToolchainProfile, String>>,
    driver: DriverBuilder,
    invoker: JitInvoker,
    cache: ArtifactCache,
}

impl JitContext {
    /// Create a context backed by the installed CUDA libraries.
    pub fn new(settings: Settings) -> Result<Self> {
        let probe = CudaProbe::new(settings.cuda_home.clone());
        Self::with_backends(settings, Box::new(probe), Box::new(NativeLoader))
    }

    /// Create a context with explicit probe and driver loader.
    pub fn with_backends(
        settings: Settings,
        probe: Box<dyn PlatformProbe>,
        loader: Box<dyn DriverLoader>,
    ) -> Result<Self> {
        let dirs = BuildDirs::new(&settings.build_folder)?;
        tracing::debug!("Using build folder {}", dirs.root.display());

        Ok(Self {
            driver: DriverBuilder::new(dirs.clone(), &settings),
            cache: ArtifactCache::new(dirs, settings.keep_sources, settings.verbose),
            invoker: JitInvoker::new(loader),
            profile: OnceLock::new(),
            probe,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The toolchain profile, probing the platform on first call.
    ///
    /// # Errors
    /// Returns [`Error::PlatformUnavailable`] if probing failed. The failure
    /// is remembered for the lifetime of the context.
    pub fn profile(&self) -> Result<&ToolchainProfile> {
        self.profile
            .get_or_init(|| {
                self.probe.probe().map_err(|e| match e {
                    Error::PlatformUnavailable(reason) => reason,
                    other => other.to_string(),
                })
            })
            .as_ref()
            .map_err(|reason| Error::PlatformUnavailable(reason.clone()))
    }

    /// Current build folder.
    pub fn build_folder(&self) -> &Path {
        &self.cache.dirs().root
    }

    /// Move to another build folder.
    ///
    /// Handles and the loaded driver module are dropped; later lookups only
    /// see the new folder. When a platform is available and the new folder
    /// has no driver built for it yet, one is built right away.
    pub fn set_build_folder(&mut self, folder: impl Into<PathBuf>) -> Result<()> {
        let dirs = BuildDirs::new(folder)?;
        progress!(
            self.settings.verbose,
            "Build folder set to {}",
            dirs.root.display()
        );

        self.settings.build_folder = dirs.root.clone();
        self.invoker.invalidate();
        self.cache.invalidate();
        self.driver = DriverBuilder::new(dirs.clone(), &self.settings);
        self.cache = ArtifactCache::new(dirs, self.settings.keep_sources, self.settings.verbose);

        if let Ok(profile) = self.profile()
            && !self.driver.is_current(profile)
        {
            self.ensure_driver()?;
        }
        Ok(())
    }

    /// Toggle progress reporting between info and debug level.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.settings.verbose = verbose;
        self.driver.verbose = verbose;
        self.cache.verbose = verbose;
    }

    /// Make sure the bootstrap driver exists, building it if needed.
    pub fn ensure_driver(&self) -> Result<BootstrapDriver> {
        let profile = self.profile()?;
        let driver = self.driver.ensure_built(profile)?;
        if driver.built {
            // A module loaded from a previous binary is stale.
            self.invoker.invalidate();
        }
        Ok(driver)
    }

    /// Return the artifact for `formula` on `device_id`, compiling it on a miss.
    ///
    /// `generator` is only called when nothing usable is cached.
    ///
    /// # Errors
    /// - [`Error::PlatformUnavailable`] without a usable device
    /// - [`Error::InvalidDevice`] if `device_id` is out of range
    /// - [`Error::DriverBuild`] if the bootstrap driver could not be built
    /// - [`Error::Compilation`] if no artifact was produced
    pub fn get_or_compile(
        &self,
        formula: &Formula,
        generator: &dyn SourceGenerator,
        device_id: u32,
    ) -> Result<Arc<CompiledArtifact>> {
        let profile = self.profile()?;
        if device_id as usize >= profile.device_count {
            return Err(Error::InvalidDevice {
                device_id,
                device_count: profile.device_count,
            });
        }

        let job = CompileJob {
            profile,
            formula,
            device_id,
            generator,
        };
        self.cache.get_or_compile(&job, |kernel, target| {
            let driver = self.ensure_driver()?;
            let request = CompileRequest {
                source_text: kernel.source.clone(),
                target_path: target.to_path_buf(),
                use_reduced_precision: formula.reduced_precision,
                device_id,
                include_path: self.include_path(formula.reduced_precision)?,
            };
            self.invoker.compile(&driver, &request)
        })
    }

    /// Directory holding `cuda_fp16.h`.
    ///
    /// Only required for half precision; otherwise a failed lookup yields
    /// an empty path.
    fn include_path(&self, reduced_precision: bool) -> Result<String> {
        match NativeToolchain::detect(&self.settings) {
            Ok(toolchain) => Ok(toolchain.fp16_include_path()),
            Err(e) if reduced_precision => Err(e),
            Err(_) => Ok(String::new()),
        }
    }

    /// Drop in-memory handles and the loaded module. Artifacts stay on disk.
    pub fn reset(&mut self, options: ResetOptions) -> Result<()> {
        self.cache.invalidate();
        self.invoker.invalidate();

        if options.rebuild_driver {
            self.driver.remove()?;
            self.rebuild_driver_if_possible()?;
        }
        Ok(())
    }

    /// Delete everything in the build folder, then optionally rebuild the driver.
    pub fn clean(&mut self, recompile_driver: bool) -> Result<()> {
        self.cache.invalidate();
        self.invoker.invalidate();

        progress!(
            self.settings.verbose,
            "Cleaning {}",
            self.build_folder().display()
        );
        self.cache.dirs().clean()?;

        if recompile_driver {
            self.rebuild_driver_if_possible()?;
        }
        Ok(())
    }

    fn rebuild_driver_if_possible(&self) -> Result<()> {
        match self.profile() {
            Ok(_) => self.ensure_driver().map(|_| ()),
            Err(e) => {
                tracing::warn!("Not rebuilding the bootstrap driver: {}", e);
                Ok(())
            }
        }
    }

    /// Describe the platform and the build folder.
    pub fn status(&self) -> JitStatus {
        JitStatus {
            build_folder: self.build_folder().to_path_buf(),
            profile: self.profile().cloned().map_err(|e| match e {
                Error::PlatformUnavailable(reason) => reason,
                other => other.to_string(),
            }),
            driver_path: self.driver.driver_path(),
            driver_built: self.driver.is_built(),
            cached_handles: self.cache.len(),
        }
    }
}
