//! JIT invoker.
//!
//! Loads the bootstrap driver with `libloading` and calls its `Compile`
//! entry point. The entry point reports nothing in-band: the artifact file
//! existing after the call is the only success signal.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use libc::{c_char, c_int};
use libloading::{Library, Symbol};

use crate::error::{Error, Result};
use crate::paths::temp_sibling;

use super::driver::BootstrapDriver;

/// Name of the exported entry point in the driver.
pub const ENTRY_SYMBOL: &[u8] = b"Compile";

/// `Compile(target_file, source, use_half, device_id, include_path)`.
pub type CompileEntryFn =
    unsafe extern "C" fn(*const c_char, *const c_char, c_int, c_int, *const c_char);

/// Inputs of one runtime compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// CUDA source of the kernel.
    pub source_text: String,

    /// Where the artifact must be written.
    pub target_path: PathBuf,

    /// Compile with half-precision support.
    pub use_reduced_precision: bool,

    /// Device whose architecture is targeted.
    pub device_id: u32,

    /// Directory containing `cuda_fp16.h`, with a trailing separator.
    pub include_path: String,
}

/// A loaded runtime compiler.
pub trait KernelCompiler: Send + Sync {
    /// Compile `request.source_text`, writing the artifact to `request.target_path`.
    ///
    /// Returning `Ok` says nothing about success; callers check the file.
    fn compile(&self, request: &CompileRequest) -> Result<()>;
}

/// Loads a [`KernelCompiler`] from a bootstrap driver.
pub trait DriverLoader: Send + Sync {
    fn load(&self, driver: &BootstrapDriver) -> Result<Arc<dyn KernelCompiler>>;
}

/// Loader opening the driver as a native shared library.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLoader;

impl DriverLoader for NativeLoader {
    fn load(&self, driver: &BootstrapDriver) -> Result<Arc<dyn KernelCompiler>> {
        Ok(Arc::new(NativeDriver::open(&driver.binary_path)?))
    }
}

/// The driver library and its resolved entry point.
pub struct NativeDriver {
    entry: CompileEntryFn,
    /// Serializes calls into the driver
    gate: Mutex<()>,
    path: PathBuf,
    // Must outlive `entry`
    _library: Library,
}

impl NativeDriver {
    /// Load the driver at `path` and resolve its entry point.
    pub fn open(path: &Path) -> Result<Self> {
        // SAFETY: the driver is our own library with no global constructors.
        let library = unsafe { Library::new(path)? };
        // SAFETY: the symbol is declared with exactly this signature in vesta_nvrtc.cpp.
        let entry: CompileEntryFn = unsafe {
            let symbol: Symbol<CompileEntryFn> = library.get(ENTRY_SYMBOL)?;
            *symbol
        };

        tracing::debug!("Loaded bootstrap driver {}", path.display());
        Ok(Self {
            entry,
            gate: Mutex::new(()),
            path: path.to_path_buf(),
            _library: library,
        })
    }

    /// Path the driver was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KernelCompiler for NativeDriver {
    fn compile(&self, request: &CompileRequest) -> Result<()> {
        let target = path_c_string(&request.target_path)?;
        let source = c_string(&request.source_text, "kernel source")?;
        let include = c_string(&request.include_path, "include path")?;

        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: all pointers are valid NUL-terminated strings for the duration of the call.
        unsafe {
            (self.entry)(
                target.as_ptr(),
                source.as_ptr(),
                c_int::from(request.use_reduced_precision),
                request.device_id as c_int,
                include.as_ptr(),
            );
        }
        Ok(())
    }
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::Compilation {
        fingerprint: None,
        message: format!("{} contains an interior NUL byte", what),
    })
}

/// Pass the path bytes through unchanged; the driver opens them with `fopen`.
#[cfg(unix)]
fn path_c_string(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Compilation {
        fingerprint: None,
        message: "target path contains an interior NUL byte".to_string(),
    })
}

#[cfg(not(unix))]
fn path_c_string(path: &Path) -> Result<CString> {
    let text = path
        .to_str()
        .ok_or_else(|| Error::cache_path(path, "path is not valid UTF-8"))?;
    c_string(text, "target path")
}

/// Lazily loads the driver once and runs compilations through it.
pub struct JitInvoker {
    loader: Box<dyn DriverLoader>,
    module: Mutex<Option<Arc<dyn KernelCompiler>>>,
}

impl JitInvoker {
    /// Create an invoker using `loader` to open the driver.
    pub fn new(loader: Box<dyn DriverLoader>) -> Self {
        Self {
            loader,
            module: Mutex::new(None),
        }
    }

    /// Whether a driver module is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.module
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop the loaded module; the next compile reloads it.
    pub fn invalidate(&self) {
        let mut module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        if module.take().is_some() {
            tracing::debug!("Unloaded bootstrap driver module");
        }
    }

    /// Get the loaded module, loading it on first use.
    fn module(&self, driver: &BootstrapDriver) -> Result<Arc<dyn KernelCompiler>> {
        let mut module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(loaded) = module.as_ref() {
            return Ok(Arc::clone(loaded));
        }
        let loaded = self.loader.load(driver)?;
        *module = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Run one compilation.
    ///
    /// The driver writes to a temporary sibling of `request.target_path`,
    /// which is renamed into place only if a non-empty file was produced.
    /// A half-written artifact can therefore never appear at the target path.
    pub fn compile(&self, driver: &BootstrapDriver, request: &CompileRequest) -> Result<()> {
        let module = self.module(driver)?;

        let staging = temp_sibling(&request.target_path);
        let staged = CompileRequest {
            target_path: staging.clone(),
            ..request.clone()
        };

        let called = module.compile(&staged);
        let produced = fs::metadata(&staging).map(|m| m.len() > 0).unwrap_or(false);
        if let Err(e) = called {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        if !produced {
            let _ = fs::remove_file(&staging);
            return Err(Error::Compilation {
                fingerprint: request
                    .target_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
                message: format!(
                    "runtime compiler produced no artifact for device {} (see the driver's stderr)",
                    request.device_id
                ),
            });
        }

        fs::rename(&staging, &request.target_path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            Error::cache_path(&request.target_path, e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Compiler that writes the source text as the artifact, or nothing.
    struct EchoCompiler {
        calls: Arc<AtomicUsize>,
        produce: bool,
    }

    impl KernelCompiler for EchoCompiler {
        fn compile(&self, request: &CompileRequest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.produce {
                fs::write(&request.target_path, &request.source_text)?;
            }
            Ok(())
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
        produce: bool,
    }

    impl DriverLoader for CountingLoader {
        fn load(&self, _driver: &BootstrapDriver) -> Result<Arc<dyn KernelCompiler>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoCompiler {
                calls: Arc::clone(&self.calls),
                produce: self.produce,
            }))
        }
    }

    fn setup(produce: bool) -> (JitInvoker, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let invoker = JitInvoker::new(Box::new(CountingLoader {
            loads: Arc::clone(&loads),
            calls: Arc::clone(&calls),
            produce,
        }));
        (invoker, loads, calls)
    }

    fn driver(dir: &Path) -> BootstrapDriver {
        BootstrapDriver {
            binary_path: dir.join("libvesta_nvrtc.so"),
            built: false,
        }
    }

    fn request(dir: &Path) -> CompileRequest {
        CompileRequest {
            source_text: "extern \"C\" __global__ void k() {}".to_string(),
            target_path: dir.join("cubin_0011223344556677"),
            use_reduced_precision: false,
            device_id: 0,
            include_path: "/usr/local/cuda/include/".to_string(),
        }
    }

    #[test]
    fn test_compile_places_artifact() {
        let temp = TempDir::new().unwrap();
        let (invoker, _, calls) = setup(true);
        let request = request(temp.path());

        invoker.compile(&driver(temp.path()), &request).expect("compile");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fs::read_to_string(&request.target_path).unwrap(),
            request.source_text
        );
    }

    #[test]
    fn test_missing_output_is_compilation_error() {
        let temp = TempDir::new().unwrap();
        let (invoker, _, _) = setup(false);
        let request = request(temp.path());

        let err = invoker.compile(&driver(temp.path()), &request).unwrap_err();
        match err {
            Error::Compilation { fingerprint, .. } => {
                assert_eq!(fingerprint.as_deref(), Some("cubin_0011223344556677"));
            }
            other => panic!("expected Compilation, got {:?}", other),
        }
        assert!(!request.target_path.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_module_loaded_once_until_invalidated() {
        let temp = TempDir::new().unwrap();
        let (invoker, loads, _) = setup(true);
        let driver = driver(temp.path());

        assert!(!invoker.is_loaded());
        invoker.compile(&driver, &request(temp.path())).unwrap();
        invoker.compile(&driver, &request(temp.path())).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(invoker.is_loaded());

        invoker.invalidate();
        assert!(!invoker.is_loaded());
        invoker.compile(&driver, &request(temp.path())).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_native_loader_reports_missing_library() {
        let temp = TempDir::new().unwrap();
        let result = NativeLoader.load(&driver(temp.path()));
        assert!(matches!(result, Err(Error::LibraryLoad(_))));
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        assert!(c_string("ok", "source").is_ok());
        assert!(matches!(
            c_string("bad\0source", "source"),
            Err(Error::Compilation { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_target_path_is_passed_verbatim() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new("/tmp").join(OsStr::from_bytes(b"cubin_\xff\xfe"));
        let encoded = path_c_string(&path).expect("non-UTF-8 path");
        assert_eq!(encoded.as_bytes(), b"/tmp/cubin_\xff\xfe");

        let nul = Path::new(OsStr::from_bytes(b"bad\0path"));
        assert!(matches!(
            path_c_string(nul),
            Err(Error::Compilation { .. })
        ));
    }
}
