//! Finding ONNX Runtime and its GPU dependencies at run time.
//!
//! `ort` is built with `load-dynamic`, so `libonnxruntime` is looked up when
//! the first session is created. When a GPU backend is selected, CUDA, cuDNN
//! and TensorRT libraries shipped next to the binary are opened up front with
//! global symbol visibility so the execution providers can bind to them.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// GPU runtime library families, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GpuLib {
    Cuda,
    Cudnn,
    TensorRt,
}

#[cfg(unix)]
const GPU_LIB_PREFIXES: &[(&str, GpuLib)] = &[
    ("libcudart", GpuLib::Cuda),
    ("libcublas", GpuLib::Cuda),
    ("libcufft", GpuLib::Cuda),
    ("libcurand", GpuLib::Cuda),
    ("libcudnn", GpuLib::Cudnn),
    ("libnvinfer", GpuLib::TensorRt),
    ("libnvonnxparser", GpuLib::TensorRt),
];

#[cfg(windows)]
const GPU_LIB_PREFIXES: &[(&str, GpuLib)] = &[
    ("cudart64_", GpuLib::Cuda),
    ("cublas", GpuLib::Cuda),
    ("cudnn64_", GpuLib::Cudnn),
    ("nvinfer", GpuLib::TensorRt),
    ("nvonnxparser", GpuLib::TensorRt),
];

impl GpuLib {
    /// ORT's own provider libraries are not matched: they need symbols from
    /// `libonnxruntime`, which is not loaded yet.
    fn classify(file_name: &str) -> Option<Self> {
        let lower = file_name.to_ascii_lowercase();
        if !is_shared_library(&lower) {
            return None;
        }
        GPU_LIB_PREFIXES
            .iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
            .map(|&(_, kind)| kind)
    }
}

#[cfg(unix)]
fn is_shared_library(lower_name: &str) -> bool {
    lower_name.contains(".so")
}

#[cfg(windows)]
fn is_shared_library(lower_name: &str) -> bool {
    lower_name.ends_with(".dll")
}

/// Ordered list of directories searched for runtime libraries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySearch {
    dirs: Vec<PathBuf>,
}

impl LibrarySearch {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// `<exe_dir>/lib`, `<exe_dir>/../lib` and `<cwd>/lib`, then the system
    /// library directories on Unix. Windows also searches `<exe_dir>`.
    pub fn from_environment() -> Self {
        let mut dirs = Vec::new();
        let exe_dir = env::current_exe()
            .and_then(|exe| exe.canonicalize())
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        if let Some(exe_dir) = exe_dir {
            if cfg!(windows) {
                dirs.push(exe_dir.clone());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(prefix) = exe_dir.parent() {
                dirs.push(prefix.join("lib"));
            }
        }
        if let Ok(cwd) = env::current_dir() {
            dirs.push(cwd.join("lib"));
        }
        if cfg!(unix) {
            dirs.push(PathBuf::from("/usr/local/lib"));
            dirs.push(PathBuf::from("/usr/lib"));
        }
        dirs.dedup();
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First directory holding `libonnxruntime`.
    pub fn onnxruntime(&self) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(ORT_LIB_NAME))
            .find(|path| path.is_file())
    }

    /// GPU libraries in load order. When a file name appears in several
    /// directories the earliest directory wins; symlinks are skipped so each
    /// soname is opened once.
    pub fn gpu_libraries(&self) -> Vec<PathBuf> {
        let mut found: BTreeMap<String, (GpuLib, PathBuf)> = BTreeMap::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for path in entries.flatten().map(|entry| entry.path()) {
                if path.is_symlink() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                if let Some(kind) = GpuLib::classify(name) {
                    found.entry(name.to_string()).or_insert((kind, path));
                }
            }
        }

        let mut ordered: Vec<_> = found.into_iter().collect();
        ordered.sort_by_key(|(name, (kind, _))| (*kind, name.clone()));
        ordered.into_iter().map(|(_, (_, path))| path).collect()
    }
}

/// What [`setup_runtime_libs`] did, logged once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub ort_dylib: Option<PathBuf>,
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Opens a library for the life of the process with global symbols.
///
/// glibc reads `LD_LIBRARY_PATH` once at startup, so GPU libraries are opened
/// by absolute path instead.
#[cfg(unix)]
fn preload(path: &Path) -> Result<(), libloading::Error> {
    // SAFETY: only CUDA/cuDNN/TensorRT runtimes are opened; their initialisers
    // have no preconditions on the host process.
    let library = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    }?;
    std::mem::forget(library);
    Ok(())
}

#[cfg(windows)]
fn preload(path: &Path) -> Result<(), libloading::Error> {
    // SAFETY: as above.
    let library = unsafe { libloading::Library::new(path) }?;
    std::mem::forget(library);
    Ok(())
}

/// Points `ort` at the discovered ONNX Runtime and, for GPU backends, preloads
/// the GPU runtimes. Must run before the first session is built.
pub fn setup_runtime_libs(preload_gpu_libs: bool) -> RuntimeLibReport {
    let search = LibrarySearch::from_environment();
    let mut report = RuntimeLibReport::default();

    if let Some(path) = env::var_os(ORT_DYLIB_ENV) {
        report.ort_dylib = Some(PathBuf::from(path));
        report.ort_from_env = true;
    } else if let Some(path) = search.onnxruntime() {
        env::set_var(ORT_DYLIB_ENV, &path);
        report.ort_dylib = Some(path);
    }

    if preload_gpu_libs {
        for path in search.gpu_libraries() {
            match preload(&path) {
                Ok(()) => report.preloaded.push(path),
                Err(error) => report.failed.push((path, error.to_string())),
            }
        }
    }
    report
}

pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = report.ort_from_env,
            "ONNX Runtime library"
        ),
        Some(path) => warn!(path = %path.display(), "{ORT_DYLIB_ENV} points to a missing file"),
        None => warn!("{ORT_DYLIB_ENV} not set; ORT will try default search paths"),
    }
    if !report.preloaded.is_empty() {
        info!(count = report.preloaded.len(), "Preloaded GPU runtime libraries");
    }
    for (path, error) in &report.failed {
        debug!(path = %path.display(), %error, "Could not preload GPU library");
    }
}
