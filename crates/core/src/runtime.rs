//! Locating the ONNX Runtime shared library and the GPU libraries its
//! execution providers depend on.
//!
//! `ort` is built with `load-dynamic`, so nothing is linked at build time.
//! [`setup_runtime_libs`] must run at the top of `main()`, before the
//! first session is created.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";
/// Extra library directory searched ahead of the defaults.
pub const LIB_DIR_ENV: &str = "UPSCALER_LIB_DIR";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    pub ort_dylib: Option<PathBuf>,
    /// `ORT_DYLIB_PATH` was already set by the user.
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
    pub searched: Vec<PathBuf>,
}

/// Probed in order: `$UPSCALER_LIB_DIR`, `<exe_dir>` (Windows),
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system lib
/// dirs on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(extra) = env::var_os(LIB_DIR_ENV).filter(|v| !v.is_empty()) {
        push(PathBuf::from(extra));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load order for the GPU libraries the CUDA and TensorRT providers need.
/// `None` means "leave it to ORT": provider libs need symbols from
/// `onnxruntime` itself, which is not loaded yet.
///
///   0: CUDA runtime and math libraries
///   1: cuDNN
///   2: TensorRT
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries to preload, sorted so dependencies come first. The first
/// directory holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Loads with `RTLD_GLOBAL` so later `dlopen` calls made by ORT resolve
/// against it; `LD_LIBRARY_PATH` changes after startup are ignored by glibc.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Points `ORT_DYLIB_PATH` at a bundled ONNX Runtime when the user has not
/// set it, and preloads any CUDA, cuDNN and TensorRT libraries found next
/// to it.
pub fn setup_runtime_libs() -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs();
    let mut status = RuntimeLibStatus {
        searched: dirs.clone(),
        ..Default::default()
    };

    match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => {
            status.ort_from_env = true;
            status.ort_dylib = Some(PathBuf::from(existing));
        }
        None => {
            if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
                env::set_var(ORT_DYLIB_ENV, &path);
                status.ort_dylib = Some(path);
            }
        }
    }

    for lib in preload_plan(&dirs) {
        if unsafe { load_library(&lib) } {
            status.preloaded.push(lib);
        }
    }
    status
}

pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match &status.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = status.ort_from_env,
            "ONNX Runtime library"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points at a missing file"
        ),
        None => warn!(
            searched = ?status.searched,
            "ONNX Runtime library not found; relying on the loader's default search path"
        ),
    }
    for lib in &status.preloaded {
        debug!(path = %lib.display(), "preloaded GPU runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib_once() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            let cwd_lib = cwd.join("lib");
            assert_eq!(dirs.iter().filter(|d| **d == cwd_lib).count(), 1);
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().expect("temp dir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");
        std::fs::write(second.join(ORT_LIB_NAME), b"").expect("second lib");
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );

        std::fs::write(first.join(ORT_LIB_NAME), b"").expect("first lib");
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second]),
            Some(first.join(ORT_LIB_NAME))
        );
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libpng16.so.16"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_sorts_by_priority_and_dedupes() {
        let temp = tempfile::tempdir().expect("temp dir");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).expect("dir a");
        std::fs::create_dir_all(&b).expect("dir b");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libonnxruntime.so"] {
            std::fs::write(a.join(name), b"").expect("lib in a");
        }
        std::fs::write(b.join("libcudart.so.12"), b"").expect("cudart in b");
        std::fs::write(b.join("libcudnn.so.9"), b"").expect("duplicate cudnn");

        let plan = preload_plan(&[a.clone(), b.clone()]);
        assert_eq!(
            plan,
            vec![
                b.join("libcudart.so.12"),
                a.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }
}
