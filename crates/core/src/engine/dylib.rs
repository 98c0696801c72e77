//! Native engine loaded at runtime from a shared library.
//!
//! The library exports a small C ABI:
//!
//! ```text
//! int64_t cugan_init(const char *model_root, const char *model_dir,
//!                    int32_t denoise, int32_t scale, int32_t sync_gap,
//!                    uint8_t tta, int32_t gpu_id);
//! int32_t cugan_process(int64_t handle, const uint8_t *data, size_t len,
//!                       uint8_t **out, size_t *out_len);
//! void    cugan_free_buffer(uint8_t *buf, size_t len);
//! void    cugan_release(int64_t handle);
//! uint8_t cugan_is_reentrant(void);           /* optional */
//! ```

use std::env;
use std::ffi::{c_char, CString};
use std::path::{Path, PathBuf};
use std::ptr;

use anyhow::{anyhow, bail, Context, Result};
use libloading::Library;
use tracing::{debug, info, warn};

use super::{EngineHandle, EngineInitParams, InferenceEngine, STATUS_INVALID_ARGUMENT};

pub const ENGINE_LIB_ENV: &str = "CUGAN_ENGINE_LIB";

#[cfg(all(unix, not(target_os = "macos")))]
const ENGINE_LIB_NAME: &str = "libcugan_engine.so";
#[cfg(target_os = "macos")]
const ENGINE_LIB_NAME: &str = "libcugan_engine.dylib";
#[cfg(windows)]
const ENGINE_LIB_NAME: &str = "cugan_engine.dll";

type InitFn = unsafe extern "C" fn(*const c_char, *const c_char, i32, i32, i32, u8, i32) -> i64;
type ProcessFn = unsafe extern "C" fn(i64, *const u8, usize, *mut *mut u8, *mut usize) -> i32;
type FreeBufferFn = unsafe extern "C" fn(*mut u8, usize);
type ReleaseFn = unsafe extern "C" fn(i64);
type IsReentrantFn = unsafe extern "C" fn() -> u8;

/// Search directories for the engine library, in probe order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_engine_lib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ENGINE_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Resolves the engine library: `explicit` path, then `$CUGAN_ENGINE_LIB`,
/// then the standard search directories.
pub fn locate_engine_library(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("engine library not found: {}", path.display());
    }

    if let Some(from_env) = env::var_os(ENGINE_LIB_ENV) {
        let path = PathBuf::from(from_env);
        if path.is_file() {
            return Ok(path);
        }
        warn!(
            "{ENGINE_LIB_ENV} set to {} but file not found; searching default locations",
            path.display()
        );
    }

    let dirs = candidate_lib_dirs();
    find_engine_lib_in_dirs(&dirs).ok_or_else(|| {
        anyhow!(
            "{ENGINE_LIB_NAME} not found in any of: {}",
            dirs.iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })
}

pub struct DylibEngine {
    init_fn: InitFn,
    process_fn: ProcessFn,
    free_buffer_fn: FreeBufferFn,
    release_fn: ReleaseFn,
    reentrant: bool,
    // Keeps the symbols above valid; must outlive every call through them.
    _library: Library,
}

impl DylibEngine {
    pub fn load(path: &Path) -> Result<Self> {
        let library = unsafe { Library::new(path) }
            .with_context(|| format!("failed to load engine library {}", path.display()))?;

        let init_fn: InitFn = unsafe { symbol(&library, b"cugan_init\0") }?;
        let process_fn: ProcessFn = unsafe { symbol(&library, b"cugan_process\0") }?;
        let free_buffer_fn: FreeBufferFn = unsafe { symbol(&library, b"cugan_free_buffer\0") }?;
        let release_fn: ReleaseFn = unsafe { symbol(&library, b"cugan_release\0") }?;
        let reentrant = match unsafe { symbol::<IsReentrantFn>(&library, b"cugan_is_reentrant\0") } {
            Ok(is_reentrant) => unsafe { is_reentrant() != 0 },
            Err(_) => false,
        };

        info!(path = %path.display(), reentrant, "Loaded engine library");
        Ok(Self {
            init_fn,
            process_fn,
            free_buffer_fn,
            release_fn,
            reentrant,
            _library: library,
        })
    }

    /// [`locate_engine_library`] followed by [`DylibEngine::load`].
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let path = locate_engine_library(explicit)?;
        Self::load(&path)
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    let sym = library.get::<T>(name).with_context(|| {
        format!(
            "engine library is missing symbol {}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        )
    })?;
    Ok(*sym)
}

fn path_to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.to_str()?).ok()
}

impl InferenceEngine for DylibEngine {
    fn name(&self) -> &str {
        "dylib"
    }

    fn init(&self, params: &EngineInitParams) -> i64 {
        let (Some(root), Ok(dir)) = (
            path_to_cstring(&params.model_root),
            CString::new(params.model_dir.as_str()),
        ) else {
            warn!(root = %params.model_root.display(), "model path is not representable for the engine");
            return STATUS_INVALID_ARGUMENT;
        };

        let status = unsafe {
            (self.init_fn)(
                root.as_ptr(),
                dir.as_ptr(),
                params.denoise,
                params.scale,
                params.sync_gap,
                u8::from(params.augment),
                params.device,
            )
        };
        debug!(status, model = %params.model_dir, "cugan_init returned");
        status
    }

    fn compute(&self, handle: EngineHandle, image: &[u8]) -> Result<Vec<u8>> {
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        let rc = unsafe {
            (self.process_fn)(
                handle.raw(),
                image.as_ptr(),
                image.len(),
                &mut out,
                &mut out_len,
            )
        };

        if rc != 0 {
            if !out.is_null() {
                unsafe { (self.free_buffer_fn)(out, out_len) };
            }
            bail!("cugan_process failed with code {rc}");
        }
        if out.is_null() {
            bail!("cugan_process returned no output buffer");
        }

        let pixels = unsafe { std::slice::from_raw_parts(out, out_len) }.to_vec();
        unsafe { (self.free_buffer_fn)(out, out_len) };
        Ok(pixels)
    }

    fn dispose(&self, handle: EngineHandle) {
        unsafe { (self.release_fn)(handle.raw()) };
        debug!(%handle, "cugan_release called");
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}
