//! Runtime-loaded CUDA driver entry points via dlopen.
//!
//! Only the handful of driver calls the launcher needs are mirrored here.
//! Loading at runtime keeps the crate free of a build-time CUDA toolkit and
//! lets the extended launch entry point be optional (older drivers lack it).

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::path::PathBuf;

use libloading::Library;

use crate::config::DriverConfig;
use crate::error::{LaunchError, Result};

// ---------------------------------------------------------------------------
// Well-known names
// ---------------------------------------------------------------------------

pub const LIBCUDA_NAME: &str = "libcuda.so";

pub const SYM_LAUNCH_KERNEL: &str = "cuLaunchKernel";
pub const SYM_LAUNCH_KERNEL_EX: &str = "cuLaunchKernelEx";
pub const SYM_GET_ERROR_STRING: &str = "cuGetErrorString";

// ---------------------------------------------------------------------------
// Status codes and enums
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub const CUDA_SUCCESS: CuResult = 0;

pub type CuLaunchAttributeId = c_uint;
pub const CU_LAUNCH_ATTRIBUTE_CLUSTER_DIMENSION: CuLaunchAttributeId = 4;
pub const CU_LAUNCH_ATTRIBUTE_CLUSTER_SCHEDULING_POLICY_PREFERENCE: CuLaunchAttributeId = 5;

pub type CuClusterSchedulingPolicy = c_uint;
pub const CU_CLUSTER_SCHEDULING_POLICY_SPREAD: CuClusterSchedulingPolicy = 1;

// Opaque handles
pub type CuFunction = *mut c_void;
pub type CuStream = *mut c_void;

// ---------------------------------------------------------------------------
// Launch config structs (CUDA >= 11.8 layout)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CuClusterDim {
    pub x: c_uint,
    pub y: c_uint,
    pub z: c_uint,
}

/// `CUlaunchAttributeValue`: a 64-byte union, 8-byte aligned in the C headers.
#[repr(C)]
#[derive(Clone, Copy)]
pub union CuLaunchAttributeValue {
    pub pad: [u64; 8],
    pub cluster_dim: CuClusterDim,
    pub cluster_scheduling_policy_preference: CuClusterSchedulingPolicy,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CuLaunchAttribute {
    pub id: CuLaunchAttributeId,
    pub pad: [c_char; 4],
    pub value: CuLaunchAttributeValue,
}

#[repr(C)]
#[derive(Debug)]
pub struct CuLaunchConfig {
    pub grid_dim_x: c_uint,
    pub grid_dim_y: c_uint,
    pub grid_dim_z: c_uint,
    pub block_dim_x: c_uint,
    pub block_dim_y: c_uint,
    pub block_dim_z: c_uint,
    pub shared_mem_bytes: c_uint,
    pub h_stream: CuStream,
    pub attrs: *mut CuLaunchAttribute,
    pub num_attrs: c_uint,
}

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

pub type FnCuLaunchKernel = unsafe extern "C" fn(
    CuFunction,
    c_uint, c_uint, c_uint,   // grid x, y, z
    c_uint, c_uint, c_uint,   // block x, y, z
    c_uint,                   // shared mem bytes
    CuStream,
    *mut *mut c_void,         // kernel params
    *mut *mut c_void,         // extra (null)
) -> CuResult;

pub type FnCuLaunchKernelEx = unsafe extern "C" fn(
    *const CuLaunchConfig,
    CuFunction,
    *mut *mut c_void,         // kernel params
    *mut *mut c_void,         // extra (null)
) -> CuResult;

pub type FnCuGetErrorString = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

/// Mandatory driver entry points. The `Library` is kept alive for as long as
/// the function pointers are reachable.
pub struct DriverApi {
    _lib: Library,
    pub path: PathBuf,
    pub cu_launch_kernel: FnCuLaunchKernel,
    pub cu_get_error_string: FnCuGetErrorString,
}

impl DriverApi {
    pub fn load(config: &DriverConfig) -> Result<Self> {
        let (lib, path) = open_driver_library(config)?;
        unsafe {
            let cu_launch_kernel = *lib
                .get::<FnCuLaunchKernel>(b"cuLaunchKernel\0")
                .map_err(|_| symbol_not_found(SYM_LAUNCH_KERNEL, &path))?;
            let cu_get_error_string = *lib
                .get::<FnCuGetErrorString>(b"cuGetErrorString\0")
                .map_err(|_| symbol_not_found(SYM_GET_ERROR_STRING, &path))?;
            Ok(DriverApi {
                _lib: lib,
                path,
                cu_launch_kernel,
                cu_get_error_string,
            })
        }
    }
}

impl std::fmt::Debug for DriverApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverApi").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Open the driver library, trying each configured candidate in order.
pub fn open_driver_library(config: &DriverConfig) -> Result<(Library, PathBuf)> {
    let mut last_reason = String::from("no candidate paths");
    for candidate in config.library_candidates() {
        match unsafe { Library::new(&candidate) } {
            Ok(lib) => {
                tracing::debug!("opened driver library {}", candidate.display());
                return Ok((lib, candidate));
            }
            Err(e) => {
                tracing::trace!("dlopen {} failed: {}", candidate.display(), e);
                last_reason = e.to_string();
            }
        }
    }
    tracing::warn!("could not open {}: {}", config.library_name, last_reason);
    Err(LaunchError::DriverLoad {
        library: config.library_name.clone(),
        reason: format!("{}\n{}", last_reason, config.load_hint()),
    })
}

fn symbol_not_found(symbol: &str, path: &std::path::Path) -> LaunchError {
    LaunchError::SymbolNotFound {
        symbol: symbol.to_string(),
        library: path.display().to_string(),
    }
}
