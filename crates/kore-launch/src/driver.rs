//! Driver backends the dispatcher can launch through.

use std::ffi::{c_char, CStr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::args::ArgBuffer;
use crate::config::DriverConfig;
use crate::dispatch::{LaunchDescriptor, SimpleLaunch};
use crate::error::{LaunchError, Result};
use crate::ffi::{self, CuResult, DriverApi, CUDA_SUCCESS};
use crate::resolver::{ExtendedLaunchApi, LazySymbol};

/// The device-side entry points a launch needs.
pub trait LaunchDriver {
    /// Issue a plain launch and return the raw driver status.
    ///
    /// # Safety
    /// The handles in `launch` must be live in the current driver context and
    /// `args` must match the kernel's parameter list.
    unsafe fn launch_kernel(&self, launch: &SimpleLaunch, args: &ArgBuffer) -> CuResult;

    /// Issue a cluster launch. Fails before touching the device if the
    /// extended entry point is unavailable.
    ///
    /// # Safety
    /// Same contract as [`LaunchDriver::launch_kernel`].
    unsafe fn launch_kernel_ex(&self, launch: &LaunchDescriptor, args: &ArgBuffer) -> Result<CuResult>;

    /// Human-readable text for a driver status code.
    fn error_string(&self, code: CuResult) -> String;
}

/// The installed CUDA driver, loaded with `dlopen`.
pub struct CudaDriver {
    api: DriverApi,
    // Pinned to the library `api` came from so the extended entry point is
    // looked up in the same driver.
    extended_config: DriverConfig,
    extended: LazySymbol<ExtendedLaunchApi>,
}

static GLOBAL_DRIVER: LazySymbol<CudaDriver> = LazySymbol::new();

impl CudaDriver {
    pub fn load(config: &DriverConfig) -> Result<Self> {
        let api = DriverApi::load(config)?;
        tracing::debug!("loaded CUDA driver from {}", api.path.display());
        let extended_config = DriverConfig {
            library_name: api.path.display().to_string(),
            library_dirs: Vec::new(),
        };
        Ok(Self { api, extended_config, extended: LazySymbol::new() })
    }

    /// Process-wide driver, located from the environment on first use.
    pub fn global() -> Result<&'static CudaDriver> {
        GLOBAL_DRIVER.get_or_resolve(|| Self::load(&DriverConfig::from_env()))
    }

    /// Path of the loaded driver library.
    pub fn path(&self) -> &Path {
        &self.api.path
    }

    /// Resolve `cuLaunchKernelEx` from this driver's library on first use,
    /// reporting why it is missing. Only a successful lookup is cached.
    pub fn resolve_extended_launch(&self) -> Result<&ExtendedLaunchApi> {
        self.extended.get_or_resolve(|| ExtendedLaunchApi::load(&self.extended_config))
    }
}

impl std::fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDriver").field("path", &self.api.path).finish()
    }
}

impl LaunchDriver for CudaDriver {
    unsafe fn launch_kernel(&self, launch: &SimpleLaunch, args: &ArgBuffer) -> CuResult {
        (self.api.cu_launch_kernel)(
            launch.kernel.as_raw(),
            launch.grid_dim.0,
            launch.grid_dim.1,
            launch.grid_dim.2,
            launch.block_dim.0,
            launch.block_dim.1,
            launch.block_dim.2,
            launch.shared_mem_bytes,
            launch.stream.as_raw(),
            args.param_ptr(),
            std::ptr::null_mut(), // extra
        )
    }

    unsafe fn launch_kernel_ex(&self, launch: &LaunchDescriptor, args: &ArgBuffer) -> Result<CuResult> {
        let ext = self.resolve_extended_launch()?;
        Ok(launch.with_raw_config(|config| {
            (ext.cu_launch_kernel_ex)(config, launch.kernel.as_raw(), args.param_ptr(), std::ptr::null_mut())
        }))
    }

    fn error_string(&self, code: CuResult) -> String {
        let mut text: *const c_char = std::ptr::null();
        let rc = unsafe { (self.api.cu_get_error_string)(code, &mut text) };
        if rc != CUDA_SUCCESS || text.is_null() {
            return format!("unrecognized error code {}", code);
        }
        unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
    }
}

/// A launch captured by [`DryRunDriver`]. `args` are read back through the
/// pointer view, exactly as the device would see them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum RecordedLaunch {
    Simple { launch: SimpleLaunch, args: Vec<u64> },
    Cluster { launch: LaunchDescriptor, args: Vec<u64> },
}

/// A driver that records launches instead of issuing them.
///
/// Used to preview dispatch decisions without a GPU, and to exercise the
/// dispatcher against drivers without `cuLaunchKernelEx` or with failing
/// launches.
#[derive(Debug, Default)]
pub struct DryRunDriver {
    extended_unsupported: bool,
    fail_with: Option<CuResult>,
    extended: LazySymbol<()>,
    extended_lookups: AtomicUsize,
    calls: AtomicUsize,
    launches: Mutex<Vec<RecordedLaunch>>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like a driver too old to export `cuLaunchKernelEx`.
    pub fn without_extended_launch() -> Self {
        Self { extended_unsupported: true, ..Self::default() }
    }

    /// Fail every launch with the given driver status.
    pub fn failing_with(code: CuResult) -> Self {
        Self { fail_with: Some(code), ..Self::default() }
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.launches.lock().clone()
    }

    /// Driver calls made, successful or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// How many times the extended entry point was looked up.
    pub fn extended_lookups(&self) -> usize {
        self.extended_lookups.load(Ordering::SeqCst)
    }

    fn status(&self) -> CuResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fail_with.unwrap_or(CUDA_SUCCESS)
    }
}

fn read_back(args: &ArgBuffer) -> Vec<u64> {
    // SAFETY: every pointer targets a word owned by `args`.
    args.ptrs().iter().map(|&p| unsafe { *(p as *const u64) }).collect()
}

impl LaunchDriver for DryRunDriver {
    unsafe fn launch_kernel(&self, launch: &SimpleLaunch, args: &ArgBuffer) -> CuResult {
        let status = self.status();
        if status == CUDA_SUCCESS {
            self.launches.lock().push(RecordedLaunch::Simple { launch: *launch, args: read_back(args) });
        }
        status
    }

    unsafe fn launch_kernel_ex(&self, launch: &LaunchDescriptor, args: &ArgBuffer) -> Result<CuResult> {
        self.extended.get_or_resolve(|| {
            self.extended_lookups.fetch_add(1, Ordering::SeqCst);
            if self.extended_unsupported {
                Err(LaunchError::SymbolNotFound {
                    symbol: ffi::SYM_LAUNCH_KERNEL_EX.to_string(),
                    library: ffi::LIBCUDA_NAME.to_string(),
                })
            } else {
                Ok(())
            }
        })?;
        let status = self.status();
        if status == CUDA_SUCCESS {
            self.launches.lock().push(RecordedLaunch::Cluster { launch: *launch, args: read_back(args) });
        }
        Ok(status)
    }

    fn error_string(&self, code: CuResult) -> String {
        format!("dry-run launch failed with status {}", code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::marshal;
    use crate::dispatch::{KernelHandle, StreamHandle};

    fn simple() -> SimpleLaunch {
        SimpleLaunch {
            kernel: KernelHandle(1),
            grid_dim: (1, 1, 1),
            block_dim: (32, 1, 1),
            shared_mem_bytes: 0,
            stream: StreamHandle(0),
        }
    }

    #[test]
    fn test_dry_run_reads_args_through_pointers() {
        let driver = DryRunDriver::new();
        let args = marshal([9u64, 8, 7]).unwrap();
        let status = unsafe { driver.launch_kernel(&simple(), &args) };
        assert_eq!(status, CUDA_SUCCESS);
        assert_eq!(
            driver.launches(),
            vec![RecordedLaunch::Simple { launch: simple(), args: vec![9, 8, 7] }]
        );
    }

    #[test]
    fn test_dry_run_failure_records_nothing() {
        let driver = DryRunDriver::failing_with(2);
        let args = marshal(Vec::<u64>::new()).unwrap();
        assert_eq!(unsafe { driver.launch_kernel(&simple(), &args) }, 2);
        assert!(driver.launches().is_empty());
        assert_eq!(driver.call_count(), 1);
    }

    #[test]
    fn test_unsupported_extended_lookup_is_retried() {
        let driver = DryRunDriver::without_extended_launch();
        let args = marshal(Vec::<u64>::new()).unwrap();
        let desc = crate::dispatch::cluster_launch(
            &crate::geometry::LaunchGeometry::default().with_ctas(2).with_cluster(2, 1, 1),
            KernelHandle(1),
            StreamHandle(0),
        )
        .unwrap();
        for _ in 0..2 {
            assert!(unsafe { driver.launch_kernel_ex(&desc, &args) }.is_err());
        }
        assert_eq!(driver.extended_lookups(), 2);
        assert_eq!(driver.call_count(), 0);
    }

    #[test]
    fn test_recorded_launch_serializes_with_path_tag() {
        let rec = RecordedLaunch::Simple { launch: simple(), args: vec![] };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["path"], "simple");
    }
}
