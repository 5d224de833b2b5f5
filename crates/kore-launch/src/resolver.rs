//! Lazy resolution of the optional extended launch entry point.
//!
//! `cuLaunchKernelEx` only exists on drivers new enough to support thread
//! block clusters, so it is looked up by name on first use instead of being
//! required at load time. Each [`crate::CudaDriver`] caches its own lookup,
//! and the process-wide driver makes that cache process-wide.

use std::sync::OnceLock;

use libloading::Library;

use crate::config::DriverConfig;
use crate::error::{LaunchError, Result};
use crate::ffi::{self, FnCuLaunchKernelEx};

/// A value resolved at most once and read lock-free afterwards.
///
/// Failed resolutions are not cached; the next caller tries again. Callers
/// racing on the first resolution may each run the resolver, but only the
/// first published value is ever observed.
#[derive(Debug)]
pub struct LazySymbol<T> {
    cell: OnceLock<T>,
}

impl<T> LazySymbol<T> {
    pub const fn new() -> Self {
        Self { cell: OnceLock::new() }
    }

    /// The resolved value, if any.
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn get_or_resolve<E>(&self, resolve: impl FnOnce() -> std::result::Result<T, E>) -> std::result::Result<&T, E> {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }
        let value = resolve()?;
        Ok(self.cell.get_or_init(|| value))
    }
}

impl<T> Default for LazySymbol<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The extended launch entry point together with the library that owns it.
pub struct ExtendedLaunchApi {
    _lib: Library,
    pub cu_launch_kernel_ex: FnCuLaunchKernelEx,
}

impl ExtendedLaunchApi {
    pub fn load(config: &DriverConfig) -> Result<Self> {
        let (lib, path) = ffi::open_driver_library(config)?;
        let cu_launch_kernel_ex = unsafe {
            *lib.get::<FnCuLaunchKernelEx>(b"cuLaunchKernelEx\0")
                .map_err(|_| LaunchError::SymbolNotFound {
                    symbol: ffi::SYM_LAUNCH_KERNEL_EX.to_string(),
                    library: path.display().to_string(),
                })?
        };
        tracing::debug!("resolved {} from {}", ffi::SYM_LAUNCH_KERNEL_EX, path.display());
        Ok(Self { _lib: lib, cu_launch_kernel_ex })
    }
}
