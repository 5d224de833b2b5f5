//! # kore-launch
//!
//! Kernel launch dispatch for Kore's CUDA backend.
//!
//! Provides:
//! - Runtime-loaded driver entry points (no build-time CUDA toolkit)
//! - Argument marshaling into the driver's pointer-array convention
//! - Simple (`cuLaunchKernel`) and cluster (`cuLaunchKernelEx`) launch paths
//! - Lazy, process-wide resolution of the optional extended launch symbol
//! - A dry-run driver for previewing launches without a GPU

pub mod ffi;
pub mod config;
pub mod error;
pub mod resolver;
pub mod geometry;
pub mod signature;
pub mod args;
pub mod dispatch;
pub mod driver;
pub mod launcher;

pub use args::{marshal, ArgBuffer, IntoWord};
pub use config::DriverConfig;
pub use dispatch::{dispatch, KernelHandle, LaunchDescriptor, LaunchPath, SimpleLaunch, StreamHandle};
pub use driver::{CudaDriver, DryRunDriver, LaunchDriver, RecordedLaunch};
pub use error::{ErrorKind, HookedLaunchError, LaunchError, Result};
pub use geometry::LaunchGeometry;
pub use launcher::{launch, LaunchHooks, LaunchRequest, NoHooks};
pub use signature::{ArgType, HostValue, Scalar, Signature};
