//! Launch dispatch: pick the simple or cluster launch path and issue it.
//!
//! A launch with one CTA per cluster goes through `cuLaunchKernel`. Anything
//! larger needs `cuLaunchKernelEx` with an explicit cluster-dimension
//! attribute; the two entry points take incompatible parameters, so the
//! choice is made exactly once, on `num_ctas`.

use std::ffi::c_uint;

use serde::{Deserialize, Serialize};

use crate::args::ArgBuffer;
use crate::driver::LaunchDriver;
use crate::error::{LaunchError, Result};
use crate::ffi::{
    self, CuClusterDim, CuFunction, CuLaunchAttribute, CuLaunchAttributeValue, CuLaunchConfig,
    CuResult, CuStream, CUDA_SUCCESS,
};
use crate::geometry::LaunchGeometry;

/// Opaque `CUfunction` handle, carried as an integer by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KernelHandle(pub u64);

impl KernelHandle {
    pub fn as_raw(self) -> CuFunction {
        self.0 as usize as CuFunction
    }
}

/// Opaque `CUstream` handle; 0 is the legacy default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    pub fn as_raw(self) -> CuStream {
        self.0 as usize as CuStream
    }
}

/// Parameters of a plain `cuLaunchKernel` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleLaunch {
    pub kernel: KernelHandle,
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub stream: StreamHandle,
}

/// How the hardware places the clusters of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterSchedulingPolicy {
    /// Distribute clusters across the device rather than packing them.
    Spread,
}

impl ClusterSchedulingPolicy {
    pub fn as_raw(self) -> ffi::CuClusterSchedulingPolicy {
        match self {
            ClusterSchedulingPolicy::Spread => ffi::CU_CLUSTER_SCHEDULING_POLICY_SPREAD,
        }
    }
}

/// Parameters of a `cuLaunchKernelEx` cluster launch. Built per call and
/// never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    pub kernel: KernelHandle,
    /// Full grid extent in blocks (cluster count times cluster shape).
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub stream: StreamHandle,
    pub cluster_dim: (u32, u32, u32),
    pub scheduling_policy: ClusterSchedulingPolicy,
}

impl LaunchDescriptor {
    /// The cluster-dimension and scheduling-policy attributes, in that order.
    pub fn attributes(&self) -> [CuLaunchAttribute; 2] {
        let mut cluster = CuLaunchAttributeValue { pad: [0; 8] };
        cluster.cluster_dim = CuClusterDim {
            x: self.cluster_dim.0,
            y: self.cluster_dim.1,
            z: self.cluster_dim.2,
        };

        let mut policy = CuLaunchAttributeValue { pad: [0; 8] };
        policy.cluster_scheduling_policy_preference = self.scheduling_policy.as_raw();

        [
            CuLaunchAttribute {
                id: ffi::CU_LAUNCH_ATTRIBUTE_CLUSTER_DIMENSION,
                pad: [0; 4],
                value: cluster,
            },
            CuLaunchAttribute {
                id: ffi::CU_LAUNCH_ATTRIBUTE_CLUSTER_SCHEDULING_POLICY_PREFERENCE,
                pad: [0; 4],
                value: policy,
            },
        ]
    }

    /// Lend a raw `CUlaunchConfig` for the duration of `f`. The config points
    /// at attribute storage that is freed when `f` returns.
    pub fn with_raw_config<R>(&self, f: impl FnOnce(&CuLaunchConfig) -> R) -> R {
        let mut attrs = self.attributes();
        let config = CuLaunchConfig {
            grid_dim_x: self.grid_dim.0,
            grid_dim_y: self.grid_dim.1,
            grid_dim_z: self.grid_dim.2,
            block_dim_x: self.block_dim.0,
            block_dim_y: self.block_dim.1,
            block_dim_z: self.block_dim.2,
            shared_mem_bytes: self.shared_mem_bytes,
            h_stream: self.stream.as_raw(),
            attrs: attrs.as_mut_ptr(),
            num_attrs: attrs.len() as c_uint,
        };
        f(&config)
    }
}

/// Which path a dispatch took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaunchPath {
    /// Empty grid; no driver call was made.
    Skipped,
    Simple,
    Cluster,
}

/// Build the plain launch for `geometry`. Cluster dimensions are not read.
pub fn simple_launch(
    geometry: &LaunchGeometry,
    kernel: KernelHandle,
    stream: StreamHandle,
) -> Result<SimpleLaunch> {
    Ok(SimpleLaunch {
        kernel,
        grid_dim: geometry.grid_dim()?,
        block_dim: geometry.block_dim()?,
        shared_mem_bytes: geometry.shared_mem_bytes()?,
        stream,
    })
}

/// Build the cluster launch for `geometry`; the requested grid counts whole
/// clusters and is expanded to blocks here.
pub fn cluster_launch(
    geometry: &LaunchGeometry,
    kernel: KernelHandle,
    stream: StreamHandle,
) -> Result<LaunchDescriptor> {
    Ok(LaunchDescriptor {
        kernel,
        grid_dim: geometry.cluster_grid_dim()?,
        block_dim: geometry.block_dim()?,
        shared_mem_bytes: geometry.shared_mem_bytes()?,
        stream,
        cluster_dim: geometry.cluster_dim()?,
        scheduling_policy: ClusterSchedulingPolicy::Spread,
    })
}

/// Enqueue one kernel launch on `stream`.
///
/// Returns once the launch is enqueued, not once the kernel finishes. Driver
/// failures are returned as [`LaunchError::Launch`] and never retried.
///
/// # Safety
/// `kernel` and `stream` must be live handles in the current driver context,
/// and `args` must match the kernel's parameter list. Pointer arguments must
/// reference device memory valid for the kernel's lifetime.
pub unsafe fn dispatch<D: LaunchDriver + ?Sized>(
    driver: &D,
    geometry: &LaunchGeometry,
    kernel: KernelHandle,
    stream: StreamHandle,
    args: &ArgBuffer,
) -> Result<LaunchPath> {
    if geometry.is_empty() {
        tracing::trace!("empty grid {:?}, skipping launch", (geometry.grid_x, geometry.grid_y, geometry.grid_z));
        return Ok(LaunchPath::Skipped);
    }

    if geometry.uses_cluster()? {
        let launch = cluster_launch(geometry, kernel, stream)?;
        tracing::debug!(
            "cluster launch grid={:?} block={:?} cluster={:?} smem={} args={}",
            launch.grid_dim, launch.block_dim, launch.cluster_dim, launch.shared_mem_bytes, args.len()
        );
        let code = driver.launch_kernel_ex(&launch, args)?;
        check(driver, code)?;
        Ok(LaunchPath::Cluster)
    } else {
        let launch = simple_launch(geometry, kernel, stream)?;
        tracing::debug!(
            "launch grid={:?} block={:?} smem={} args={}",
            launch.grid_dim, launch.block_dim, launch.shared_mem_bytes, args.len()
        );
        let code = driver.launch_kernel(&launch, args);
        check(driver, code)?;
        Ok(LaunchPath::Simple)
    }
}

fn check<D: LaunchDriver + ?Sized>(driver: &D, code: CuResult) -> Result<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(LaunchError::Launch { code, message: driver.error_string(code) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::marshal;
    use crate::driver::{DryRunDriver, RecordedLaunch};
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    const KERNEL: KernelHandle = KernelHandle(0x5000);
    const STREAM: StreamHandle = StreamHandle(0x6000);

    fn run(driver: &DryRunDriver, geometry: &LaunchGeometry, args: &ArgBuffer) -> Result<LaunchPath> {
        unsafe { dispatch(driver, geometry, KERNEL, STREAM, args) }
    }

    #[test]
    fn test_simple_path_scenario() {
        let driver = DryRunDriver::new();
        let geometry = LaunchGeometry::default().with_grid(1, 1, 1).with_warps(4);
        let args = marshal(Vec::<u64>::new()).unwrap();

        assert_eq!(run(&driver, &geometry, &args).unwrap(), LaunchPath::Simple);

        let launches = driver.launches();
        assert_eq!(launches.len(), 1);
        match &launches[0] {
            RecordedLaunch::Simple { launch, args } => {
                assert_eq!(launch.grid_dim, (1, 1, 1));
                assert_eq!(launch.block_dim, (128, 1, 1));
                assert_eq!(launch.shared_mem_bytes, 0);
                assert_eq!(launch.kernel, KERNEL);
                assert_eq!(launch.stream, STREAM);
                assert!(args.is_empty());
            }
            other => panic!("expected simple launch, got {:?}", other),
        }
    }

    #[test]
    fn test_cluster_path_scenario() {
        let driver = DryRunDriver::new();
        let geometry = LaunchGeometry::default()
            .with_grid(2, 2, 1)
            .with_warps(8)
            .with_ctas(4)
            .with_cluster(2, 2, 1)
            .with_shared_memory(1024);
        let args = marshal([7u64]).unwrap();

        assert_eq!(run(&driver, &geometry, &args).unwrap(), LaunchPath::Cluster);

        match &driver.launches()[0] {
            RecordedLaunch::Cluster { launch, args } => {
                assert_eq!(launch.grid_dim, (4, 4, 1));
                assert_eq!(launch.block_dim, (256, 1, 1));
                assert_eq!(launch.cluster_dim, (2, 2, 1));
                assert_eq!(launch.shared_mem_bytes, 1024);
                assert_eq!(launch.scheduling_policy, ClusterSchedulingPolicy::Spread);
                assert_eq!(launch.scheduling_policy.as_raw(), ffi::CU_CLUSTER_SCHEDULING_POLICY_SPREAD);
                assert_eq!(args, &vec![7u64]);
            }
            other => panic!("expected cluster launch, got {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_attributes() {
        let geometry = LaunchGeometry::default().with_ctas(2).with_cluster(2, 1, 1);
        let launch = cluster_launch(&geometry, KERNEL, STREAM).unwrap();
        let attrs = launch.attributes();
        assert_eq!(attrs[0].id, ffi::CU_LAUNCH_ATTRIBUTE_CLUSTER_DIMENSION);
        assert_eq!(unsafe { attrs[0].value.cluster_dim }, CuClusterDim { x: 2, y: 1, z: 1 });
        assert_eq!(attrs[1].id, ffi::CU_LAUNCH_ATTRIBUTE_CLUSTER_SCHEDULING_POLICY_PREFERENCE);
        assert_eq!(
            unsafe { attrs[1].value.cluster_scheduling_policy_preference },
            ffi::CU_CLUSTER_SCHEDULING_POLICY_SPREAD
        );

        launch.with_raw_config(|cfg| {
            assert_eq!((cfg.grid_dim_x, cfg.grid_dim_y, cfg.grid_dim_z), (2, 1, 1));
            assert_eq!(cfg.block_dim_x, 128);
            assert_eq!(cfg.num_attrs, 2);
            assert_eq!(cfg.h_stream, STREAM.as_raw());
            let attrs = unsafe { std::slice::from_raw_parts(cfg.attrs, cfg.num_attrs as usize) };
            assert_eq!(attrs[0].id, ffi::CU_LAUNCH_ATTRIBUTE_CLUSTER_DIMENSION);
        });
    }

    #[test]
    fn test_missing_extended_symbol_only_breaks_cluster_path() {
        let driver = DryRunDriver::without_extended_launch();
        let args = marshal([1u64]).unwrap();

        let cluster = LaunchGeometry::default().with_ctas(2).with_cluster(2, 1, 1);
        let err = run(&driver, &cluster, &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SymbolNotFound);

        let simple = LaunchGeometry::default();
        assert_eq!(run(&driver, &simple, &args).unwrap(), LaunchPath::Simple);
        assert_eq!(driver.launches().len(), 1);
    }

    #[test]
    fn test_driver_failure_is_reported_with_tag() {
        let driver = DryRunDriver::failing_with(701);
        let args = marshal(Vec::<u64>::new()).unwrap();
        let err = run(&driver, &LaunchGeometry::default(), &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Launch);
        assert!(err.to_string().starts_with(crate::error::ERROR_TAG));
        assert!(matches!(err, LaunchError::Launch { code: 701, .. }));

        let cluster = LaunchGeometry::default().with_ctas(2).with_cluster(1, 2, 1);
        let err = run(&driver, &cluster, &args).unwrap_err();
        assert!(matches!(err, LaunchError::Launch { code: 701, .. }));
    }

    #[test]
    fn test_extended_symbol_resolved_once() {
        let driver = DryRunDriver::new();
        let args = marshal(Vec::<u64>::new()).unwrap();
        let cluster = LaunchGeometry::default().with_ctas(2).with_cluster(2, 1, 1);
        for _ in 0..3 {
            run(&driver, &cluster, &args).unwrap();
        }
        assert_eq!(driver.extended_lookups(), 1);
    }

    #[test]
    fn test_invalid_geometry_makes_no_driver_call() {
        let driver = DryRunDriver::new();
        let args = marshal(Vec::<u64>::new()).unwrap();
        let err = run(&driver, &LaunchGeometry::default().with_warps(0), &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidGeometry);
        assert_eq!(driver.call_count(), 0);
    }

    fn small_dim() -> impl Strategy<Value = i32> {
        0i32..64
    }

    proptest! {
        #[test]
        fn prop_empty_grid_never_calls_driver(
            x in small_dim(), y in small_dim(), ctas in 1i32..8, warps in 1i32..32,
            zero_axis in 0usize..3,
        ) {
            let mut dims = [x, y, 1];
            dims[zero_axis] = 0;
            let driver = DryRunDriver::new();
            let geometry = LaunchGeometry::default()
                .with_grid(dims[0], dims[1], dims[2])
                .with_ctas(ctas)
                .with_warps(warps)
                .with_cluster(2, 1, 1);
            let args = marshal(Vec::<u64>::new()).unwrap();
            prop_assert_eq!(run(&driver, &geometry, &args).unwrap(), LaunchPath::Skipped);
            prop_assert_eq!(driver.call_count(), 0);
        }

        #[test]
        fn prop_single_cta_always_simple(
            x in 1i32..64, y in 1i32..64, z in 1i32..4,
            cx in -4i32..8, cy in -4i32..8, cz in -4i32..8,
        ) {
            let driver = DryRunDriver::without_extended_launch();
            let geometry = LaunchGeometry::default()
                .with_grid(x, y, z)
                .with_ctas(1)
                .with_cluster(cx, cy, cz);
            let args = marshal(Vec::<u64>::new()).unwrap();
            prop_assert_eq!(run(&driver, &geometry, &args).unwrap(), LaunchPath::Simple);
            let launches = driver.launches();
            let is_simple = matches!(&launches[0], RecordedLaunch::Simple { launch, .. } if launch.grid_dim == (x as u32, y as u32, z as u32));
            prop_assert!(is_simple);
        }

        #[test]
        fn prop_cluster_grid_is_expanded(
            x in 1i32..64, y in 1i32..64, z in 1i32..4,
            cx in 1i32..4, cy in 1i32..4, cz in 1i32..4, ctas in 2i32..16,
        ) {
            let driver = DryRunDriver::new();
            let geometry = LaunchGeometry::default()
                .with_grid(x, y, z)
                .with_ctas(ctas)
                .with_cluster(cx, cy, cz);
            let args = marshal(Vec::<u64>::new()).unwrap();
            prop_assert_eq!(run(&driver, &geometry, &args).unwrap(), LaunchPath::Cluster);
            let launches = driver.launches();
            let expanded = matches!(
                &launches[0],
                RecordedLaunch::Cluster { launch, .. }
                    if launch.grid_dim == ((x * cx) as u32, (y * cy) as u32, (z * cz) as u32)
                        && launch.cluster_dim == (cx as u32, cy as u32, cz as u32)
            );
            prop_assert!(expanded);
        }
    }
}
