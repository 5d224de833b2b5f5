//! Launch geometry as supplied by the kernel caller.

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};

/// Threads per warp.
pub const WARP_SIZE: u32 = 32;

/// Grid, block and cluster shape of one launch.
///
/// Field types follow the caller's calling convention (signed 32-bit); the
/// accessors below convert to the driver's unsigned extents and reject values
/// the driver cannot represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub grid_x: i32,
    pub grid_y: i32,
    pub grid_z: i32,
    pub num_warps: i32,
    pub num_ctas: i32,
    pub cluster_dim_x: i32,
    pub cluster_dim_y: i32,
    pub cluster_dim_z: i32,
    pub shared_memory_bytes: i32,
}

impl Default for LaunchGeometry {
    fn default() -> Self {
        Self {
            grid_x: 1,
            grid_y: 1,
            grid_z: 1,
            num_warps: 4,
            num_ctas: 1,
            cluster_dim_x: 1,
            cluster_dim_y: 1,
            cluster_dim_z: 1,
            shared_memory_bytes: 0,
        }
    }
}

impl LaunchGeometry {
    pub fn with_grid(mut self, x: i32, y: i32, z: i32) -> Self {
        self.grid_x = x;
        self.grid_y = y;
        self.grid_z = z;
        self
    }

    pub fn with_warps(mut self, num_warps: i32) -> Self {
        self.num_warps = num_warps;
        self
    }

    pub fn with_ctas(mut self, num_ctas: i32) -> Self {
        self.num_ctas = num_ctas;
        self
    }

    pub fn with_cluster(mut self, x: i32, y: i32, z: i32) -> Self {
        self.cluster_dim_x = x;
        self.cluster_dim_y = y;
        self.cluster_dim_z = z;
        self
    }

    pub fn with_shared_memory(mut self, bytes: i32) -> Self {
        self.shared_memory_bytes = bytes;
        self
    }

    /// Number of blocks (or clusters) requested, computed without overflow.
    pub fn grid_volume(&self) -> i64 {
        self.grid_x as i64 * self.grid_y as i64 * self.grid_z as i64
    }

    /// An empty grid launches nothing.
    pub fn is_empty(&self) -> bool {
        self.grid_volume() == 0
    }

    /// Whether the launch needs the cluster path.
    ///
    /// `num_ctas` is the sole discriminator: cluster dimensions are ignored
    /// when it equals 1.
    pub fn uses_cluster(&self) -> Result<bool> {
        match self.num_ctas {
            1 => Ok(false),
            n if n > 1 => Ok(true),
            n => Err(LaunchError::InvalidGeometry(format!("num_ctas must be >= 1, got {}", n))),
        }
    }

    pub fn grid_dim(&self) -> Result<(u32, u32, u32)> {
        Ok((
            extent("grid_x", self.grid_x)?,
            extent("grid_y", self.grid_y)?,
            extent("grid_z", self.grid_z)?,
        ))
    }

    /// `(32 * num_warps, 1, 1)`.
    pub fn block_dim(&self) -> Result<(u32, u32, u32)> {
        if self.num_warps <= 0 {
            return Err(LaunchError::InvalidGeometry(format!(
                "num_warps must be > 0, got {}",
                self.num_warps
            )));
        }
        let threads = (self.num_warps as u32).checked_mul(WARP_SIZE).ok_or_else(|| {
            LaunchError::InvalidGeometry(format!("{} warps overflow the block size", self.num_warps))
        })?;
        Ok((threads, 1, 1))
    }

    pub fn cluster_dim(&self) -> Result<(u32, u32, u32)> {
        Ok((
            cluster_extent("cluster_dim_x", self.cluster_dim_x)?,
            cluster_extent("cluster_dim_y", self.cluster_dim_y)?,
            cluster_extent("cluster_dim_z", self.cluster_dim_z)?,
        ))
    }

    /// Grid extents in blocks when the grid is expressed in whole clusters.
    pub fn cluster_grid_dim(&self) -> Result<(u32, u32, u32)> {
        let (gx, gy, gz) = self.grid_dim()?;
        let (cx, cy, cz) = self.cluster_dim()?;
        let mul = |axis: &str, g: u32, c: u32| {
            g.checked_mul(c).ok_or_else(|| {
                LaunchError::InvalidGeometry(format!("{} of {} clusters of {} overflows", axis, g, c))
            })
        };
        Ok((mul("grid_x", gx, cx)?, mul("grid_y", gy, cy)?, mul("grid_z", gz, cz)?))
    }

    pub fn shared_mem_bytes(&self) -> Result<u32> {
        extent("shared_memory_bytes", self.shared_memory_bytes)
    }
}

fn extent(name: &str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| LaunchError::InvalidGeometry(format!("{} must be >= 0, got {}", name, value)))
}

fn cluster_extent(name: &str, value: i32) -> Result<u32> {
    match value {
        v if v >= 1 => Ok(v as u32),
        v => Err(LaunchError::InvalidGeometry(format!("{} must be >= 1, got {}", name, v))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_is_warps_times_32() {
        let geom = LaunchGeometry::default().with_warps(8);
        assert_eq!(geom.block_dim().unwrap(), (256, 1, 1));
    }

    #[test]
    fn test_empty_grid() {
        assert!(LaunchGeometry::default().with_grid(0, 4, 4).is_empty());
        assert!(LaunchGeometry::default().with_grid(4, 4, 0).is_empty());
        assert!(!LaunchGeometry::default().is_empty());
    }

    #[test]
    fn test_grid_volume_does_not_overflow() {
        let geom = LaunchGeometry::default().with_grid(i32::MAX, i32::MAX, 2);
        assert_eq!(geom.grid_volume(), i32::MAX as i64 * i32::MAX as i64 * 2);
    }

    #[test]
    fn test_single_cta_ignores_cluster_dims() {
        let geom = LaunchGeometry::default().with_ctas(1).with_cluster(-3, 0, 9);
        assert!(!geom.uses_cluster().unwrap());
    }

    #[test]
    fn test_cluster_grid_expansion() {
        let geom = LaunchGeometry::default()
            .with_grid(2, 3, 1)
            .with_ctas(4)
            .with_cluster(2, 2, 1);
        assert!(geom.uses_cluster().unwrap());
        assert_eq!(geom.cluster_grid_dim().unwrap(), (4, 6, 1));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(LaunchGeometry::default().with_warps(0).block_dim().is_err());
        assert!(LaunchGeometry::default().with_ctas(0).uses_cluster().is_err());
        assert!(LaunchGeometry::default().with_grid(-1, 1, 1).grid_dim().is_err());
        assert!(LaunchGeometry::default().with_cluster(0, 1, 1).cluster_dim().is_err());
        assert!(LaunchGeometry::default().with_shared_memory(-1).shared_mem_bytes().is_err());
        assert!(LaunchGeometry::default()
            .with_grid(i32::MAX, 1, 1)
            .with_cluster(4, 1, 1)
            .cluster_grid_dim()
            .is_err());
    }
}
