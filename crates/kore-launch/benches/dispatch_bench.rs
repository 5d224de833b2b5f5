//! Benchmark: host-side launch overhead (marshal + dispatch) against the dry-run driver.

use kore_launch::{dispatch, marshal, DryRunDriver, KernelHandle, LaunchGeometry, StreamHandle};
use std::time::Instant;

fn bench_marshal(nargs: usize, iters: usize) -> f64 {
    let values: Vec<u64> = (0..nargs as u64).collect();
    let start = Instant::now();
    for _ in 0..iters {
        let buf = marshal(values.iter().copied()).unwrap();
        std::hint::black_box(buf.param_ptr());
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_dispatch(geometry: &LaunchGeometry, nargs: usize, iters: usize) -> f64 {
    let values: Vec<u64> = (0..nargs as u64).collect();
    let start = Instant::now();
    for _ in 0..iters {
        // Fresh driver per batch so the recorder does not grow without bound.
        let driver = DryRunDriver::new();
        let buf = marshal(values.iter().copied()).unwrap();
        let path = unsafe { dispatch(&driver, geometry, KernelHandle(1), StreamHandle(0), &buf) };
        std::hint::black_box(path.unwrap());
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    println!("=== Kore Launch Overhead Benchmark ===\n");

    let iters = 100_000;
    println!("{:<10} {:>14} {:>16} {:>16}", "args", "marshal (ns)", "simple (ns)", "cluster (ns)");

    let simple = LaunchGeometry::default().with_grid(128, 1, 1).with_warps(4);
    let cluster = LaunchGeometry::default()
        .with_grid(64, 1, 1)
        .with_warps(8)
        .with_ctas(2)
        .with_cluster(2, 1, 1);

    for &nargs in &[0usize, 4, 16, 64] {
        let m = bench_marshal(nargs, iters);
        let s = bench_dispatch(&simple, nargs, iters);
        let c = bench_dispatch(&cluster, nargs, iters);
        println!("{:<10} {:>14.1} {:>16.1} {:>16.1}", nargs, m * 1e9, s * 1e9, c * 1e9);
    }
}
