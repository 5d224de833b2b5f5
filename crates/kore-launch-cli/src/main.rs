use clap::Parser;
use serde::Serialize;

use kore_launch::config::{DriverConfig, LIBCUDA_PATH_ENV};
use kore_launch::{
    dispatch, marshal, CudaDriver, DryRunDriver, KernelHandle, LaunchGeometry, LaunchPath,
    RecordedLaunch, StreamHandle,
};

#[derive(Parser)]
#[command(
    name = "kore-launch",
    about = "Kore kernel launcher tools",
    long_about = "Inspect the installed CUDA driver and preview how a launch geometry is dispatched.\n\nThe plan command never touches a GPU: it runs the real dispatcher against a recording driver.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Locate the driver library and check cluster launch support
    Probe,
    /// Show which launch path and parameters a geometry produces
    Plan {
        /// Grid extents X,Y,Z (in clusters when --ctas > 1)
        #[arg(long, default_value = "1,1,1")]
        grid: String,
        /// Warps per block (block size is 32 * warps)
        #[arg(long, default_value = "4")]
        warps: i32,
        /// CTAs per cluster; 1 takes the simple launch path
        #[arg(long, default_value = "1")]
        ctas: i32,
        /// Cluster dimensions X,Y,Z (ignored when --ctas is 1)
        #[arg(long, default_value = "1,1,1")]
        cluster: String,
        /// Dynamic shared memory in bytes
        #[arg(long, default_value = "0")]
        shared: i32,
        /// Kernel arguments as unsigned integers (comma-separated)
        #[arg(long, default_value = "")]
        args: String,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Probe => cmd_probe(),
        Commands::Plan { grid, warps, ctas, cluster, shared, args, json } => {
            cmd_plan(&grid, warps, ctas, &cluster, shared, &args, json)
        }
    };

    if let Err(msg) = result {
        eprintln!("error: {}", msg);
        std::process::exit(1);
    }
}

fn cmd_probe() -> Result<(), String> {
    let config = DriverConfig::from_env();

    println!("Driver library");
    println!("  Name:     {}", config.library_name);
    match std::env::var(LIBCUDA_PATH_ENV) {
        Ok(dir) => println!("  Override: {}={}", LIBCUDA_PATH_ENV, dir),
        Err(_) => println!("  Override: (unset {})", LIBCUDA_PATH_ENV),
    }
    if config.library_dirs.is_empty() {
        println!("  Dirs:     (loader default search path)");
    } else {
        for dir in &config.library_dirs {
            println!("  Dir:      {}", dir.display());
        }
    }

    let driver = match CudaDriver::load(&config) {
        Ok(driver) => driver,
        Err(e) => {
            println!("\nDriver:  [ ] {}", e);
            return Ok(());
        }
    };
    println!("\nDriver:  [x] {}", driver.path().display());

    match driver.resolve_extended_launch() {
        Ok(_) => println!("Cluster: [x] cuLaunchKernelEx available"),
        Err(e) => println!("Cluster: [ ] {}", e),
    }
    Ok(())
}

fn parse_dim3(name: &str, s: &str) -> Result<(i32, i32, i32), String> {
    let parts: Vec<i32> = s
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("--{} {}: {}", name, s, e))?;
    match parts.as_slice() {
        [x] => Ok((*x, 1, 1)),
        [x, y] => Ok((*x, *y, 1)),
        [x, y, z] => Ok((*x, *y, *z)),
        _ => Err(format!("--{} expects 1 to 3 comma-separated values, got '{}'", name, s)),
    }
}

fn parse_args(s: &str) -> Result<Vec<u64>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u64>().map_err(|e| format!("--args {}: {}", p, e)))
        .collect()
}

#[derive(Serialize)]
struct Plan {
    geometry: LaunchGeometry,
    path: LaunchPath,
    launch: Option<RecordedLaunch>,
}

fn cmd_plan(
    grid: &str,
    warps: i32,
    ctas: i32,
    cluster: &str,
    shared: i32,
    args: &str,
    json: bool,
) -> Result<(), String> {
    let (gx, gy, gz) = parse_dim3("grid", grid)?;
    let (cx, cy, cz) = parse_dim3("cluster", cluster)?;
    let geometry = LaunchGeometry::default()
        .with_grid(gx, gy, gz)
        .with_warps(warps)
        .with_ctas(ctas)
        .with_cluster(cx, cy, cz)
        .with_shared_memory(shared);

    let buf = marshal(parse_args(args)?).map_err(|e| e.to_string())?;
    let driver = DryRunDriver::new();
    // SAFETY: the dry-run driver never dereferences the handles.
    let path = unsafe { dispatch(&driver, &geometry, KernelHandle(0), StreamHandle(0), &buf) }
        .map_err(|e| e.to_string())?;

    let plan = Plan {
        geometry,
        path,
        launch: driver.launches().into_iter().next(),
    };

    if json {
        let out = serde_json::to_string_pretty(&plan).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    println!("Path:    {:?}", plan.path);
    match &plan.launch {
        None => println!("  (empty grid, nothing launched)"),
        Some(RecordedLaunch::Simple { launch, args }) => {
            println!("  Entry:   cuLaunchKernel");
            println!("  Grid:    {:?}", launch.grid_dim);
            println!("  Block:   {:?}", launch.block_dim);
            println!("  Shared:  {} bytes", launch.shared_mem_bytes);
            println!("  Args:    {:?}", args);
        }
        Some(RecordedLaunch::Cluster { launch, args }) => {
            println!("  Entry:   cuLaunchKernelEx");
            println!("  Grid:    {:?} (blocks)", launch.grid_dim);
            println!("  Block:   {:?}", launch.block_dim);
            println!("  Cluster: {:?}", launch.cluster_dim);
            println!("  Policy:  {:?}", launch.scheduling_policy);
            println!("  Shared:  {} bytes", launch.shared_mem_bytes);
            println!("  Args:    {:?}", args);
        }
    }
    Ok(())
}
