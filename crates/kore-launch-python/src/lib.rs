//! # kore-launch-python
//!
//! PyO3 bindings for kore-launch → `import kore_launcher` in Python.
//!
//! Provides:
//! - `kore_launcher.launch(...)`: launch a loaded kernel with untyped 64-bit arguments
//! - `kore_launcher.Launcher(signature)`: same call shape, arguments checked against a signature
//! - `kore_launcher.extended_launch_supported()`: whether the driver can launch clusters

use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyFloat, PyTuple};

use kore_launch::{
    launch, ArgType, CudaDriver, DryRunDriver, ErrorKind, HookedLaunchError, HostValue, KernelHandle, LaunchError,
    LaunchGeometry, LaunchHooks, LaunchRequest, Scalar, Signature, StreamHandle,
};

/// gridX, gridY, gridZ, num_warps, num_ctas, clusterDimX, clusterDimY,
/// clusterDimZ, shared_memory, stream, function, enter_hook, exit_hook,
/// compiled_kernel, args
const LAUNCH_ARITY: usize = 15;

fn to_py_err(e: LaunchError) -> PyErr {
    match e.kind() {
        ErrorKind::ArgumentConversion => PyTypeError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

// ============================================================================
// Call parsing
// ============================================================================

struct LaunchCall<'py> {
    geometry: LaunchGeometry,
    kernel: KernelHandle,
    stream: StreamHandle,
    enter_hook: Option<Bound<'py, PyAny>>,
    exit_hook: Option<Bound<'py, PyAny>>,
    kernel_args: Bound<'py, PyTuple>,
}

fn parse_call<'py>(args: &Bound<'py, PyTuple>) -> PyResult<LaunchCall<'py>> {
    if args.len() != LAUNCH_ARITY {
        return Err(PyTypeError::new_err(format!(
            "launch() takes {} positional arguments ({} given)",
            LAUNCH_ARITY,
            args.len()
        )));
    }
    let int = |i: usize| -> PyResult<i32> { args.get_item(i)?.extract() };
    let handle = |i: usize| -> PyResult<u64> { args.get_item(i)?.extract() };
    let hook = |i: usize| -> PyResult<Option<Bound<'py, PyAny>>> {
        let obj = args.get_item(i)?;
        Ok(if obj.is_none() { None } else { Some(obj) })
    };

    let geometry = LaunchGeometry {
        grid_x: int(0)?,
        grid_y: int(1)?,
        grid_z: int(2)?,
        num_warps: int(3)?,
        num_ctas: int(4)?,
        cluster_dim_x: int(5)?,
        cluster_dim_y: int(6)?,
        cluster_dim_z: int(7)?,
        shared_memory_bytes: int(8)?,
    };

    Ok(LaunchCall {
        geometry,
        stream: StreamHandle(handle(9)?),
        kernel: KernelHandle(handle(10)?),
        enter_hook: hook(11)?,
        exit_hook: hook(12)?,
        // Slot 13 carries the compiled kernel object; it is only passed on to hooks.
        kernel_args: args.get_item(14)?.downcast_into::<PyTuple>()?,
    })
}

/// Untyped arguments: every value must fit an unsigned 64-bit word.
fn untyped_args(kernel_args: &Bound<'_, PyTuple>) -> PyResult<Vec<Scalar>> {
    kernel_args
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.extract::<u64>().map(Scalar::U64).map_err(|e| {
                to_py_err(LaunchError::ArgumentConversion { index, reason: e.to_string() })
            })
        })
        .collect()
}

fn host_value(item: &Bound<'_, PyAny>, ty: ArgType) -> PyResult<HostValue> {
    if item.is_none() {
        return Ok(HostValue::None);
    }
    if item.is_instance_of::<PyFloat>() {
        return Ok(HostValue::Float(item.extract()?));
    }
    if ty == ArgType::Ptr && item.hasattr("data_ptr")? {
        return Ok(HostValue::Ptr(item.call_method0("data_ptr")?.extract()?));
    }
    Ok(HostValue::Int(item.extract()?))
}

fn typed_args(kernel_args: &Bound<'_, PyTuple>, signature: &Signature) -> PyResult<Vec<Scalar>> {
    let values = kernel_args
        .iter()
        .zip(signature.types().iter().copied().chain(std::iter::repeat(ArgType::U64)))
        .enumerate()
        .map(|(index, (item, ty))| {
            host_value(&item, ty).map_err(|e| {
                to_py_err(LaunchError::ArgumentConversion { index, reason: e.to_string() })
            })
        })
        .collect::<PyResult<Vec<HostValue>>>()?;
    signature.encode(&values).map_err(to_py_err)
}

// ============================================================================
// Hooks
// ============================================================================

/// Python callables around the device call. Hooks receive the launch's full
/// positional argument tuple; the GIL is released while the driver runs.
struct PyHooks<'py> {
    py: Python<'py>,
    enter: Option<Bound<'py, PyAny>>,
    exit: Option<Bound<'py, PyAny>>,
    call_args: Bound<'py, PyTuple>,
}

impl LaunchHooks for PyHooks<'_> {
    type Error = PyErr;

    fn enter(&mut self) -> PyResult<()> {
        if let Some(hook) = &self.enter {
            hook.call1(self.call_args.clone())?;
        }
        Ok(())
    }

    fn exit(&mut self) -> PyResult<()> {
        if let Some(hook) = &self.exit {
            hook.call1(self.call_args.clone())?;
        }
        Ok(())
    }

    fn blocking<R, F>(&mut self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.py.allow_threads(f)
    }
}

fn run_launch(
    py: Python<'_>,
    call_args: &Bound<'_, PyTuple>,
    signature: Option<&Signature>,
) -> PyResult<()> {
    let call = parse_call(call_args)?;
    let scalars = match signature {
        Some(sig) => typed_args(&call.kernel_args, sig)?,
        None => untyped_args(&call.kernel_args)?,
    };
    let request = LaunchRequest {
        geometry: call.geometry,
        kernel: call.kernel,
        stream: call.stream,
        args: scalars,
    };
    let mut hooks = PyHooks {
        py,
        enter: call.enter_hook,
        exit: call.exit_hook,
        call_args: call_args.clone(),
    };

    // SAFETY: kernel and stream handles come from the caller's own driver
    // objects; the caller vouches that the arguments match the kernel.
    let outcome = if request.geometry.is_empty() {
        // Empty grids are skipped before any driver call, so no driver has to
        // be installed for them. Hooks and argument checks still run.
        unsafe { launch(&DryRunDriver::new(), &request, &mut hooks) }
    } else {
        let driver = CudaDriver::global().map_err(to_py_err)?;
        unsafe { launch(driver, &request, &mut hooks) }
    };
    match outcome {
        Ok(_) => Ok(()),
        Err(HookedLaunchError::Hook(e)) => Err(e),
        Err(HookedLaunchError::Launch(e)) => Err(to_py_err(e)),
    }
}

// ============================================================================
// Python API
// ============================================================================

/// Entry point for all kernels: arguments are passed as unsigned 64-bit words.
#[pyfunction]
#[pyo3(name = "launch", signature = (*args))]
fn launch_kernel(py: Python<'_>, args: &Bound<'_, PyTuple>) -> PyResult<()> {
    run_launch(py, args, None)
}

/// Whether the installed driver exports the cluster launch entry point.
#[pyfunction]
fn extended_launch_supported() -> bool {
    CudaDriver::global()
        .and_then(|driver| driver.resolve_extended_launch())
        .is_ok()
}

/// A launcher bound to one kernel signature, e.g. `Launcher(["*fp32", "i32"])`.
#[pyclass(name = "Launcher", frozen)]
struct PyLauncher {
    signature: Signature,
}

#[pymethods]
impl PyLauncher {
    #[new]
    fn new(signature: Vec<String>) -> PyResult<Self> {
        let signature = Signature::parse(&signature).map_err(PyValueError::new_err)?;
        Ok(Self { signature })
    }

    /// Parameter types as strings.
    #[getter]
    fn signature(&self) -> Vec<String> {
        self.signature.types().iter().map(|t| t.to_string()).collect()
    }

    #[pyo3(signature = (*args))]
    fn __call__(&self, py: Python<'_>, args: &Bound<'_, PyTuple>) -> PyResult<()> {
        run_launch(py, args, Some(&self.signature))
    }

    fn __repr__(&self) -> String {
        format!("Launcher({:?})", self.signature())
    }
}

#[pymodule]
fn kore_launcher(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyLauncher>()?;
    m.add_function(wrap_pyfunction!(launch_kernel, m)?)?;
    m.add_function(wrap_pyfunction!(extended_launch_supported, m)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::{PyDict, PyList};

    fn call_args<'py>(
        py: Python<'py>,
        grid: (i32, i32, i32),
        enter_hook: PyObject,
        exit_hook: PyObject,
        kernel_args: &[i64],
    ) -> Bound<'py, PyTuple> {
        let items: Vec<PyObject> = vec![
            grid.0.into_py(py),
            grid.1.into_py(py),
            grid.2.into_py(py),
            4i32.into_py(py),  // num_warps
            1i32.into_py(py),  // num_ctas
            2i32.into_py(py),
            1i32.into_py(py),
            1i32.into_py(py),
            0i32.into_py(py),  // shared_memory
            0x20u64.into_py(py), // stream
            0x10u64.into_py(py), // function
            enter_hook,
            exit_hook,
            py.None(),         // compiled_kernel
            PyTuple::new_bound(py, kernel_args).into_py(py),
        ];
        PyTuple::new_bound(py, items)
    }

    #[test]
    fn test_parse_call_reads_slots_in_order() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let args = call_args(py, (3, 2, 1), py.None(), py.None(), &[5, 1_000_000_000_000]);
            let call = parse_call(&args).unwrap();
            assert_eq!((call.geometry.grid_x, call.geometry.grid_y, call.geometry.grid_z), (3, 2, 1));
            assert_eq!(call.geometry.num_warps, 4);
            assert_eq!(call.geometry.cluster_dim_x, 2);
            assert_eq!(call.stream, StreamHandle(0x20));
            assert_eq!(call.kernel, KernelHandle(0x10));
            assert!(call.enter_hook.is_none());
            assert!(call.exit_hook.is_none());

            let scalars = untyped_args(&call.kernel_args).unwrap();
            assert_eq!(scalars, vec![Scalar::U64(5), Scalar::U64(1_000_000_000_000)]);
        });
    }

    #[test]
    fn test_parse_call_rejects_wrong_arity() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let args = PyTuple::new_bound(py, [1i32; LAUNCH_ARITY - 1]);
            let err = parse_call(&args).err().unwrap();
            assert!(err.is_instance_of::<PyTypeError>(py));
        });
    }

    #[test]
    fn test_negative_untyped_argument_is_type_error() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let kernel_args = PyTuple::new_bound(py, [7i64, -1]);
            let err = untyped_args(&kernel_args).unwrap_err();
            assert!(err.is_instance_of::<PyTypeError>(py));
            assert!(err.to_string().contains("Argument 1"));
        });
    }

    #[test]
    fn test_empty_grid_runs_hooks_without_driver() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let calls = PyList::empty_bound(py);
            let globals = PyDict::new_bound(py);
            globals.set_item("calls", &calls).unwrap();
            let hook = py
                .eval_bound("lambda *a: calls.append(len(a))", Some(&globals), None)
                .unwrap();

            let args = call_args(py, (0, 1, 1), hook.clone().unbind(), hook.unbind(), &[1, 2]);
            run_launch(py, &args, None).unwrap();

            let seen: Vec<usize> = calls.extract().unwrap();
            assert_eq!(seen, vec![LAUNCH_ARITY, LAUNCH_ARITY]);
        });
    }
}
