//! Hooked launch entry point: enter hook, marshal, dispatch, exit hook.

use crate::args::marshal;
use crate::dispatch::{dispatch, KernelHandle, LaunchPath, StreamHandle};
use crate::driver::LaunchDriver;
use crate::error::HookedLaunchError;
use crate::geometry::LaunchGeometry;
use crate::signature::Scalar;

/// Everything needed to launch one already-loaded kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub geometry: LaunchGeometry,
    pub kernel: KernelHandle,
    pub stream: StreamHandle,
    pub args: Vec<Scalar>,
}

/// Caller callbacks around the device call.
///
/// `enter` runs before any argument is marshaled; `exit` runs only after the
/// device call succeeded. A hook error aborts the launch and is returned
/// unchanged.
pub trait LaunchHooks {
    type Error;

    fn enter(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn exit(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Run the blocking device call. Embedders override this to release
    /// whatever execution context they hold while the driver runs.
    fn blocking<R, F>(&mut self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        f()
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LaunchHooks for NoHooks {
    type Error = std::convert::Infallible;
}

/// Launch `request` through `driver`, running `hooks` around the device call.
///
/// Argument storage lives only for the device call and is released on every
/// exit path.
///
/// # Safety
/// Same contract as [`dispatch`]: live handles, arguments matching the kernel.
pub unsafe fn launch<D, H>(
    driver: &D,
    request: &LaunchRequest,
    hooks: &mut H,
) -> Result<LaunchPath, HookedLaunchError<H::Error>>
where
    D: LaunchDriver + Sync + ?Sized,
    H: LaunchHooks,
{
    hooks.enter().map_err(HookedLaunchError::Hook)?;

    let args = marshal(request.args.iter().copied())?;
    let geometry = request.geometry;
    let (kernel, stream) = (request.kernel, request.stream);

    let path = hooks.blocking(move || {
        // SAFETY: forwarded from this function's contract.
        let path = unsafe { dispatch(driver, &geometry, kernel, stream, &args) };
        drop(args);
        path
    })?;

    hooks.exit().map_err(HookedLaunchError::Hook)?;
    Ok(path)
}
