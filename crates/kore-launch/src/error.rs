//! Launch error taxonomy.

use crate::ffi::CuResult;

/// Prefix attached to every driver-reported launch failure.
pub const ERROR_TAG: &str = "Kore Error [CUDA]: ";

/// Launcher errors. Every variant is terminal for the launch attempt that
/// produced it; nothing here is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to open {library}: {reason}")]
    DriverLoad { library: String, reason: String },

    #[error("Failed to retrieve {symbol} from {library}")]
    SymbolNotFound { symbol: String, library: String },

    #[error("Argument {index} cannot be passed as a 64-bit word: {reason}")]
    ArgumentConversion { index: usize, reason: String },

    #[error("{ERROR_TAG}{message}")]
    Launch { code: CuResult, message: String },

    #[error("Invalid launch geometry: {0}")]
    InvalidGeometry(String),
}

/// Fieldless view of [`LaunchError`] for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DriverLoad,
    SymbolNotFound,
    ArgumentConversion,
    Launch,
    InvalidGeometry,
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::DriverLoad { .. } => ErrorKind::DriverLoad,
            LaunchError::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            LaunchError::ArgumentConversion { .. } => ErrorKind::ArgumentConversion,
            LaunchError::Launch { .. } => ErrorKind::Launch,
            LaunchError::InvalidGeometry(_) => ErrorKind::InvalidGeometry,
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Outcome of a launch that runs caller-supplied enter/exit hooks.
#[derive(Debug)]
pub enum HookedLaunchError<E> {
    /// A hook failed; surfaced unchanged.
    Hook(E),
    Launch(LaunchError),
}

impl<E> From<LaunchError> for HookedLaunchError<E> {
    fn from(e: LaunchError) -> Self {
        HookedLaunchError::Launch(e)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for HookedLaunchError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookedLaunchError::Hook(e) => write!(f, "launch hook failed: {}", e),
            HookedLaunchError::Launch(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for HookedLaunchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HookedLaunchError::Hook(e) => Some(e),
            HookedLaunchError::Launch(e) => Some(e),
        }
    }
}
