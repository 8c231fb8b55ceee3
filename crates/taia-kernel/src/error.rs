//! Kernel-specific error types.

use taia_runtime::error::BridgeError;
use taia_types::error::TaiaError;
use thiserror::Error;

/// Kernel error type wrapping the federation and bridge errors.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped TaiaError.
    #[error(transparent)]
    Taia(#[from] TaiaError),

    /// A wrapped bridge rejection.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

impl KernelError {
    /// The federation error inside, if this is one.
    pub fn as_taia(&self) -> Option<&TaiaError> {
        match self {
            KernelError::Taia(e) => Some(e),
            _ => None,
        }
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
