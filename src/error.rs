//! Portable error taxonomy shared across the control and data planes.
use thiserror::Error;

use crate::{Errno, LastErrno};

/// Closed error taxonomy shared by every control-plane and datapath
/// operation in this crate.
#[derive(Debug, Error)]
pub enum XdpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("operation not permitted in the current state")]
    InvalidState,

    #[error("no such interface, socket, or program")]
    NotFound,

    #[error("resource allocation failed")]
    Resource,

    #[error("output buffer too small, {required} bytes required")]
    InsufficientBuffer { required: usize },

    #[error("interface detached")]
    InterfaceDetached,

    #[error("ring protocol violation detected")]
    InvalidRing,

    #[error("operation timed out")]
    Timeout,

    #[error("operation pending, complete asynchronously")]
    Pending,

    #[error("feature or option not supported")]
    NotSupported,

    #[error("syscall failed: {0}")]
    Errno(#[from] Errno),
}

impl From<LastErrno> for XdpError {
    fn from(err: LastErrno) -> Self {
        XdpError::Errno(Errno::from(err))
    }
}

impl XdpError {
    /// Whether this error latches the owning socket into a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, XdpError::InterfaceDetached | XdpError::InvalidRing)
    }
}
