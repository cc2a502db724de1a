//! AF_XDP socket lifecycle, ring datapath, and RX steering program for
//! kernel-bypass packet I/O.
//!
//! [`xsk`] is the raw Linux `AF_XDP` binding (sockets, UMEM, rings). Every
//! other module builds the control-plane on top of it: [`socket`] the
//! per-socket state machine and sockopt surface, [`provider`] the
//! interface-binding seam `socket` activates rings through, [`umem`] the
//! registry and address translation, [`program`]/[`inspect`] the RX
//! steering program and its frame evaluator, [`notify`] the poke/wait
//! engine, [`offload`] the RSS/QEO lifetime, [`epoch`] the RCU-style
//! program reclamation, and [`command`] the tagged-handle dispatch that the
//! `xdpctl` binary and any other control surface talk to.
extern crate alloc;

macro_rules! eprint {
    ($msg:literal, $($arg:expr),*) => {
        match ::alloc::format!($msg, $($arg),*) {
            msg => {
                unsafe { libc::write(2, msg.as_bytes().as_ptr() as *const _, msg.len()) };
            }
        }
    }
}

pub mod command;
pub mod epoch;
pub mod error;
pub mod inspect;
pub mod notify;
pub mod offload;
pub mod program;
pub mod provider;
pub mod socket;
pub mod umem;
pub mod xsk;
/// Bindings for XDP (kernel-interface).
pub mod xdp;

pub use error::XdpError;

pub(crate) struct LastErrno;
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}
