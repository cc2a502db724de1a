//! Raw bindings to the Linux `AF_XDP` socket family.
//!
//! This module is the concrete interface provider backing the rest of the
//! crate: a physical `AF_XDP` socket bound to one `(ifindex, queue_id)` pair, its
//! `UMEM` registration, and the four shared-memory rings that make up the
//! kernel/user datapath. Everything above this module (program
//! compilation, the inspection engine, the notify engine's `Future`
//! wrapper, the socket state machine) is backend-agnostic and talks to
//! this module only through the narrow surface re-exported here.
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;

use spin::RwLock;

use crate::xdp::{XdpMmapOffsets, XdpRingOffsets};
use crate::Errno;

pub mod iface;
pub mod ring;
pub mod socket;
pub mod umem;
pub mod user;

/// `SOL_XDP`, not exposed by every `libc` version.
pub(crate) const SOL_XDP: libc::c_int = 283;

/// Length, in bytes, of the memory region backing a `NonNull<[u8]>` pointer
/// obtained from `mmap`. `NonNull<[u8]>::len` requires nightly metadata
/// APIs on some toolchains so we keep this helper instead.
pub(crate) fn ptr_len(ptr: *mut [u8]) -> usize {
    // Safety: `ptr` is a fat pointer to a slice; reading its length metadata
    // does not dereference the pointee.
    unsafe { (*(ptr as *const [u8])).len() }
}

/// Owning wrapper around a raw `AF_XDP` socket file descriptor.
#[derive(Debug)]
pub struct SocketFd(pub(crate) libc::c_int);

impl SocketFd {
    pub(crate) fn get_opt<T>(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: &T,
    ) -> Result<libc::socklen_t, Errno> {
        let mut optlen = core::mem::size_of::<T>() as libc::socklen_t;

        let err = unsafe {
            libc::getsockopt(
                self.0,
                level,
                name,
                value as *const T as *mut libc::c_void,
                &mut optlen,
            )
        };

        if err != 0 {
            return Err(Errno::new());
        }

        Ok(optlen)
    }

    pub(crate) fn set_opt<T>(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: &T,
    ) -> Result<(), Errno> {
        let err = unsafe {
            libc::setsockopt(
                self.0,
                level,
                name,
                value as *const T as *const libc::c_void,
                core::mem::size_of::<T>() as libc::socklen_t,
            )
        };

        if err != 0 {
            return Err(Errno::new());
        }

        Ok(())
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Identifies one device queue: an interface, a queue within it, and the
/// network namespace it was resolved in (to detect a namespace move).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IfCtx {
    pub ifindex: u32,
    pub queue_id: u32,
    pub netnscookie: u64,
}

/// Resolved information about a target network interface.
#[derive(Debug, Clone, Copy)]
pub struct IfInfo {
    pub(crate) ctx: IfCtx,
    pub(crate) ifname: [libc::c_char; libc::IFNAMSIZ],
}

/// A raw `AF_XDP` socket bound to an interface (but not yet to a queue).
///
/// This is the physical, kernel-level socket handle: the fd plus the
/// interface it was created against, shared (by `Arc`) between a `Umem`
/// owner and any sockets sharing that `Umem`'s fill/completion rings.
#[derive(Debug, Clone)]
pub struct XskSocket {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) info: Arc<IfInfo>,
}

/// Configuration for a `UMEM` region.
#[derive(Debug, Clone, Copy)]
pub struct XskUmemConfig {
    /// Number of entries in the fill queue.
    pub fill_size: u32,
    /// Number of entries in the completion queue.
    pub complete_size: u32,
    /// Size of each chunk ("frame") in the UMEM.
    pub frame_size: u32,
    /// Reserved headroom at the start of each chunk.
    pub headroom: u32,
    /// Flags passed to `XDP_UMEM_REG`.
    pub flags: u32,
}

impl Default for XskUmemConfig {
    fn default() -> Self {
        XskUmemConfig {
            fill_size: 1 << 11,
            complete_size: 1 << 11,
            frame_size: 1 << 12,
            headroom: 0,
            flags: 0,
        }
    }
}

/// Configuration for binding the RX/TX rings of a socket.
#[derive(Debug, Clone, Copy)]
pub struct XskSocketConfig {
    pub rx_size: Option<core::num::NonZeroU32>,
    pub tx_size: Option<core::num::NonZeroU32>,
    /// `sxdp_flags` passed to `bind`, e.g. `XDP_COPY`/`XDP_ZEROCOPY`.
    pub bind_flags: u16,
}

/// The `UMEM` region: a user-registered packet buffer shared with the
/// kernel, and the set of device queues currently using it as their
/// fill/completion backing store.
pub struct XskUmem {
    pub(crate) umem_area: NonNull<[u8]>,
    pub(crate) config: XskUmemConfig,
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) devices: XskDeviceControl,
}

// Safety: `umem_area` points at pinned, kernel-shared memory; all mutation
// through it is either exclusive (the chunk currently owned by one ring
// side) or benign (the kernel's own concurrent writes, which Rust code
// never assumes exclusivity over).
unsafe impl Send for XskUmem {}
unsafe impl Sync for XskUmem {}

/// The fill/completion ring pair bound to one device queue, plus the
/// physical socket they're attached to.
pub struct XskDeviceQueue {
    pub(crate) fcq: XskDeviceRings,
    pub(crate) socket: XskSocket,
    pub(crate) devices: XskDeviceControl,
}

pub(crate) struct XskDeviceRings {
    pub(crate) map: SocketMmapOffsets,
    pub(crate) prod: XskRingProd,
    pub(crate) cons: XskRingCons,
}

/// A bound data-plane socket: its RX and/or TX rings, once activated.
#[derive(Clone)]
pub struct XskUser {
    pub(crate) socket: XskSocket,
    pub(crate) config: Arc<XskSocketConfig>,
    pub(crate) map: SocketMmapOffsets,
}

pub struct XskRxRing {
    pub(crate) ring: XskRingCons,
    pub(crate) fd: Arc<SocketFd>,
}

pub struct XskTxRing {
    pub(crate) ring: XskRingProd,
    pub(crate) fd: Arc<SocketFd>,
}

/// The mmap offsets of all four rings of a socket, as returned by the
/// kernel (`XDP_MMAP_OFFSETS`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketMmapOffsets {
    pub(crate) inner: XdpMmapOffsets,
}

/// An index into a ring's element array.
///
/// This is *not* a plain offset: apply `& mask` first. See the module docs
/// of [`ring`] for the wraparound discussion.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BufIdx(pub u32);

/// Internal structure shared for all four ring kinds.
#[derive(Debug)]
pub(crate) struct XskRing {
    /// Owned, possibly-stale copy of the producer head.
    pub(crate) cached_producer: u32,
    /// Owned, possibly-stale copy of the consumer head.
    pub(crate) cached_consumer: u32,
    /// Bit mask to fold a free-running index into a slot index.
    pub(crate) mask: u32,
    /// Number of entries; always `mask + 1`.
    pub(crate) size: u32,
    /// The mmap'd producer index.
    pub(crate) producer: &'static AtomicU32,
    /// The mmap'd consumer index.
    pub(crate) consumer: &'static AtomicU32,
    /// The mmap'd element array.
    pub(crate) ring: NonNull<core::ffi::c_void>,
    /// The mmap'd flags word (`ERROR`/`NEED_POKE`/`AFFINITY_CHANGED`).
    pub(crate) flags: NonNull<u32>,
}

/// A producer-side ring: user space advances `producer`, the kernel
/// advances `consumer`. Used for the fill ring and the TX ring.
#[derive(Debug)]
pub struct XskRingProd {
    pub(crate) inner: XskRing,
    pub(crate) mmap_addr: NonNull<[u8]>,
    pub(crate) origin: ring::RingOrigin,
}

/// A consumer-side ring: the kernel advances `producer`, user space
/// advances `consumer`. Used for the completion ring and the RX ring.
#[derive(Debug)]
pub struct XskRingCons {
    pub(crate) inner: XskRing,
    pub(crate) mmap_addr: NonNull<[u8]>,
    pub(crate) origin: ring::RingOrigin,
}

// Safety: the inner raw pointers only ever address the mmap'd ring memory,
// which is valid for as long as the owning ring struct is alive; access
// through them is synchronized by the producer/consumer atomics, so shared
// references are as safe to hand across threads as exclusive ones (needed
// for `Socket` — and so the notify engine's reactor thread — to be
// `Send`/`Sync`).
unsafe impl Send for XskRingProd {}
unsafe impl Send for XskRingCons {}
unsafe impl Sync for XskRingProd {}
unsafe impl Sync for XskRingCons {}

/// Ring-flag bits shared by all four ring kinds.
pub(crate) mod ring_flags {
    pub(crate) const ERROR: u32 = 1 << 0;
    pub(crate) const NEED_POKE: u32 = 1 << 1;
    pub(crate) const AFFINITY_CHANGED: u32 = 1 << 2;
}

/// The set of device queues (`IfCtx`) currently attached to one `Umem`.
///
/// Exclusion here is what prevents the same physical queue from being
/// double-attached to one `Umem`'s fill/completion pair.
pub trait ControlSet: Send + Sync {
    fn insert(&self, ctx: IfCtx) -> bool;
    fn contains(&self, ctx: &IfCtx) -> bool;
    fn remove(&self, ctx: &IfCtx);
}

#[derive(Clone)]
pub struct XskDeviceControl {
    pub(crate) inner: Arc<dyn ControlSet>,
}

impl core::ops::Deref for XskDeviceControl {
    type Target = dyn ControlSet;
    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

#[derive(Default)]
pub(crate) struct SpinLockedControlSet {
    inner: RwLock<BTreeSet<IfCtx>>,
}

impl ControlSet for SpinLockedControlSet {
    fn insert(&self, ctx: IfCtx) -> bool {
        self.inner.write().insert(ctx)
    }

    fn contains(&self, ctx: &IfCtx) -> bool {
        self.inner.read().contains(ctx)
    }

    fn remove(&self, ctx: &IfCtx) {
        self.inner.write().remove(ctx);
    }
}

impl Default for XskDeviceControl {
    fn default() -> Self {
        XskDeviceControl {
            inner: Arc::new(SpinLockedControlSet::default()),
        }
    }
}
