//! The SPSC ring primitive and its two Linux realizations:
//! mmap'd kernel rings, and heap-backed rings for tests and for the
//! software-redirect path between a physical and a logical socket.
use core::ops::RangeInclusive;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use alloc::alloc::{alloc_zeroed, Layout};

use crate::xdp::{XdpDesc, XdpRingOffsets};
use crate::xsk::{ring_flags, BufIdx, SocketFd, SocketMmapOffsets, XskRing, XskRingCons, XskRingProd};

impl XskRing {
    const XDP_PGOFF_RX_RING: libc::off_t = 0;
    const XDP_PGOFF_TX_RING: libc::off_t = 0x8000_0000;
    const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x1_0000_0000;
    const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x1_8000_0000;

    /// Construct a ring from a memory region given by the kernel (mmap) or
    /// by a test/software harness (heap allocation).
    ///
    /// # Safety
    ///
    /// The caller is responsible for ensuring that the memory region is
    /// valid and **outlives** the ring itself, and that `off` describes
    /// offsets that actually fit within it.
    unsafe fn new(base: NonNull<u8>, off: &XdpRingOffsets, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        let base: *mut u8 = base.as_ptr();
        let trust_offset = |off: u64| NonNull::new_unchecked(base.offset(off as isize));

        let producer = trust_offset(off.producer).cast().as_ref();
        let consumer = trust_offset(off.consumer).cast().as_ref();
        let ring = trust_offset(off.desc).cast();
        let flags = trust_offset(off.flags).cast();

        XskRing {
            mask: count - 1,
            size: count,
            producer,
            consumer,
            ring,
            flags,
            cached_producer: producer.load(Ordering::Relaxed),
            cached_consumer: consumer.load(Ordering::Relaxed),
        }
    }

    unsafe fn map(
        fd: &SocketFd,
        off: &XdpRingOffsets,
        count: u32,
        stride: u64,
        offset: libc::off_t,
    ) -> Result<(Self, NonNull<[u8]>), libc::c_int> {
        let len = (off.desc + u64::from(count) * stride) as usize;

        let mmap = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd.0,
            offset,
        );

        if mmap == libc::MAP_FAILED {
            return Err(*libc::__errno_location());
        }

        let mmap_addr = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, len);
        let mmap_addr = NonNull::new_unchecked(mmap_addr);

        Ok((XskRing::new(mmap_addr.cast(), off, count), mmap_addr))
    }

    /// Build a ring backed by a heap allocation instead of an mmap'd kernel
    /// region. Used for tests and for the software ring that shuttles
    /// frames between the physical socket and the inspection engine.
    ///
    /// Layout: an 8-byte `producer`/`consumer` pair, a `flags` word, then
    /// the element array starting at a 64-byte aligned offset, matching
    /// (Linux instead scatters the four rings' heads across
    /// separate mmap'd pages; a boxed allocation has no use for that).
    fn new_boxed(count: u32, stride: usize) -> (Self, NonNull<[u8]>) {
        assert!(count.is_power_of_two());
        const HEADER: usize = 64;
        let len = HEADER + count as usize * stride;

        let layout = Layout::from_size_align(len, 64).expect("ring layout");
        let raw = unsafe {
            let ptr = alloc_zeroed(layout);
            assert!(!ptr.is_null(), "allocation failure");
            ptr
        };

        let mmap_addr =
            unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(raw, len)) };

        let off = XdpRingOffsets {
            producer: 0,
            consumer: 4,
            desc: HEADER as u64,
            flags: 8,
        };

        // Safety: `raw` points at `len` freshly zeroed, owned bytes; the
        // caller wraps `mmap_addr` into the ring struct that will free it.
        let inner = unsafe { XskRing::new(mmap_addr.cast(), &off, count) };
        (inner, mmap_addr)
    }

    /// Refresh `cached_producer` from the atomic and return `producer -
    /// consumer`. Used by the consumer side, which owns `cached_consumer`
    /// but must reload the producer head the other side just advanced.
    fn count_pending_refresh_producer(&mut self) -> u32 {
        self.cached_producer = self.producer.load(Ordering::Acquire);
        self.cached_producer.wrapping_sub(self.cached_consumer)
    }

    /// Refresh `cached_consumer` from the atomic and return `producer -
    /// consumer`. Used by the producer side.
    fn count_pending_refresh_consumer(&mut self) -> u32 {
        self.cached_consumer = self.consumer.load(Ordering::Acquire);
        self.cached_producer.wrapping_sub(self.cached_consumer)
    }

    pub(crate) fn check_flags(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.flags.as_ptr()) }
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        // There is exactly one writer of the flags word (the kernel, or in
        // the software ring, the owning ring side), so a volatile
        // read-modify-write bracketed by acquire/release fences is
        // equivalent to the interlocked OR the kernel performs.
        core::sync::atomic::fence(Ordering::Acquire);
        let cur = unsafe { core::ptr::read_volatile(self.flags.as_ptr()) };
        unsafe { core::ptr::write_volatile(self.flags.as_ptr(), cur | bit) };
        core::sync::atomic::fence(Ordering::Release);
    }

    pub(crate) fn clear_flag(&self, bit: u32) {
        core::sync::atomic::fence(Ordering::Acquire);
        let cur = unsafe { core::ptr::read_volatile(self.flags.as_ptr()) };
        unsafe { core::ptr::write_volatile(self.flags.as_ptr(), cur & !bit) };
        core::sync::atomic::fence(Ordering::Release);
    }
}

/// Whether a ring's memory came from `mmap` (munmap on drop) or from the
/// heap (ordinary deallocation on drop). Kept out of the hot path: only
/// consulted once, in `Drop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RingOrigin {
    Mmap,
    Heap,
}

macro_rules! impl_ring_drop {
    ($ty:ident) => {
        impl Drop for $ty {
            fn drop(&mut self) {
                match self.origin {
                    RingOrigin::Mmap => unsafe {
                        let len = super::ptr_len(self.mmap_addr.as_ptr());
                        libc::munmap(self.mmap_addr.as_ptr() as *mut _, len);
                    },
                    RingOrigin::Heap => unsafe {
                        let len = super::ptr_len(self.mmap_addr.as_ptr());
                        let layout = Layout::from_size_align(len, 64).expect("ring layout");
                        alloc::alloc::dealloc(self.mmap_addr.as_ptr() as *mut u8, layout);
                    },
                }
            }
        }
    };
}

impl XskRingProd {
    /// # Safety
    ///
    /// `fd`/`off` must correspond to the same socket for which they were
    /// queried from the kernel.
    pub(crate) unsafe fn fill(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = XskRing::map(
            fd,
            &off.inner.fr,
            count,
            core::mem::size_of::<u64>() as u64,
            XskRing::XDP_UMEM_PGOFF_FILL_RING,
        )?;

        Ok(XskRingProd {
            inner,
            mmap_addr,
            origin: RingOrigin::Mmap,
        })
    }

    /// # Safety
    ///
    /// See [`Self::fill`].
    pub(crate) unsafe fn tx(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = XskRing::map(
            fd,
            &off.inner.tx,
            count,
            core::mem::size_of::<XdpDesc>() as u64,
            XskRing::XDP_PGOFF_TX_RING,
        )?;

        Ok(XskRingProd {
            inner,
            mmap_addr,
            origin: RingOrigin::Mmap,
        })
    }

    pub(crate) fn new_boxed_fill(count: u32) -> Self {
        let (inner, mmap_addr) = XskRing::new_boxed(count, core::mem::size_of::<u64>());
        XskRingProd {
            inner,
            mmap_addr,
            origin: RingOrigin::Heap,
        }
    }

    pub(crate) fn new_boxed_tx(count: u32) -> Self {
        let (inner, mmap_addr) = XskRing::new_boxed(count, core::mem::size_of::<XdpDesc>());
        XskRingProd {
            inner,
            mmap_addr,
            origin: RingOrigin::Heap,
        }
    }

    pub unsafe fn fill_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<u64>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    pub unsafe fn tx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<XdpDesc>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Entries submitted to the kernel but not yet consumed by it (I1:
    /// this never exceeds `size`).
    pub fn count_pending(&mut self) -> u32 {
        self.inner.count_pending_refresh_consumer()
    }

    /// Reserve between `*range.start()` and `*range.end()` free slots
    /// without publishing them yet. Returns 0 if fewer than the range's
    /// lower bound are free; otherwise returns as many as are free, capped
    /// at the range's upper bound.
    pub fn reserve(&mut self, range: RangeInclusive<u32>, idx: &mut BufIdx) -> u32 {
        let pending = self.inner.count_pending_refresh_consumer();
        let free = self.inner.size.saturating_sub(pending);
        let count = free.min(*range.end());
        if count < *range.start() {
            return 0;
        }

        *idx = BufIdx(self.inner.cached_producer);
        self.inner.cached_producer = self.inner.cached_producer.wrapping_add(count);
        count
    }

    /// Cancel a previous `reserve`. If passed a smaller number, the
    /// remaining reservation stays active.
    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_producer = self.inner.cached_producer.wrapping_sub(nb);
    }

    /// Publish `nb` previously reserved and filled slots to the kernel.
    pub fn submit(&mut self, nb: u32) {
        let cur = self.inner.producer.load(Ordering::Relaxed);
        self.inner
            .producer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn check_flags(&self) -> u32 {
        self.inner.check_flags()
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        self.inner.set_flag(bit)
    }

    pub(crate) fn clear_flag(&self, bit: u32) {
        self.inner.clear_flag(bit)
    }

    /// Consume entries the app already published, playing the kernel's role
    /// on what is otherwise an app-producer ring.
    ///
    /// Used by the inspection engine's software redirect path: a logical
    /// socket's fill ring is a real producer ring from the
    /// app's point of view, but since no real kernel ever drains it, the
    /// engine itself must act as that consumer when popping an address to
    /// redirect a frame into. Mirrors [`XskRingCons::peek`] exactly, just
    /// reading the same shared `XskRing` from its other side.
    pub(crate) fn kernel_peek(&mut self, range: RangeInclusive<u32>, idx: &mut BufIdx) -> u32 {
        let available = self.inner.count_pending_refresh_producer();
        let count = available.min(*range.end());
        if count < *range.start() {
            return 0;
        }

        *idx = BufIdx(self.inner.cached_consumer);
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_add(count);
        count
    }

    /// Counterpart to [`Self::kernel_peek`]; mirrors [`XskRingCons::release`].
    pub(crate) fn kernel_release(&mut self, nb: u32) {
        let cur = self.inner.consumer.load(Ordering::Relaxed);
        self.inner
            .consumer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }
}

impl XskRingCons {
    /// # Safety
    ///
    /// See [`XskRingProd::fill`].
    pub(crate) unsafe fn comp(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = XskRing::map(
            fd,
            &off.inner.cr,
            count,
            core::mem::size_of::<u64>() as u64,
            XskRing::XDP_UMEM_PGOFF_COMPLETION_RING,
        )?;

        Ok(XskRingCons {
            inner,
            mmap_addr,
            origin: RingOrigin::Mmap,
        })
    }

    /// # Safety
    ///
    /// See [`XskRingProd::fill`].
    pub(crate) unsafe fn rx(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = XskRing::map(
            fd,
            &off.inner.rx,
            count,
            core::mem::size_of::<XdpDesc>() as u64,
            XskRing::XDP_PGOFF_RX_RING,
        )?;

        Ok(XskRingCons {
            inner,
            mmap_addr,
            origin: RingOrigin::Mmap,
        })
    }

    pub(crate) fn new_boxed_comp(count: u32) -> Self {
        let (inner, mmap_addr) = XskRing::new_boxed(count, core::mem::size_of::<u64>());
        XskRingCons {
            inner,
            mmap_addr,
            origin: RingOrigin::Heap,
        }
    }

    pub(crate) fn new_boxed_rx(count: u32) -> Self {
        let (inner, mmap_addr) = XskRing::new_boxed(count, core::mem::size_of::<XdpDesc>());
        XskRingCons {
            inner,
            mmap_addr,
            origin: RingOrigin::Heap,
        }
    }

    pub unsafe fn comp_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<u64>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    pub unsafe fn rx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<XdpDesc>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Entries produced by the kernel but not yet consumed by us.
    pub fn count_pending(&mut self) -> u32 {
        self.inner.count_pending_refresh_producer()
    }

    /// Peek between `*range.start()` and `*range.end()` available entries
    /// without releasing them yet. Returns 0 if fewer than the range's
    /// lower bound are available; otherwise returns as many as are
    /// available, capped at the range's upper bound.
    pub fn peek(&mut self, range: RangeInclusive<u32>, idx: &mut BufIdx) -> u32 {
        let available = self.inner.count_pending_refresh_producer();
        let count = available.min(*range.end());
        if count < *range.start() {
            return 0;
        }

        *idx = BufIdx(self.inner.cached_consumer);
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_add(count);
        count
    }

    /// Cancel a previous `peek`. If passed a smaller number, the remaining
    /// reservation stays active.
    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_sub(nb);
    }

    pub fn release(&mut self, nb: u32) {
        let cur = self.inner.consumer.load(Ordering::Relaxed);
        self.inner
            .consumer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn check_flags(&self) -> u32 {
        self.inner.check_flags()
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        self.inner.set_flag(bit)
    }

    pub(crate) fn clear_flag(&self, bit: u32) {
        self.inner.clear_flag(bit)
    }

    /// Publish an entry into what is otherwise an app-consumer ring, playing
    /// the kernel's role. Counterpart to [`XskRingProd::kernel_peek`]; mirrors
    /// [`XskRingProd::reserve`] read from this ring's other side.
    pub(crate) fn kernel_reserve(&mut self, range: RangeInclusive<u32>, idx: &mut BufIdx) -> u32 {
        let pending = self.inner.count_pending_refresh_consumer();
        let free = self.inner.size.saturating_sub(pending);
        let count = free.min(*range.end());
        if count < *range.start() {
            return 0;
        }

        *idx = BufIdx(self.inner.cached_producer);
        self.inner.cached_producer = self.inner.cached_producer.wrapping_add(count);
        count
    }

    /// Counterpart to [`Self::kernel_reserve`]; mirrors [`XskRingProd::submit`].
    pub(crate) fn kernel_submit(&mut self, nb: u32) {
        let cur = self.inner.producer.load(Ordering::Relaxed);
        self.inner
            .producer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }
}

impl_ring_drop!(XskRingProd);
impl_ring_drop!(XskRingCons);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_below_minimum_is_rejected() {
        let mut prod = XskRingProd::new_boxed_fill(8);
        let mut idx = BufIdx(0);
        // Nothing free below 8 requested as a hard minimum beyond capacity.
        assert_eq!(prod.reserve(9..=9, &mut idx), 0);
    }

    #[test]
    fn fill_and_drain_in_order() {
        let mut prod = XskRingProd::new_boxed_fill(8);
        let mut idx = BufIdx(0);
        assert_eq!(prod.reserve(1..=8, &mut idx), 8);
        for i in 0..8u64 {
            unsafe { *prod.fill_addr(BufIdx(idx.0.wrapping_add(i as u32))).as_ptr() = i * 4096 };
        }
        prod.submit(8);
        assert_eq!(prod.inner.cached_producer, 8);
    }

    #[test]
    fn monotonicity_under_wrap() {
        // I1/I2/I3 + index wrap safety (): seed producer and
        // consumer near u32::MAX and verify reserve/submit/peek/release
        // behave identically to starting at 0.
        let mut prod = XskRingProd::new_boxed_fill(8);
        prod.inner.cached_producer = u32::MAX - 1;
        prod.inner.producer.store(u32::MAX - 1, Ordering::Relaxed);
        prod.inner.cached_consumer = u32::MAX - 1;
        prod.inner.consumer.store(u32::MAX - 1, Ordering::Relaxed);

        let mut idx = BufIdx(0);
        let got = prod.reserve(1..=8, &mut idx);
        assert_eq!(got, 8);
        assert_eq!(idx.0, u32::MAX - 1);
        prod.submit(8);

        let prod_head = prod.inner.producer.load(Ordering::Relaxed);
        assert_eq!(prod_head, 6); // wrapped: (MAX - 1) + 8 == 6 (mod 2^32)

        // producer - consumer must never exceed size.
        let count = prod_head.wrapping_sub(u32::MAX - 1);
        assert!(count <= 8);
    }

    #[test]
    fn reserve_never_exceeds_size_after_wrap() {
        let mut prod = XskRingProd::new_boxed_fill(4);
        prod.inner.cached_producer = u32::MAX - 2;
        prod.inner.producer.store(u32::MAX - 2, Ordering::Relaxed);
        prod.inner.cached_consumer = u32::MAX - 2;
        prod.inner.consumer.store(u32::MAX - 2, Ordering::Relaxed);

        let mut idx = BufIdx(0);
        let reserved = prod.reserve(1..=10, &mut idx);
        assert_eq!(reserved, 4, "never reserves more than ring size");
    }

    #[test]
    fn needs_wakeup_flag_roundtrip() {
        let prod = XskRingProd::new_boxed_tx(8);
        assert_eq!(prod.check_flags() & ring_flags::NEED_POKE, 0);
        prod.set_flag(ring_flags::NEED_POKE);
        assert_ne!(prod.check_flags() & ring_flags::NEED_POKE, 0);
        prod.clear_flag(ring_flags::NEED_POKE);
        assert_eq!(prod.check_flags() & ring_flags::NEED_POKE, 0);
    }
}
