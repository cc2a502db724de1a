//! UMEM registry: chunk validation, address packing, and refcounted
//! sharing across sockets, layered on top of the raw [`crate::xsk`] binding.
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::error::XdpError;
use crate::xsk::{XskDeviceControl, XskUmem, XskUmemConfig};

/// Chunk size must be a power of two within this range (I4/I5 policy).
pub const MIN_CHUNK_SIZE: u32 = 1 << 12;
pub const MAX_CHUNK_SIZE: u32 = 1 << 16;

/// A registered packet buffer region, refcounted across sharing sockets.
///
/// `Umem` owns the backing allocation only when it was the one that
/// allocated it (`register`); a `share()`'d handle points at the same
/// `XskUmem`/allocation through the inner `Arc` without re-pinning pages.
#[derive(Clone)]
pub struct Umem {
    inner: Arc<XskUmem>,
    area: NonNull<[u8]>,
    chunk_size: u32,
    headroom: u32,
    chunk_count: u32,
    layout: Layout,
}

// Safety: `area` addresses the same memory `inner` (an `XskUmem`, itself
// Send + Sync) already asserts is safe to share across threads.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl Umem {
    /// Register a new UMEM: allocate `chunk_count * chunk_size` page-aligned
    /// bytes and hand them to the kernel via `XDP_UMEM_REG`.
    ///
    /// Validates (I4) `chunk_size >= headroom + max_frame` is the caller's
    /// responsibility to pick a sane `chunk_size`/`headroom` pair; here we
    /// only check the bounds the kernel itself enforces plus (I5) (a
    /// partial final chunk is silently ignored, never addressable).
    pub fn register(
        total_size: usize,
        chunk_size: u32,
        headroom: u32,
    ) -> Result<Self, XdpError> {
        if !chunk_size.is_power_of_two()
            || chunk_size < MIN_CHUNK_SIZE
            || chunk_size > MAX_CHUNK_SIZE
        {
            return Err(XdpError::InvalidArgument(
                "chunk_size must be a power of two in [2^12, 2^16]",
            ));
        }
        if headroom >= chunk_size {
            return Err(XdpError::InvalidArgument("headroom must be < chunk_size"));
        }
        if total_size < chunk_size as usize {
            return Err(XdpError::InvalidArgument(
                "total_size must be >= chunk_size",
            ));
        }

        // I5: truncate to a whole number of chunks; the trailing partial
        // chunk is never addressable.
        let chunk_count = (total_size / chunk_size as usize) as u32;
        let mapped_len = chunk_count as usize * chunk_size as usize;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let layout = Layout::from_size_align(mapped_len, page_size)
            .map_err(|_| XdpError::InvalidArgument("UMEM size/alignment overflow"))?;

        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            return Err(XdpError::Resource);
        }

        let area = unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(raw, mapped_len)) };

        let config = XskUmemConfig {
            frame_size: chunk_size,
            headroom,
            ..XskUmemConfig::default()
        };

        let inner = unsafe { XskUmem::new(config, area) }.map_err(|_| {
            unsafe { dealloc(raw, layout) };
            XdpError::Resource
        })?;

        Ok(Umem {
            inner: Arc::new(inner),
            area,
            chunk_size,
            headroom,
            chunk_count,
            layout,
        })
    }

    /// Obtain a new handle sharing this UMEM's backing memory and kernel
    /// registration (I6/I7: refcount only reaches zero once every sharer,
    /// including this one, is dropped).
    pub fn share(&self) -> Self {
        self.clone()
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub(crate) fn inner(&self) -> &Arc<XskUmem> {
        &self.inner
    }

    pub(crate) fn device_control(&self) -> &XskDeviceControl {
        &self.inner.devices
    }

    /// Current number of handles (sockets) sharing this UMEM.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// A pointer to chunk `index`'s bytes, or `None` if out of range.
    pub fn chunk(&self, index: u32) -> Option<NonNull<[u8]>> {
        if index >= self.chunk_count {
            return None;
        }
        let base = self.area.as_ptr() as *mut u8;
        let offset = index as usize * self.chunk_size as usize;
        let slice = core::ptr::slice_from_raw_parts_mut(
            unsafe { base.add(offset) },
            self.chunk_size as usize,
        );
        Some(unsafe { NonNull::new_unchecked(slice) })
    }

    /// Pack a chunk index and an in-chunk byte offset into the 64-bit
    /// descriptor address field: high 16 bits in-chunk offset, low 48 bits
    /// chunk-relative byte offset from UMEM start.
    pub fn pack_addr(&self, chunk_index: u32, in_chunk_offset: u16) -> u64 {
        let chunk_offset = chunk_index as u64 * self.chunk_size as u64;
        ((in_chunk_offset as u64) << 48) | chunk_offset
    }

    /// Inverse of [`Self::pack_addr`], validating that the result lands
    /// inside a registered, whole chunk.
    pub fn unpack_addr(&self, addr: u64) -> Result<(u32, u16), XdpError> {
        let in_chunk_offset = (addr >> 48) as u16;
        let chunk_offset = addr & 0x0000_FFFF_FFFF_FFFF;

        if chunk_offset % self.chunk_size as u64 != 0 {
            return Err(XdpError::InvalidArgument("address not chunk-aligned"));
        }

        let chunk_index = (chunk_offset / self.chunk_size as u64) as u32;
        if chunk_index >= self.chunk_count || in_chunk_offset as u32 >= self.chunk_size {
            return Err(XdpError::InvalidArgument("address outside registered UMEM"));
        }

        Ok((chunk_index, in_chunk_offset))
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        // Only the last handle (I6/I7) actually owns the allocation; the
        // kernel registration itself is released when `XskUmem`'s socket fd
        // closes, which happens when the inner `Arc` hits zero.
        if Arc::strong_count(&self.inner) == 1 {
            unsafe { dealloc(self.area.as_ptr() as *mut u8, self.layout) };
        }
    }
}

#[cfg(test)]
impl Umem {
    /// A UMEM-shaped fixture for tests that exercise chunk addressing
    /// without a live `AF_XDP` socket: same layout and address-packing
    /// rules as [`Self::register`], backed by a fake, never-dereferenced
    /// file descriptor instead of a real `socket(AF_XDP, ...)`.
    pub(crate) fn new_for_test(total_size: usize, chunk_size: u32, headroom: u32) -> Self {
        let chunk_count = (total_size / chunk_size as usize) as u32;
        let mapped_len = chunk_count as usize * chunk_size as usize;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let layout = Layout::from_size_align(mapped_len, page_size).expect("layout");
        let raw = unsafe { alloc_zeroed(layout) };
        assert!(!raw.is_null(), "allocation failure");
        let area =
            unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(raw, mapped_len)) };

        let inner = XskUmem {
            umem_area: area,
            config: XskUmemConfig {
                frame_size: chunk_size,
                headroom,
                ..XskUmemConfig::default()
            },
            fd: Arc::new(crate::xsk::SocketFd(-1)),
            devices: XskDeviceControl::default(),
        };

        Umem {
            inner: Arc::new(inner),
            area,
            chunk_size,
            headroom,
            chunk_count,
            layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_chunk() {
        let err = Umem::register(1 << 20, 3000, 0).unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_headroom_ge_chunk_size() {
        let err = Umem::register(1 << 20, 1 << 12, 1 << 12).unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let umem = Umem::new_for_test(1 << 16, 1 << 12, 8);
        for chunk_index in [0u32, 1, 3, 15] {
            for in_chunk_offset in [0u16, 8, 4095] {
                let addr = umem.pack_addr(chunk_index, in_chunk_offset);
                assert_eq!(umem.unpack_addr(addr).unwrap(), (chunk_index, in_chunk_offset));
            }
        }
    }

    #[test]
    fn unpack_rejects_unaligned_or_out_of_range_addr() {
        let umem = Umem::new_for_test(1 << 16, 1 << 12, 8);
        // Not a multiple of the chunk size.
        assert!(umem.unpack_addr(1).is_err());
        // Past the last registered chunk.
        let past_end = umem.pack_addr(16, 0);
        assert!(umem.unpack_addr(past_end).is_err());
    }
}
