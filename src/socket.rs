//! Socket object: per-socket state machine, four-ring lifecycle, and
//! sockopt surface.
use alloc::sync::Arc;

use spin::RwLock;

use crate::error::XdpError;
use crate::umem::Umem;
use crate::xdp::XdpDesc;
use crate::xsk::{self, ring_flags, IfInfo, XskSocketConfig, XskUser};

/// Byte offset of the `TX_FRAME_LAYOUT_EXTENSION` (fragment count/layout
/// bits) within a frame descriptor's extension area, immediately after the
/// 16-byte buffer descriptor. Extensions are positioned by a negotiated
/// `element_stride`.
pub const TX_FRAME_LAYOUT_EXTENSION_OFFSET: u16 = 16;
/// Byte offset of the `TX_FRAME_CHECKSUM_EXTENSION`, immediately after the
/// 4-byte layout extension.
pub const TX_FRAME_CHECKSUM_EXTENSION_OFFSET: u16 = 20;

/// Where a program attaches relative to the datapath (hookid.h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookLayer {
    L2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookDirection {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookSublayer {
    Inspect,
    Inject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HookId {
    pub layer: HookLayer,
    pub direction: HookDirection,
    pub sublayer: HookSublayer,
}

impl HookId {
    pub const RX_INSPECT: HookId = HookId {
        layer: HookLayer::L2,
        direction: HookDirection::Rx,
        sublayer: HookSublayer::Inspect,
    };
}

/// `CREATED -> CONFIGURED -> BOUND -> ACTIVATED -> {terminal}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Configured,
    Bound,
    Activated,
    DetachedInterface,
    InvalidRing,
    Closed,
}

impl SocketState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            SocketState::DetachedInterface | SocketState::InvalidRing | SocketState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Default,
    Busy,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    NoError,
    InterfaceDetach,
    InvalidRing,
}

/// Selects which of the four per-direction ring-error get-sockopts
/// (`RX_ERROR`, `RX_FILL_ERROR`, `TX_ERROR`, `TX_COMPLETION_ERROR`) a query
/// asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDirection {
    Rx,
    RxFill,
    Tx,
    TxCompletion,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SocketStats {
    pub rx_dropped: u64,
    pub rx_truncated: u64,
    pub rx_invalid_desc: u64,
    pub tx_invalid_desc: u64,
}

/// Mode requested by `bind`. `Default` lets the kernel choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Default,
    Generic,
    Native,
}

#[derive(Debug, Clone, Copy)]
pub struct BindFlags {
    pub rx: bool,
    pub tx: bool,
    pub mode: BindMode,
}

/// Per-ring geometry as returned by the `RING_INFO` get-sockopt.
#[derive(Debug, Clone, Copy)]
pub struct RingInfo {
    pub size: u32,
    pub element_stride: u32,
}

/// Reported by the `OFFLOAD_UDP_CHECKSUM_TX_CAPABILITIES` get-sockopt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpChecksumTxCapabilities {
    pub supported: bool,
}

struct Config {
    rx_ring_size: Option<u32>,
    tx_ring_size: Option<u32>,
    fill_ring_size: Option<u32>,
    comp_ring_size: Option<u32>,
    rx_hook: Option<HookId>,
    tx_hook: Option<HookId>,
    poll_mode: PollMode,
    offload_udp_checksum_tx: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rx_ring_size: None,
            tx_ring_size: None,
            fill_ring_size: None,
            comp_ring_size: None,
            rx_hook: None,
            tx_hook: None,
            poll_mode: PollMode::Default,
            offload_udp_checksum_tx: false,
        }
    }
}

struct Inner {
    state: SocketState,
    info: IfInfo,
    umem: Option<Umem>,
    config: Config,
    stats: SocketStats,
    rx_error: RingError,
    rx_fill_error: RingError,
    tx_error: RingError,
    tx_completion_error: RingError,
    user: Option<XskUser>,
    device: Option<xsk::XskDeviceQueue>,
    rx: Option<xsk::XskRxRing>,
    tx: Option<xsk::XskTxRing>,
}

/// A control-plane AF_XDP socket: the state machine and sockopt surface of
/// , layered over the raw [`crate::xsk`] binding.
///
/// Cloning a `Socket` shares the same underlying state (`Arc`); this is
/// what lets [`crate::program::Action::Redirect`] hold a live reference to
/// a target socket without owning it exclusively.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<RwLock<Inner>>,
}

impl Socket {
    /// `CREATED`: allocate a socket against an interface, with no UMEM yet.
    pub fn new(info: IfInfo) -> Self {
        Socket {
            inner: Arc::new(RwLock::new(Inner {
                state: SocketState::Created,
                info,
                umem: None,
                config: Config::default(),
                stats: SocketStats::default(),
                rx_error: RingError::NoError,
                rx_fill_error: RingError::NoError,
                tx_error: RingError::NoError,
                tx_completion_error: RingError::NoError,
                user: None,
                device: None,
                rx: None,
                tx: None,
            })),
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.read().state
    }

    fn require(&self, allowed: &[SocketState]) -> Result<(), XdpError> {
        let state = self.inner.read().state;
        if state.is_terminal() {
            return Err(terminal_error(state));
        }
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(XdpError::InvalidState)
        }
    }

    /// `set_umem_reg`: CREATED -> CONFIGURED(UMEM).
    pub fn set_umem_reg(&self, umem: Umem) -> Result<(), XdpError> {
        self.require(&[SocketState::Created])?;
        let mut inner = self.inner.write();
        inner.umem = Some(umem);
        inner.state = SocketState::Configured;
        Ok(())
    }

    /// `share_umem(src)`: CREATED -> CONFIGURED(shared). I8: a socket that
    /// shares cannot also own a separate registration.
    pub fn share_umem(&self, source: &Socket) -> Result<(), XdpError> {
        self.require(&[SocketState::Created])?;
        let shared = {
            let src = source.inner.read();
            src.umem.clone().ok_or(XdpError::InvalidState)?
        };
        let mut inner = self.inner.write();
        inner.umem = Some(shared.share());
        inner.state = SocketState::Configured;
        Ok(())
    }

    pub fn set_ring_size(
        &self,
        rx: Option<u32>,
        tx: Option<u32>,
        fill: Option<u32>,
        completion: Option<u32>,
    ) -> Result<(), XdpError> {
        self.require(&[SocketState::Configured])?;
        for size in [rx, tx, fill, completion].into_iter().flatten() {
            if !size.is_power_of_two() {
                return Err(XdpError::InvalidArgument("ring size must be power of two"));
            }
        }
        let mut inner = self.inner.write();
        if rx.is_some() {
            inner.config.rx_ring_size = rx;
        }
        if tx.is_some() {
            inner.config.tx_ring_size = tx;
        }
        if fill.is_some() {
            inner.config.fill_ring_size = fill;
        }
        if completion.is_some() {
            inner.config.comp_ring_size = completion;
        }
        Ok(())
    }

    pub fn set_hook_id(&self, rx: Option<HookId>, tx: Option<HookId>) -> Result<(), XdpError> {
        self.require(&[SocketState::Configured])?;
        let mut inner = self.inner.write();
        if rx.is_some() {
            inner.config.rx_hook = rx;
        }
        if tx.is_some() {
            inner.config.tx_hook = tx;
        }
        Ok(())
    }

    pub fn set_poll_mode(&self, mode: PollMode) -> Result<(), XdpError> {
        self.require(&[SocketState::Configured])?;
        self.inner.write().config.poll_mode = mode;
        Ok(())
    }

    pub fn set_offload_udp_checksum_tx(&self, enabled: bool) -> Result<(), XdpError> {
        self.require(&[SocketState::Bound])?;
        self.inner.write().config.offload_udp_checksum_tx = enabled;
        Ok(())
    }

    /// `bind(if, queue, flags)`: CONFIGURED -> BOUND.
    pub fn bind(&self, queue_id: u32, flags: BindFlags) -> Result<(), XdpError> {
        self.require(&[SocketState::Configured])?;
        if !flags.rx && !flags.tx {
            return Err(XdpError::InvalidArgument("bind requires RX or TX"));
        }

        let mut inner = self.inner.write();
        let umem = inner.umem.clone().ok_or(XdpError::InvalidState)?;

        let mut info = inner.info;
        info.set_queue(queue_id);

        let xsk_umem: &xsk::XskUmem = umem.inner().as_ref();
        let xsk_socket = xsk::XskSocket::with_shared(&info, xsk_umem).map_err(XdpError::from)?;

        let socket_config = XskSocketConfig {
            rx_size: inner.config.rx_ring_size.and_then(core::num::NonZeroU32::new),
            tx_size: inner.config.tx_ring_size.and_then(core::num::NonZeroU32::new),
            bind_flags: 0,
        };

        let user = xsk_umem
            .bind(&xsk_socket, &socket_config)
            .map_err(XdpError::from)?;

        inner.user = Some(user);
        inner.state = SocketState::Bound;
        Ok(())
    }

    /// `activate(flags)`: BOUND -> ACTIVATED. Requires a sized ring for
    /// each bound direction and, when RX is bound, a populated RX-fill
    /// ring (checked by the caller having called `fill` before this).
    pub fn activate(&self) -> Result<(), XdpError> {
        self.require(&[SocketState::Bound])?;
        let mut inner = self.inner.write();

        let has_rx = inner.config.rx_ring_size.is_some();
        let has_tx = inner.config.tx_ring_size.is_some();
        if !has_rx && !has_tx {
            return Err(XdpError::InvalidState);
        }
        if has_rx && inner.config.fill_ring_size.is_none() {
            return Err(XdpError::InvalidState);
        }
        if has_tx && inner.config.comp_ring_size.is_none() {
            return Err(XdpError::InvalidState);
        }

        inner.state = SocketState::Activated;
        Ok(())
    }

    /// Hand the socket its mapped device queue and/or RX/TX rings once
    /// `activate` has succeeded. Split out from `activate` itself because
    /// mapping the rings is an [`crate::provider::InterfaceProvider`]'s job,
    /// not this state machine's — see
    /// [`crate::provider::open_and_attach`].
    pub fn attach_rings(
        &self,
        device: Option<xsk::XskDeviceQueue>,
        rx: Option<xsk::XskRxRing>,
        tx: Option<xsk::XskTxRing>,
    ) -> Result<(), XdpError> {
        self.require(&[SocketState::Activated])?;
        let mut inner = self.inner.write();
        inner.device = device;
        inner.rx = rx;
        inner.tx = tx;
        Ok(())
    }

    /// The `XskUser` obtained by `bind`, if any — what an
    /// [`crate::provider::InterfaceProvider`] needs to map this socket's
    /// rings.
    pub(crate) fn bound_user(&self) -> Option<XskUser> {
        self.inner.read().user.clone()
    }

    pub(crate) fn umem_handle(&self) -> Option<Umem> {
        self.inner.read().umem.clone()
    }

    /// `(rx, tx, fill, completion)` ring sizes as configured by
    /// `set_ring_size`, for a provider to know which of this socket's four
    /// rings to map.
    pub(crate) fn configured_ring_sizes(&self) -> (Option<u32>, Option<u32>, Option<u32>, Option<u32>) {
        let inner = self.inner.read();
        (
            inner.config.rx_ring_size,
            inner.config.tx_ring_size,
            inner.config.fill_ring_size,
            inner.config.comp_ring_size,
        )
    }

    pub(crate) fn with_rx<R>(&self, f: impl FnOnce(&mut xsk::XskRxRing) -> R) -> Option<R> {
        self.inner.write().rx.as_mut().map(f)
    }

    pub(crate) fn with_tx<R>(&self, f: impl FnOnce(&mut xsk::XskTxRing) -> R) -> Option<R> {
        self.inner.write().tx.as_mut().map(f)
    }

    pub(crate) fn with_device<R>(&self, f: impl FnOnce(&mut xsk::XskDeviceQueue) -> R) -> Option<R> {
        self.inner.write().device.as_mut().map(f)
    }

    /// Run `f` against the raw socket fd, if bound. Used by the notify
    /// engine to issue the `sendto`/`recvfrom` pokes and the `poll` wait
    /// directly against the kernel socket.
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(libc::c_int) -> R) -> Option<R> {
        self.inner.read().user.as_ref().map(|u| f(u.socket.fd.0))
    }

    /// `require(ACTIVATED)`, exposed for callers outside this module that
    /// still need to reject out-of-order use with the socket's own terminal
    /// error (propagation policy), e.g. the notify engine.
    pub(crate) fn require_activated(&self) -> Result<(), XdpError> {
        self.require(&[SocketState::Activated])
    }

    pub fn statistics(&self) -> SocketStats {
        self.inner.read().stats
    }

    pub(crate) fn record_drop(&self) {
        self.inner.write().stats.rx_dropped += 1;
    }

    pub(crate) fn record_truncated(&self) {
        self.inner.write().stats.rx_truncated += 1;
    }

    pub fn rx_error(&self) -> RingError {
        self.inner.read().rx_error
    }

    pub fn tx_error(&self) -> RingError {
        self.inner.read().tx_error
    }

    pub fn rx_fill_error(&self) -> RingError {
        self.inner.read().rx_fill_error
    }

    pub fn tx_completion_error(&self) -> RingError {
        self.inner.read().tx_completion_error
    }

    /// Dispatch to whichever of the four per-direction error getters
    /// `direction` names (`RX_ERROR`, `RX_FILL_ERROR`, `TX_ERROR`,
    /// `TX_COMPLETION_ERROR`).
    pub fn ring_error(&self, direction: RingDirection) -> RingError {
        match direction {
            RingDirection::Rx => self.rx_error(),
            RingDirection::RxFill => self.rx_fill_error(),
            RingDirection::Tx => self.tx_error(),
            RingDirection::TxCompletion => self.tx_completion_error(),
        }
    }

    /// `RING_INFO` (get, post-activate): `[rx, tx, fill, completion]`, each
    /// present iff that ring was configured.
    pub fn ring_info(&self) -> Result<[Option<RingInfo>; 4], XdpError> {
        self.require(&[SocketState::Activated])?;
        let inner = self.inner.read();
        let desc_stride = core::mem::size_of::<XdpDesc>() as u32;
        let addr_stride = core::mem::size_of::<u64>() as u32;
        let mk = |size: Option<u32>, element_stride: u32| {
            size.map(|size| RingInfo { size, element_stride })
        };
        Ok([
            mk(inner.config.rx_ring_size, desc_stride),
            mk(inner.config.tx_ring_size, desc_stride),
            mk(inner.config.fill_ring_size, addr_stride),
            mk(inner.config.comp_ring_size, addr_stride),
        ])
    }

    /// `OFFLOAD_UDP_CHECKSUM_TX_CAPABILITIES` (get post-bind): this backend
    /// computes the UDP checksum extension in software, so once a socket is
    /// bound the offload is always reported as supported.
    pub fn udp_checksum_tx_capabilities(&self) -> Result<UdpChecksumTxCapabilities, XdpError> {
        self.require(&[SocketState::Bound, SocketState::Activated])?;
        Ok(UdpChecksumTxCapabilities { supported: true })
    }

    /// `RX_PROCESSOR_AFFINITY` (get post-bind): whether the RX ring's
    /// `AFFINITY_CHANGED` flag was set, clearing it as a side effect of
    /// the query.
    pub fn rx_processor_affinity(&self) -> Result<bool, XdpError> {
        self.require(&[SocketState::Bound, SocketState::Activated])?;
        let inner = self.inner.read();
        Ok(inner
            .rx
            .as_ref()
            .map(|rx| {
                let had = rx.ring.check_flags() & ring_flags::AFFINITY_CHANGED != 0;
                rx.ring.clear_flag(ring_flags::AFFINITY_CHANGED);
                had
            })
            .unwrap_or(false))
    }

    /// `TX_PROCESSOR_AFFINITY`, symmetric to [`Self::rx_processor_affinity`].
    pub fn tx_processor_affinity(&self) -> Result<bool, XdpError> {
        self.require(&[SocketState::Bound, SocketState::Activated])?;
        let inner = self.inner.read();
        Ok(inner
            .tx
            .as_ref()
            .map(|tx| {
                let had = tx.ring.check_flags() & ring_flags::AFFINITY_CHANGED != 0;
                tx.ring.clear_flag(ring_flags::AFFINITY_CHANGED);
                had
            })
            .unwrap_or(false))
    }

    /// `TX_FRAME_LAYOUT_EXTENSION` (get, post-bind, ring-size not yet set,
    /// offload enabled — ).
    pub fn tx_frame_layout_extension(&self) -> Result<u16, XdpError> {
        self.require_extension_query()?;
        Ok(TX_FRAME_LAYOUT_EXTENSION_OFFSET)
    }

    /// `TX_FRAME_CHECKSUM_EXTENSION`, same preconditions as
    /// [`Self::tx_frame_layout_extension`].
    pub fn tx_frame_checksum_extension(&self) -> Result<u16, XdpError> {
        self.require_extension_query()?;
        Ok(TX_FRAME_CHECKSUM_EXTENSION_OFFSET)
    }

    fn require_extension_query(&self) -> Result<(), XdpError> {
        self.require(&[SocketState::Bound])?;
        let inner = self.inner.read();
        if inner.config.tx_ring_size.is_some() {
            return Err(XdpError::InvalidState);
        }
        if !inner.config.offload_udp_checksum_tx {
            return Err(XdpError::NotSupported);
        }
        Ok(())
    }

    /// Mark every ring ERROR and latch `INTERFACE_DETACH` on all four
    /// per-direction error fields (detach protocol).
    pub fn mark_detached(&self) {
        let mut inner = self.inner.write();
        inner.state = SocketState::DetachedInterface;
        inner.rx_error = RingError::InterfaceDetach;
        inner.rx_fill_error = RingError::InterfaceDetach;
        inner.tx_error = RingError::InterfaceDetach;
        inner.tx_completion_error = RingError::InterfaceDetach;
        set_error_flag(&inner);
    }

    pub fn mark_invalid_ring(&self) {
        let mut inner = self.inner.write();
        inner.state = SocketState::InvalidRing;
        inner.rx_error = RingError::InvalidRing;
        inner.tx_error = RingError::InvalidRing;
        set_error_flag(&inner);
    }

    /// Handle close: deactivate, release rings, and drop the UMEM
    /// reference (decrementing its refcount, I6).
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.state = SocketState::Closed;
        inner.rx.take();
        inner.tx.take();
        inner.device.take();
        inner.user.take();
        inner.umem.take();
    }

    /// Whether this socket is a legal [`crate::program::Action::Redirect`]
    /// target right now. `inspect.rs` holds its own reference to the
    /// target's device queue and rings (via [`crate::xsk::XskDeviceQueue`])
    /// and drives the actual fill-to-RX copy directly against them.
    pub(crate) fn is_redirect_target(&self) -> bool {
        self.inner.read().state == SocketState::Activated
    }

    /// Whether `close()` has already been called. A closed socket can never
    /// become a valid [`crate::program::Action::Redirect`] target again, so
    /// rule validation rejects it eagerly.
    pub fn is_closed(&self) -> bool {
        self.inner.read().state == SocketState::Closed
    }

    pub(crate) fn raw_info(&self) -> IfInfo {
        self.inner.read().info
    }

    /// A stable identity for this socket across clones, used to key the
    /// notify engine's per-socket reactor thread registry.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

/// Set the `ERROR` bit on every ring this socket currently
/// holds. Called with `Inner` already write-locked, so it touches the
/// rings directly rather than through `with_rx`/`with_tx`/`with_device`,
/// which would try to re-acquire the same lock.
fn set_error_flag(inner: &Inner) {
    if let Some(rx) = &inner.rx {
        rx.ring.set_flag(ring_flags::ERROR);
    }
    if let Some(tx) = &inner.tx {
        tx.ring.set_flag(ring_flags::ERROR);
    }
    if let Some(device) = &inner.device {
        device.fcq.prod.set_flag(ring_flags::ERROR);
        device.fcq.cons.set_flag(ring_flags::ERROR);
    }
}

fn terminal_error(state: SocketState) -> XdpError {
    match state {
        SocketState::DetachedInterface => XdpError::InterfaceDetached,
        SocketState::InvalidRing => XdpError::InvalidRing,
        _ => XdpError::InvalidState,
    }
}

/// Test-only constructors that fabricate an ACTIVATED socket entirely out
/// of heap-backed rings (no real `AF_XDP` fd, no kernel involvement), so
/// the inspection engine's redirect path is exercisable without a NIC. `pub(crate)` rather than `#[cfg(test)]`
/// alone so other modules' own `#[cfg(test)]` code (e.g. `inspect.rs`'s
/// seed-scenario tests) can reach them too.
#[cfg(test)]
impl Socket {
    /// Build a socket in `ACTIVATED` state with a boxed RX ring of
    /// `rx_size` entries and a device queue whose fill ring already has
    /// `fill_size` entries, all backed by heap allocations rather than an
    /// `mmap`'d kernel region.
    pub(crate) fn new_loopback_target(rx_size: u32, fill_size: u32) -> Self {
        let sock = Socket::new(IfInfo::invalid());
        let mut inner = sock.inner.write();
        inner.state = SocketState::Activated;
        inner.config.rx_ring_size = Some(rx_size);
        inner.config.fill_ring_size = Some(fill_size);

        let fake_fd = || Arc::new(xsk::SocketFd(-1));
        let xsk_socket = xsk::XskSocket {
            fd: fake_fd(),
            info: Arc::new(IfInfo::invalid()),
        };

        inner.rx = Some(xsk::XskRxRing {
            ring: xsk::XskRingCons::new_boxed_rx(rx_size),
            fd: fake_fd(),
        });
        inner.device = Some(xsk::XskDeviceQueue {
            fcq: xsk::XskDeviceRings {
                map: xsk::SocketMmapOffsets::default(),
                prod: xsk::XskRingProd::new_boxed_fill(fill_size),
                cons: xsk::XskRingCons::new_boxed_comp(fill_size),
            },
            socket: xsk_socket,
            devices: xsk::XskDeviceControl::default(),
        });
        drop(inner);
        sock
    }

    /// Populate the loopback target's fill ring with `count` chunk
    /// addresses from `umem`, chunks `0..count`, as an app would before
    /// activating a real socket (activation precondition:
    /// "RX requires ... a populated RX-fill ring").
    pub(crate) fn seed_fill_ring(&self, umem: &Umem, count: u32) {
        self.with_device(|device| {
            let mut writer = device.fill(count);
            let addrs = (0..count).map(|i| umem.pack_addr(i, 0));
            writer.insert(addrs);
            writer.commit();
        });
    }

    /// Drain and return every descriptor currently posted on this
    /// socket's RX ring, for assertions in seed-scenario tests.
    pub(crate) fn drain_rx_for_test(&self) -> alloc::vec::Vec<crate::xdp::XdpDesc> {
        self.with_rx(|rx| {
            let mut reader = rx.receive(u32::MAX);
            let mut out = alloc::vec::Vec::new();
            while let Some(desc) = reader.read() {
                out.push(desc);
            }
            reader.release();
            out
        })
        .unwrap_or_default()
    }

    pub(crate) fn umem_refcount(&self) -> Option<usize> {
        self.inner.read().umem.as_ref().map(|u| u.refcount())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_info() -> IfInfo {
        let mut info = IfInfo::invalid();
        info.set_queue(0);
        info
    }

    #[test]
    fn sockopt_order_rejects_umem_after_ring_size() {
        let sock = Socket::new(fake_info());
        // Ring size can't be set before CONFIGURED.
        let err = sock.set_ring_size(Some(8), None, None, None).unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    #[test]
    fn activate_before_bind_is_rejected() {
        let sock = Socket::new(fake_info());
        let err = sock.activate().unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    #[test]
    fn detach_latches_terminal_state() {
        let sock = Socket::new(fake_info());
        sock.mark_detached();
        assert_eq!(sock.state(), SocketState::DetachedInterface);
        let err = sock.set_poll_mode(PollMode::Busy).unwrap_err();
        assert!(matches!(err, XdpError::InterfaceDetached));
    }

    #[test]
    fn ring_error_dispatches_to_the_named_direction() {
        let sock = Socket::new(fake_info());
        {
            let mut inner = sock.inner.write();
            inner.rx_error = RingError::InterfaceDetach;
            inner.rx_fill_error = RingError::InvalidRing;
            inner.tx_error = RingError::NoError;
            inner.tx_completion_error = RingError::InvalidRing;
        }
        assert_eq!(sock.ring_error(RingDirection::Rx), RingError::InterfaceDetach);
        assert_eq!(sock.ring_error(RingDirection::RxFill), RingError::InvalidRing);
        assert_eq!(sock.ring_error(RingDirection::Tx), RingError::NoError);
        assert_eq!(sock.ring_error(RingDirection::TxCompletion), RingError::InvalidRing);
    }

    #[test]
    fn ring_info_reports_configured_rings_only() {
        let sock = Socket::new_loopback_target(8, 16);
        let info = sock.ring_info().unwrap();
        let rx = info[0].unwrap();
        assert_eq!(rx.size, 8);
        assert_eq!(rx.element_stride, core::mem::size_of::<crate::xdp::XdpDesc>() as u32);
        assert!(info[1].is_none(), "tx ring was never configured");
        let fill = info[2].unwrap();
        assert_eq!(fill.size, 16);
        assert_eq!(fill.element_stride, core::mem::size_of::<u64>() as u32);
        assert!(info[3].is_none(), "completion ring was never configured");
    }

    #[test]
    fn ring_info_rejects_unactivated_socket() {
        let sock = Socket::new(fake_info());
        let err = sock.ring_info().unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    #[test]
    fn rx_processor_affinity_reports_and_clears_flag() {
        let sock = Socket::new_loopback_target(8, 16);
        sock.with_rx(|rx| rx.ring.set_flag(ring_flags::AFFINITY_CHANGED))
            .expect("rx ring is configured");

        assert!(sock.rx_processor_affinity().unwrap());
        // Clearing is a side effect of the query: a second read sees it gone.
        assert!(!sock.rx_processor_affinity().unwrap());
    }

    #[test]
    fn tx_processor_affinity_is_false_without_a_tx_ring() {
        let sock = Socket::new_loopback_target(8, 16);
        assert!(!sock.tx_processor_affinity().unwrap());
    }

    #[test]
    fn affinity_query_rejected_before_bind() {
        let sock = Socket::new(fake_info());
        let err = sock.rx_processor_affinity().unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    #[test]
    fn udp_checksum_tx_capabilities_reports_supported_once_bound() {
        let sock = Socket::new_loopback_target(8, 16);
        assert!(sock.udp_checksum_tx_capabilities().unwrap().supported);
    }

    #[test]
    fn udp_checksum_tx_capabilities_rejected_before_bind() {
        let sock = Socket::new(fake_info());
        let err = sock.udp_checksum_tx_capabilities().unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    #[test]
    fn frame_extension_offsets_require_offload_and_unset_ring_size() {
        let sock = Socket::new(fake_info());
        sock.inner.write().state = SocketState::Bound;
        sock.set_offload_udp_checksum_tx(true).unwrap();

        assert_eq!(sock.tx_frame_layout_extension().unwrap(), TX_FRAME_LAYOUT_EXTENSION_OFFSET);
        assert_eq!(sock.tx_frame_checksum_extension().unwrap(), TX_FRAME_CHECKSUM_EXTENSION_OFFSET);
    }

    #[test]
    fn frame_extension_offsets_rejected_without_offload() {
        let sock = Socket::new(fake_info());
        sock.inner.write().state = SocketState::Bound;

        let err = sock.tx_frame_layout_extension().unwrap_err();
        assert!(matches!(err, XdpError::NotSupported));
    }

    #[test]
    fn frame_extension_offsets_rejected_once_ring_size_is_set() {
        let sock = Socket::new(fake_info());
        {
            let mut inner = sock.inner.write();
            inner.state = SocketState::Bound;
            inner.config.offload_udp_checksum_tx = true;
            inner.config.tx_ring_size = Some(8);
        }

        let err = sock.tx_frame_layout_extension().unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }
}
