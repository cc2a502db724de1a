//! Interface binding: maps a bound socket's configured rings and
//! attaches them to it, behind a narrow [`InterfaceProvider`] seam so the
//! bind -> map-rings -> attach sequence is swappable in tests without a
//! real interface: open a queue, get notified, flush.
use crate::error::XdpError;
use crate::socket::Socket;
use crate::umem::Umem;
use crate::xsk::{self, XskUser};

/// Which of a socket's four rings to map, taken from its `set_ring_size`
/// configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingSizes {
    pub rx: Option<u32>,
    pub tx: Option<u32>,
    pub fill: Option<u32>,
    pub completion: Option<u32>,
}

/// Whichever rings a socket's configuration called for, ready to hand to
/// [`Socket::attach_rings`].
#[derive(Default)]
pub struct OpenedQueue {
    pub device: Option<xsk::XskDeviceQueue>,
    pub rx: Option<xsk::XskRxRing>,
    pub tx: Option<xsk::XskTxRing>,
}

/// Abstracts the part of activation that actually touches a kernel (or
/// fake) interface: mapping the rings a bound socket asked for. Everything
/// above this trait — the state machine, the sockopt surface, the
/// inspection engine — is backend-agnostic.
pub trait InterfaceProvider: Send + Sync {
    fn open_queue(&self, umem: &Umem, user: &XskUser, sizes: RingSizes) -> Result<OpenedQueue, XdpError>;
}

/// The real Linux `AF_XDP` backend: `mmap`s whichever rings were
/// configured, using the bind path's own ring-mapping sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxXdpProvider;

impl InterfaceProvider for LinuxXdpProvider {
    fn open_queue(&self, umem: &Umem, user: &XskUser, sizes: RingSizes) -> Result<OpenedQueue, XdpError> {
        let xsk_umem: &xsk::XskUmem = umem.inner().as_ref();

        let device = if sizes.fill.is_some() || sizes.completion.is_some() {
            Some(xsk_umem.fq_cq(&user.socket).map_err(XdpError::from)?)
        } else {
            None
        };

        let rx = match sizes.rx {
            Some(count) => {
                // Safety: `user.socket.fd`/`user.map` were obtained together
                // from the same `bind` call that produced `user`.
                let ring = unsafe { xsk::XskRingCons::rx(&user.socket.fd, &user.map, count) }
                    .map_err(|_| XdpError::Resource)?;
                Some(xsk::XskRxRing {
                    ring,
                    fd: user.socket.fd.clone(),
                })
            }
            None => None,
        };

        let tx = match sizes.tx {
            Some(count) => {
                let ring = unsafe { xsk::XskRingProd::tx(&user.socket.fd, &user.map, count) }
                    .map_err(|_| XdpError::Resource)?;
                Some(xsk::XskTxRing {
                    ring,
                    fd: user.socket.fd.clone(),
                })
            }
            None => None,
        };

        Ok(OpenedQueue { device, rx, tx })
    }
}

/// Drive `socket` from `BOUND` through to having its rings attached:
/// `activate()`, then whatever `provider` does to turn its configured ring
/// sizes into real rings, then `attach_rings()`. Kept as a free function
/// rather than a `Socket` method so callers can supply a fake provider in
/// tests without `Socket` itself needing to know about `InterfaceProvider`.
pub fn open_and_attach(provider: &dyn InterfaceProvider, socket: &Socket) -> Result<(), XdpError> {
    socket.activate()?;

    let umem = socket.umem_handle().ok_or(XdpError::InvalidState)?;
    let user = socket.bound_user().ok_or(XdpError::InvalidState)?;
    let (rx, tx, fill, completion) = socket.configured_ring_sizes();

    let opened = provider.open_queue(&umem, &user, RingSizes { rx, tx, fill, completion })?;
    socket.attach_rings(opened.device, opened.rx, opened.tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xsk::IfInfo;

    #[test]
    fn open_and_attach_rejects_unbound_socket() {
        let socket = Socket::new(IfInfo::invalid());
        let err = open_and_attach(&LinuxXdpProvider, &socket).unwrap_err();
        assert!(matches!(err, XdpError::InvalidState));
    }
}
