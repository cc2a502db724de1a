//! Command dispatch: a tagged handle over the three kinds of object this
//! crate hands out, and the request/response surface `xdpctl` (or any other
//! external control-plane caller) drives them through — every socket and
//! interface operation collapsed onto one `dispatch` method per handle kind
//! instead of a numeric opcode switch, since nothing here actually crosses a
//! `/dev` file boundary.
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::XdpError;
use crate::offload::{OffloadHandle, OffloadRegistry, QeoConnection, RssCapabilities, RssConfiguration};
use crate::program::{Program, ProgramKey, ProgramRegistry};
use crate::socket::{
    BindFlags, HookId, PollMode, RingDirection, RingError, RingInfo, Socket, SocketStats,
    UdpChecksumTxCapabilities,
};
use crate::xsk::IfInfo;

/// Which kind of object a [`Handle`] was opened against — carried alongside
/// every handle so a caller (or a debug `Display`) can tell the three
/// apart without matching on the enum itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Program,
    Socket,
    Interface,
}

/// The API version this dispatch surface implements. A caller negotiating
/// against an older or newer major version should treat the handle as
/// unusable rather than risk misinterpreting its command set.
pub const API_VERSION_MAJOR: u16 = 1;
pub const API_VERSION_MINOR: u16 = 0;

/// Identifies one command's target and version, independent of its
/// payload — the fixed part of every request ("ioctl header"
/// every command shares ahead of its variable-length payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub major: u16,
    pub minor: u16,
    pub object_type: ObjectType,
}

impl CommandHeader {
    fn for_object(object_type: ObjectType) -> Self {
        CommandHeader {
            major: API_VERSION_MAJOR,
            minor: API_VERSION_MINOR,
            object_type,
        }
    }

    /// Whether a request built against `self` is dispatchable by this
    /// binary's implementation: same major version, caller's minor no
    /// newer than what this binary understands.
    pub fn is_compatible_with(&self, header: &CommandHeader) -> bool {
        self.major == header.major && self.minor >= header.minor
    }
}

/// A request against a socket handle.
pub enum SocketCommand {
    Bind { queue_id: u32, flags: BindFlags },
    SetRingSize { rx: Option<u32>, tx: Option<u32>, fill: Option<u32>, completion: Option<u32> },
    SetHookId { rx: Option<HookId>, tx: Option<HookId> },
    SetPollMode(PollMode),
    SetUdpChecksumOffload(bool),
    Activate,
    GetStatistics,
    GetRingError(RingDirection),
    GetRingInfo,
    GetUdpChecksumTxCapabilities,
    GetRxProcessorAffinity,
    GetTxProcessorAffinity,
    GetTxFrameLayoutExtension,
    GetTxFrameChecksumExtension,
    Notify { timeout: Option<core::time::Duration> },
}

/// A request against an interface handle: `OFFLOAD_RSS_GET`/`OFFLOAD_RSS_SET`/
/// `OFFLOAD_RSS_GET_CAPABILITIES`/`OFFLOAD_QEO_SET`.
pub enum InterfaceCommand {
    RssGet,
    RssGetCapabilities,
    RssSet(RssConfiguration),
    RssClear,
    QeoSet(Vec<QeoConnection>),
}

/// A request against a program handle.
pub enum ProgramCommand {
    Get,
    Delete,
}

/// What a successful [`Handle::dispatch`]-family call hands back. Only one
/// variant is ever populated per call; callers match on the command they
/// sent, not on this enum, the same way a typed `ioctl` wrapper would.
#[derive(Clone)]
pub enum Response {
    Unit,
    Statistics(SocketStats),
    RingError(RingError),
    RssConfiguration(Option<RssConfiguration>),
    RssCapabilities(RssCapabilities),
    Program(Arc<Program>),
    RingInfo([Option<RingInfo>; 4]),
    UdpChecksumTxCapabilities(UdpChecksumTxCapabilities),
    ProcessorAffinity(bool),
    FrameExtensionOffset(u16),
    /// A pending async notification; the caller polls the socket's own
    /// notify future for completion — dispatch only starts the poke, it
    /// does not block.
    Pending,
}

// `Program` (and, through it, `Action::Redirect(Socket)`) has no `Debug`
// impl, so this is written by hand rather than derived; the `Program`
// variant is named rather than dumped.
impl core::fmt::Debug for Response {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Response::Unit => write!(f, "Unit"),
            Response::Statistics(stats) => write!(f, "Statistics({stats:?})"),
            Response::RingError(err) => write!(f, "RingError({err:?})"),
            Response::RssConfiguration(config) => write!(f, "RssConfiguration({config:?})"),
            Response::RssCapabilities(caps) => write!(f, "RssCapabilities({caps:?})"),
            Response::Program(program) => write!(f, "Program(if_index={})", program.if_index),
            Response::RingInfo(info) => write!(f, "RingInfo({info:?})"),
            Response::UdpChecksumTxCapabilities(caps) => {
                write!(f, "UdpChecksumTxCapabilities({caps:?})")
            }
            Response::ProcessorAffinity(changed) => write!(f, "ProcessorAffinity({changed})"),
            Response::FrameExtensionOffset(offset) => write!(f, "FrameExtensionOffset({offset})"),
            Response::Pending => write!(f, "Pending"),
        }
    }
}

/// A tagged reference to one live object: a socket, an interface's
/// offload/RSS state, or one attached program. This is the thing `xdpctl`
/// (or any other control-plane caller) actually holds and dispatches
/// commands through.
pub enum Handle {
    Socket(Socket),
    Interface {
        info: IfInfo,
        offload: Arc<OffloadRegistry>,
    },
    Program {
        registry: Arc<ProgramRegistry>,
        key: ProgramKey,
    },
}

impl Handle {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Handle::Socket(_) => ObjectType::Socket,
            Handle::Interface { .. } => ObjectType::Interface,
            Handle::Program { .. } => ObjectType::Program,
        }
    }

    pub fn header(&self) -> CommandHeader {
        CommandHeader::for_object(self.object_type())
    }

    /// `PROGRAM_OPEN`: wrap an already-created program's key as a handle a
    /// caller can issue further `ProgramCommand`s against.
    pub fn open_program(registry: Arc<ProgramRegistry>, key: ProgramKey) -> Self {
        Handle::Program { registry, key }
    }

    /// `XSK_OPEN`: wrap a socket object (already `CREATED`) as a handle.
    pub fn open_socket(socket: Socket) -> Self {
        Handle::Socket(socket)
    }

    /// `INTERFACE_OPEN`: wrap a resolved interface plus the offload
    /// registry it shares with every other handle opened against the same
    /// interface.
    pub fn open_interface(info: IfInfo, offload: Arc<OffloadRegistry>) -> Self {
        Handle::Interface { info, offload }
    }

    pub fn dispatch_socket(&self, command: SocketCommand) -> Result<Response, XdpError> {
        let Handle::Socket(socket) = self else {
            return Err(XdpError::InvalidArgument("command requires a socket handle"));
        };

        match command {
            SocketCommand::Bind { queue_id, flags } => {
                socket.bind(queue_id, flags)?;
                Ok(Response::Unit)
            }
            SocketCommand::SetRingSize { rx, tx, fill, completion } => {
                socket.set_ring_size(rx, tx, fill, completion)?;
                Ok(Response::Unit)
            }
            SocketCommand::SetHookId { rx, tx } => {
                socket.set_hook_id(rx, tx)?;
                Ok(Response::Unit)
            }
            SocketCommand::SetPollMode(mode) => {
                socket.set_poll_mode(mode)?;
                Ok(Response::Unit)
            }
            SocketCommand::SetUdpChecksumOffload(enabled) => {
                socket.set_offload_udp_checksum_tx(enabled)?;
                Ok(Response::Unit)
            }
            SocketCommand::Activate => {
                crate::provider::open_and_attach(&crate::provider::LinuxXdpProvider, socket)?;
                Ok(Response::Unit)
            }
            SocketCommand::GetStatistics => Ok(Response::Statistics(socket.statistics())),
            SocketCommand::GetRingError(direction) => {
                Ok(Response::RingError(socket.ring_error(direction)))
            }
            SocketCommand::GetRingInfo => Ok(Response::RingInfo(socket.ring_info()?)),
            SocketCommand::GetUdpChecksumTxCapabilities => Ok(Response::UdpChecksumTxCapabilities(
                socket.udp_checksum_tx_capabilities()?,
            )),
            SocketCommand::GetRxProcessorAffinity => {
                Ok(Response::ProcessorAffinity(socket.rx_processor_affinity()?))
            }
            SocketCommand::GetTxProcessorAffinity => {
                Ok(Response::ProcessorAffinity(socket.tx_processor_affinity()?))
            }
            SocketCommand::GetTxFrameLayoutExtension => {
                Ok(Response::FrameExtensionOffset(socket.tx_frame_layout_extension()?))
            }
            SocketCommand::GetTxFrameChecksumExtension => {
                Ok(Response::FrameExtensionOffset(socket.tx_frame_checksum_extension()?))
            }
            SocketCommand::Notify { timeout } => {
                socket.require_activated()?;
                let _ = timeout;
                // Real completion happens through `crate::notify`'s future;
                // dispatch only reports that the poke was accepted.
                Ok(Response::Pending)
            }
        }
    }

    pub fn dispatch_interface(&self, command: InterfaceCommand) -> Result<Response, XdpError> {
        let Handle::Interface { info, offload } = self else {
            return Err(XdpError::InvalidArgument("command requires an interface handle"));
        };
        let if_index = info.ifindex();

        match command {
            InterfaceCommand::RssGet => Ok(Response::RssConfiguration(offload.rss_get(if_index))),
            InterfaceCommand::RssGetCapabilities => {
                Ok(Response::RssCapabilities(offload.rss_capabilities(if_index)))
            }
            InterfaceCommand::RssSet(config) => {
                let handle = offload.rss_set(if_index, config)?;
                // Installed offload outlives this single dispatch call; a
                // caller that wants it reverted must keep the handle and
                // drop it later. Leaking it here (rather than dropping it
                // immediately, which would revert the install before the
                // caller ever observes it) is the one place this module
                // collapses a handle into a bare response.
                core::mem::forget(handle);
                Ok(Response::Unit)
            }
            InterfaceCommand::RssClear => {
                offload.rss_clear(if_index);
                Ok(Response::Unit)
            }
            InterfaceCommand::QeoSet(connections) => {
                let handle = offload.qeo_set(if_index, connections)?;
                core::mem::forget(handle);
                Ok(Response::Unit)
            }
        }
    }

    /// Same as [`Self::dispatch_interface`]'s `RssSet`/`QeoSet` arms, but
    /// returns the live [`OffloadHandle`] instead of discarding it — for
    /// callers (like `xdpctl`) that want revert-on-drop semantics rather
    /// than a fire-and-forget install.
    pub fn install_rss(&self, config: RssConfiguration) -> Result<OffloadHandle, XdpError> {
        let Handle::Interface { info, offload } = self else {
            return Err(XdpError::InvalidArgument("command requires an interface handle"));
        };
        offload.rss_set(info.ifindex(), config)
    }

    pub fn install_qeo(&self, connections: Vec<QeoConnection>) -> Result<OffloadHandle, XdpError> {
        let Handle::Interface { info, offload } = self else {
            return Err(XdpError::InvalidArgument("command requires an interface handle"));
        };
        offload.qeo_set(info.ifindex(), connections)
    }

    pub fn dispatch_program(&self, command: ProgramCommand) -> Result<Response, XdpError> {
        let Handle::Program { registry, key } = self else {
            return Err(XdpError::InvalidArgument("command requires a program handle"));
        };

        match command {
            ProgramCommand::Get => registry.get(key).map(Response::Program).ok_or(XdpError::NotFound),
            ProgramCommand::Delete => {
                registry.delete(key)?;
                Ok(Response::Unit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::rss_hash_type;
    use crate::program::CreateFlags;

    fn rss_config() -> RssConfiguration {
        RssConfiguration {
            hash_type: rss_hash_type::IPV4_UDP,
            hash_secret_key: alloc::vec![0u8; 16],
            indirection_table: alloc::vec![0, 1, 2, 3],
        }
    }

    #[test]
    fn socket_command_rejected_on_non_socket_handle() {
        let handle = Handle::open_interface(IfInfo::invalid(), OffloadRegistry::new());
        let err = handle.dispatch_socket(SocketCommand::Activate).unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
    }

    #[test]
    fn interface_rss_round_trips_through_dispatch() {
        let handle = Handle::open_interface(IfInfo::invalid(), OffloadRegistry::new());
        handle
            .dispatch_interface(InterfaceCommand::RssSet(rss_config()))
            .unwrap();

        match handle.dispatch_interface(InterfaceCommand::RssGet).unwrap() {
            Response::RssConfiguration(Some(got)) => assert_eq!(got, rss_config()),
            other => panic!("unexpected response: {other:?}"),
        }

        handle.dispatch_interface(InterfaceCommand::RssClear).unwrap();
        match handle.dispatch_interface(InterfaceCommand::RssGet).unwrap() {
            Response::RssConfiguration(None) => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn install_rss_reverts_on_drop() {
        let handle = Handle::open_interface(IfInfo::invalid(), OffloadRegistry::new());
        let installed = handle.install_rss(rss_config()).unwrap();
        match handle.dispatch_interface(InterfaceCommand::RssGet).unwrap() {
            Response::RssConfiguration(Some(got)) => assert_eq!(got, rss_config()),
            other => panic!("unexpected response: {other:?}"),
        }

        drop(installed);
        match handle.dispatch_interface(InterfaceCommand::RssGet).unwrap() {
            Response::RssConfiguration(None) => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn program_get_round_trips_through_dispatch() {
        let registry = Arc::new(ProgramRegistry::new());
        let outcome = registry.create(1, HookId::RX_INSPECT, 0, CreateFlags::default(), Vec::new());
        let handle = Handle::open_program(registry.clone(), outcome.key);

        match handle.dispatch_program(ProgramCommand::Get).unwrap() {
            Response::Program(program) => assert_eq!(program.if_index, 1),
            other => panic!("unexpected response: {other:?}"),
        }

        handle.dispatch_program(ProgramCommand::Delete).unwrap();
        let err = handle.dispatch_program(ProgramCommand::Get).unwrap_err();
        assert!(matches!(err, XdpError::NotFound));
    }

    #[test]
    fn ring_info_dispatches_through_socket_handle() {
        let socket = Socket::new_loopback_target(8, 16);
        let handle = Handle::open_socket(socket);

        match handle.dispatch_socket(SocketCommand::GetRingInfo).unwrap() {
            Response::RingInfo(info) => assert_eq!(info[0].unwrap().size, 8),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn ring_error_dispatches_to_the_requested_direction() {
        let socket = Socket::new_loopback_target(8, 16);
        socket.mark_detached();
        let handle = Handle::open_socket(socket);

        for direction in [
            RingDirection::Rx,
            RingDirection::RxFill,
            RingDirection::Tx,
            RingDirection::TxCompletion,
        ] {
            match handle.dispatch_socket(SocketCommand::GetRingError(direction)).unwrap() {
                Response::RingError(err) => assert_eq!(err, RingError::InterfaceDetach),
                other => panic!("unexpected response: {other:?}"),
            }
        }
    }

    #[test]
    fn udp_checksum_tx_capabilities_dispatches_through_socket_handle() {
        let socket = Socket::new_loopback_target(8, 16);
        let handle = Handle::open_socket(socket);

        match handle.dispatch_socket(SocketCommand::GetUdpChecksumTxCapabilities).unwrap() {
            Response::UdpChecksumTxCapabilities(caps) => assert!(caps.supported),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn header_compatibility_requires_same_major() {
        let current = CommandHeader::for_object(ObjectType::Socket);
        let older_minor = CommandHeader {
            major: API_VERSION_MAJOR,
            minor: 0,
            object_type: ObjectType::Socket,
        };
        assert!(current.is_compatible_with(&older_minor));

        let newer_major = CommandHeader {
            major: API_VERSION_MAJOR + 1,
            minor: 0,
            object_type: ObjectType::Socket,
        };
        assert!(!current.is_compatible_with(&newer_major));
    }
}
