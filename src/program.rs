//! Program object: compiled rule lists attached to an interface queue,
//! keyed by `(ifIndex, hook, queueId)`, mirroring the closed
//! `XDP_MATCH_TYPE`/`XDP_RULE_ACTION`/`XDP_RULE` enumerations of the
//! userspace XDP program ABI.
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::epoch::Slot;
use crate::error::XdpError;
use crate::socket::{HookId, Socket};

/// `XDP_QUIC_MAX_CID_LENGTH` (program.h).
pub const QUIC_MAX_CID_LENGTH: usize = 20;
/// `XDP_PORT_SET_BUFFER_SIZE` (program.h): one bit per UDP/TCP port.
pub const PORT_SET_BUFFER_SIZE: usize = (u16::MAX as usize + 1) / 8;

/// Closed match-type enumeration, mirroring program.h `XDP_MATCH_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    All,
    Udp,
    UdpDst,
    Ipv4DstMask,
    Ipv6DstMask,
    QuicFlowSrcCid,
    QuicFlowDstCid,
    Ipv4UdpTuple,
    Ipv6UdpTuple,
    UdpPortSet,
    Ipv4UdpPortSet,
    Ipv6UdpPortSet,
    Ipv4TcpPortSet,
    Ipv6TcpPortSet,
    TcpDst,
    TcpQuicFlowSrcCid,
    TcpQuicFlowDstCid,
    TcpControlDst,
}

/// A validated QUIC connection-id match (`XDP_QUIC_FLOW`): `CidLength` is
/// checked `<= 20` bytes at construction (program.h's documented bound).
#[derive(Debug, Clone)]
pub struct QuicFlow {
    pub udp_port: u16,
    pub cid_offset: u8,
    cid: [u8; QUIC_MAX_CID_LENGTH],
    cid_len: u8,
}

impl QuicFlow {
    pub fn new(udp_port: u16, cid_offset: u8, cid: &[u8]) -> Result<Self, XdpError> {
        if cid.len() > QUIC_MAX_CID_LENGTH {
            return Err(XdpError::InvalidArgument(
                "QUIC connection id exceeds 20 bytes",
            ));
        }
        let mut buf = [0u8; QUIC_MAX_CID_LENGTH];
        buf[..cid.len()].copy_from_slice(cid);
        Ok(QuicFlow {
            udp_port,
            cid_offset,
            cid: buf,
            cid_len: cid.len() as u8,
        })
    }

    pub fn cid(&self) -> &[u8] {
        &self.cid[..self.cid_len as usize]
    }
}

/// A validated UDP/TCP port-set bitmap (`XDP_PORT_SET`): the caller's bitmap
/// is copied into kernel-owned storage at creation time so there is no
/// lingering user pointer to race against (TOCTOU note).
#[derive(Debug, Clone)]
pub struct PortSet(Box<[u8; PORT_SET_BUFFER_SIZE]>);

impl PortSet {
    pub fn from_bitmap(bitmap: &[u8]) -> Result<Self, XdpError> {
        if bitmap.len() != PORT_SET_BUFFER_SIZE {
            return Err(XdpError::InvalidArgument(
                "port-set bitmap must be exactly 8192 bytes",
            ));
        }
        let mut owned = Box::new([0u8; PORT_SET_BUFFER_SIZE]);
        owned.copy_from_slice(bitmap);
        Ok(PortSet(owned))
    }

    pub fn contains(&self, port: u16) -> bool {
        let byte = self.0[port as usize / 8];
        byte & (1 << (port % 8)) != 0
    }
}

/// IPv4/IPv6 address-mask pair (`XDP_IP_ADDRESS_MASK`).
#[derive(Debug, Clone, Copy)]
pub enum InetMask {
    V4 { address: [u8; 4], mask: [u8; 4] },
    V6 { address: [u8; 16], mask: [u8; 16] },
}

impl InetMask {
    fn matches(&self, candidate: &[u8]) -> bool {
        match self {
            InetMask::V4 { address, mask } => {
                candidate.len() == 4
                    && (0..4).all(|i| candidate[i] & mask[i] == address[i] & mask[i])
            }
            InetMask::V6 { address, mask } => {
                candidate.len() == 16
                    && (0..16).all(|i| candidate[i] & mask[i] == address[i] & mask[i])
            }
        }
    }
}

/// A 4-tuple match (`XDP_TUPLE`), v4 or v6.
#[derive(Debug, Clone, Copy)]
pub enum Tuple {
    V4 {
        source: [u8; 4],
        destination: [u8; 4],
        source_port: u16,
        destination_port: u16,
    },
    V6 {
        source: [u8; 16],
        destination: [u8; 16],
        source_port: u16,
        destination_port: u16,
    },
}

/// The closed `XDP_MATCH_PATTERN` union, made a proper sum type.
#[derive(Debug, Clone)]
pub enum MatchPattern {
    None,
    Port(u16),
    IpMask(InetMask),
    Tuple(Tuple),
    QuicFlow(QuicFlow),
    PortSet(PortSet),
    Ipv4PortSet { address: [u8; 4], port_set: PortSet },
    Ipv6PortSet { address: [u8; 16], port_set: PortSet },
}

/// Closed action enumeration (`XDP_RULE_ACTION`). `Redirect` holds a strong
/// reference to its target socket, taken at rule creation.
#[derive(Clone)]
pub enum Action {
    Drop,
    Pass,
    Redirect(Socket),
    L2Fwd,
    /// Reserved; always rejected at validation, since no eBPF engine is
    /// ever registered in this core.
    Ebpf,
}

/// One compiled rule: a validated `(match_type, pattern, action)` triple.
#[derive(Clone)]
pub struct Rule {
    pub match_type: MatchType,
    pub pattern: MatchPattern,
    pub action: Action,
}

impl Rule {
    /// Construct and validate a rule from a proposed match/pattern/action:
    /// QUIC CID <= 20 bytes (enforced by `QuicFlow::new`), port-set bitmap
    /// exactly `PORT_SET_BUFFER_SIZE` (enforced by `PortSet::from_bitmap`),
    /// redirect target alive, and EBPF always rejected.
    pub fn new(match_type: MatchType, pattern: MatchPattern, action: Action) -> Result<Self, XdpError> {
        if matches!(action, Action::Ebpf) {
            return Err(XdpError::NotSupported);
        }
        if let Action::Redirect(ref target) = action {
            if target.is_closed() {
                return Err(XdpError::InvalidArgument(
                    "redirect target must be a live socket",
                ));
            }
        }
        Ok(Rule {
            match_type,
            pattern,
            action,
        })
    }
}

/// An attached program: its attachment key plus the compiled rule list.
pub struct Program {
    pub if_index: u32,
    pub hook: HookId,
    pub flags: CreateFlags,
    pub rules: Vec<Rule>,
}

/// Attachment-mode flags passed to program creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateFlags {
    pub generic: bool,
    pub native: bool,
    pub all_queues: bool,
}

/// The queue selector half of a program's attachment key: a specific queue,
/// or the `ALL_QUEUES` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueSelector {
    Queue(u32),
    AllQueues,
}

/// `(ifIndex, hook, queueId)` attachment key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProgramKey {
    pub if_index: u32,
    pub hook: HookId,
    pub queue: QueueSelector,
}

impl ProgramKey {
    pub fn new(if_index: u32, hook: HookId, queue_id: u32, all_queues: bool) -> Self {
        ProgramKey {
            if_index,
            hook,
            queue: if all_queues {
                QueueSelector::AllQueues
            } else {
                QueueSelector::Queue(queue_id)
            },
        }
    }
}

/// The registry of live programs, one [`Slot`] per attachment key.
///
/// Replacing the program at an already-occupied key goes through
/// [`Slot::replace`] (epoch-reclamation redesign): the old
/// program is handed back to the caller only once every inspector that was
/// mid-evaluation against it has finished. Deleting a key instead relies on
/// the registry's own `RwLock`: removing the map entry under its write lock
/// is enough to guarantee no inspector starting afterwards can look the key
/// up again, while one already past the lookup step finishes its one
/// in-flight frame.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<BTreeMap<ProgramKey, Arc<Slot<Program>>>>,
}

/// Result of [`ProgramRegistry::create`]: the new program's key plus the
/// previous program at that key, if any (returned "superseded" rather than
/// erroring).
pub struct CreateOutcome {
    pub key: ProgramKey,
    pub superseded: Option<Arc<Program>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        ProgramRegistry::default()
    }

    /// `create_program(ifIndex, hook, queueId, flags, rules[])`. Validates
    /// nothing itself — rules arrive pre-validated via [`Rule::new`] — and
    /// either inserts a fresh program or replaces the one already occupying
    /// this key.
    pub fn create(
        &self,
        if_index: u32,
        hook: HookId,
        queue_id: u32,
        flags: CreateFlags,
        rules: Vec<Rule>,
    ) -> CreateOutcome {
        let key = ProgramKey::new(if_index, hook, queue_id, flags.all_queues);
        let program = Program {
            if_index,
            hook,
            flags,
            rules,
        };

        let mut map = self.programs.write();
        if let Some(slot) = map.get(&key) {
            let old = slot.replace(program);
            CreateOutcome {
                key,
                superseded: Some(old),
            }
        } else {
            map.insert(key, Arc::new(Slot::new(program)));
            CreateOutcome {
                key,
                superseded: None,
            }
        }
    }

    /// Remove the program at `key`. A concurrent inspector that had already
    /// looked the key up keeps its own clone of the slot and finishes the
    /// one frame in flight; lookups starting after this call see nothing.
    pub fn delete(&self, key: &ProgramKey) -> Result<(), XdpError> {
        self.programs
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or(XdpError::NotFound)
    }

    /// `get_program(handle)`: round-trip the rules at `key`.
    pub fn get(&self, key: &ProgramKey) -> Option<Arc<Program>> {
        let slot = self.programs.read().get(key)?.clone();
        let (program, _guard) = slot.load();
        Some(program)
    }

    /// Look up the program for one RX frame: try the specific queue first,
    /// then the `ALL_QUEUES` wildcard. Returns the loaded `Arc<Program>`
    /// together with the epoch guard the caller must hold for the duration
    /// of evaluating this one frame.
    pub fn lookup(
        &self,
        if_index: u32,
        hook: HookId,
        queue_id: u32,
    ) -> Option<(Arc<Program>, crate::epoch::OwnedGuard<Program>)> {
        let map = self.programs.read();
        let specific = ProgramKey::new(if_index, hook, queue_id, false);
        let wildcard = ProgramKey::new(if_index, hook, queue_id, true);

        let slot = map.get(&specific).or_else(|| map.get(&wildcard))?.clone();
        drop(map);
        Some(Slot::load_arc(&slot))
    }
}

impl Program {
    /// Number of rules (used by the `xdpctl` CLI's `program` subcommands).
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xsk::IfInfo;

    fn fake_socket() -> Socket {
        Socket::new(IfInfo::invalid())
    }

    #[test]
    fn ebpf_action_is_rejected() {
        let err = Rule::new(MatchType::All, MatchPattern::None, Action::Ebpf).unwrap_err();
        assert!(matches!(err, XdpError::NotSupported));
    }

    #[test]
    fn redirect_to_closed_socket_is_rejected() {
        let sock = fake_socket();
        sock.close();
        let err = Rule::new(
            MatchType::UdpDst,
            MatchPattern::Port(1234),
            Action::Redirect(sock),
        )
        .unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
    }

    #[test]
    fn port_set_requires_exact_size() {
        let err = PortSet::from_bitmap(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));

        let full = [0u8; PORT_SET_BUFFER_SIZE];
        assert!(PortSet::from_bitmap(&full).is_ok());
    }

    #[test]
    fn quic_cid_length_is_bounded() {
        let err = QuicFlow::new(443, 0, &[0u8; 21]).unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
        assert!(QuicFlow::new(443, 0, &[0u8; 20]).is_ok());
    }

    #[test]
    fn second_create_at_same_key_replaces_and_returns_superseded() {
        let registry = ProgramRegistry::new();
        let rules = Vec::new();
        let first = registry.create(1, HookId::RX_INSPECT, 0, CreateFlags::default(), rules);
        assert!(first.superseded.is_none());

        let second = registry.create(
            1,
            HookId::RX_INSPECT,
            0,
            CreateFlags::default(),
            Vec::new(),
        );
        assert!(second.superseded.is_some());
        assert_eq!(first.key, second.key);
    }

    #[test]
    fn delete_removes_from_lookup() {
        let registry = ProgramRegistry::new();
        let outcome = registry.create(1, HookId::RX_INSPECT, 0, CreateFlags::default(), Vec::new());
        assert!(registry.lookup(1, HookId::RX_INSPECT, 0).is_some());

        registry.delete(&outcome.key).unwrap();
        assert!(registry.lookup(1, HookId::RX_INSPECT, 0).is_none());
    }

    #[test]
    fn delete_unknown_key_is_not_found() {
        let registry = ProgramRegistry::new();
        let key = ProgramKey::new(9, HookId::RX_INSPECT, 0, false);
        let err = registry.delete(&key).unwrap_err();
        assert!(matches!(err, XdpError::NotFound));
    }
}
