//! Inspection engine: per-frame RX evaluation against a [`Program`],
//! action dispatch, and the software redirect path: one physical socket,
//! copying matched frames into whichever logical socket's RX ring a rule
//! redirects to.
use core::convert::TryInto;

use crate::program::{Action, MatchPattern, MatchType, Program, Tuple};
use crate::socket::Socket;
use crate::umem::Umem;
use crate::xdp::XdpDesc;
use crate::xsk::BufIdx;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_TCP: u8 = 6;

const TCP_FLAG_FIN: u8 = 1 << 0;
const TCP_FLAG_SYN: u8 = 1 << 1;
const TCP_FLAG_RST: u8 = 1 << 2;

/// The outcome of running one frame through [`evaluate`]. `L2Fwd` frames
/// have already had their MAC addresses swapped in place by the time this
/// is returned; the caller still owns submitting them to the physical
/// socket's own TX ring, the same queue the frame arrived on.
#[derive(Debug)]
pub enum Disposition {
    Pass,
    Drop,
    L2Fwd,
    Redirected,
}

#[derive(Debug, Clone, Copy)]
enum Addr {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl Addr {
    fn as_slice(&self) -> &[u8] {
        match self {
            Addr::V4(a) => a,
            Addr::V6(a) => a,
        }
    }

    fn is_v4(&self) -> bool {
        matches!(self, Addr::V4(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum L4 {
    Udp,
    Tcp { flags: u8 },
}

/// Offsets and fields parsed once per frame and cached across the whole
/// rule list so later rules don't re-parse earlier layers. Parsing stops
/// as soon as a layer is missing or
/// malformed; later layers are simply absent rather than an error — an
/// unparseable frame just fails to match anything deeper than what could be
/// read, falling through to `PASS` like any other non-matching frame.
struct ParsedFrame {
    l3: Option<(Addr, Addr, u8)>,
    l4: Option<(L4, u16, u16)>,
    payload_offset: usize,
}

impl ParsedFrame {
    fn parse(frame: &[u8]) -> Self {
        let mut this = ParsedFrame {
            l3: None,
            l4: None,
            payload_offset: 0,
        };

        if frame.len() < 14 {
            return this;
        }
        let mut offset = 12;
        let mut ethertype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
        offset += 2;
        if ethertype == ETHERTYPE_VLAN {
            if frame.len() < offset + 4 {
                return this;
            }
            ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
            offset += 4;
        }

        let (src, dst, proto, l3_len) = match ethertype {
            ETHERTYPE_IPV4 => match parse_ipv4(&frame[offset..]) {
                Some(v) => v,
                None => return this,
            },
            ETHERTYPE_IPV6 => match parse_ipv6(&frame[offset..]) {
                Some(v) => v,
                None => return this,
            },
            _ => return this,
        };
        this.l3 = Some((src, dst, proto));
        offset += l3_len;

        let (l4, src_port, dst_port, l4_len) = match proto {
            IPPROTO_UDP => match parse_udp(&frame[offset..]) {
                Some(v) => v,
                None => return this,
            },
            IPPROTO_TCP => match parse_tcp(&frame[offset..]) {
                Some(v) => v,
                None => return this,
            },
            _ => return this,
        };
        this.l4 = Some((l4, src_port, dst_port));
        this.payload_offset = offset + l4_len;
        this
    }
}

fn parse_ipv4(buf: &[u8]) -> Option<(Addr, Addr, u8, usize)> {
    if buf.len() < 20 {
        return None;
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return None;
    }
    let ihl = (buf[0] & 0x0f) as usize * 4;
    if ihl < 20 || buf.len() < ihl {
        return None;
    }
    let proto = buf[9];
    let src = Addr::V4(buf[12..16].try_into().unwrap());
    let dst = Addr::V4(buf[16..20].try_into().unwrap());
    Some((src, dst, proto, ihl))
}

/// Cap on extension headers walked in one IPv6 chain. Bounded to avoid
/// spinning on a maliciously long or cyclic chain.
const MAX_IPV6_EXTENSIONS: u32 = 8;

fn parse_ipv6(buf: &[u8]) -> Option<(Addr, Addr, u8, usize)> {
    if buf.len() < 40 {
        return None;
    }
    if buf[0] >> 4 != 6 {
        return None;
    }
    let src = Addr::V6(buf[8..24].try_into().unwrap());
    let dst = Addr::V6(buf[24..40].try_into().unwrap());

    let mut next_header = buf[6];
    let mut offset = 40;
    for _ in 0..MAX_IPV6_EXTENSIONS {
        match next_header {
            // Hop-by-hop, routing, destination options: {next_header, hdr_ext_len, ...}.
            0 | 43 | 60 => {
                if buf.len() < offset + 2 {
                    return None;
                }
                next_header = buf[offset];
                let len = (buf[offset + 1] as usize + 1) * 8;
                offset += len;
            }
            // Fragment header: fixed 8 bytes.
            44 => {
                if buf.len() < offset + 8 {
                    return None;
                }
                next_header = buf[offset];
                offset += 8;
            }
            _ => return Some((src, dst, next_header, offset)),
        }
    }
    None
}

fn parse_udp(buf: &[u8]) -> Option<(L4, u16, u16, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let src_port = u16::from_be_bytes([buf[0], buf[1]]);
    let dst_port = u16::from_be_bytes([buf[2], buf[3]]);
    Some((L4::Udp, src_port, dst_port, 8))
}

fn parse_tcp(buf: &[u8]) -> Option<(L4, u16, u16, usize)> {
    if buf.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([buf[0], buf[1]]);
    let dst_port = u16::from_be_bytes([buf[2], buf[3]]);
    let header_len = ((buf[12] >> 4) as usize) * 4;
    if header_len < 20 || buf.len() < header_len {
        return None;
    }
    Some((L4::Tcp { flags: buf[13] }, src_port, dst_port, header_len))
}

fn rule_matches(match_type: MatchType, pattern: &MatchPattern, frame: &[u8], parsed: &ParsedFrame) -> bool {
    match match_type {
        MatchType::All => true,
        MatchType::Udp => matches!(parsed.l4, Some((L4::Udp, ..))),
        MatchType::UdpDst => match (&parsed.l4, pattern) {
            (Some((L4::Udp, _, dst)), MatchPattern::Port(p)) => dst == p,
            _ => false,
        },
        MatchType::TcpDst => match (&parsed.l4, pattern) {
            (Some((L4::Tcp { .. }, _, dst)), MatchPattern::Port(p)) => dst == p,
            _ => false,
        },
        MatchType::TcpControlDst => match (&parsed.l4, pattern) {
            (Some((L4::Tcp { flags }, _, dst)), MatchPattern::Port(p)) => {
                dst == p && flags & (TCP_FLAG_SYN | TCP_FLAG_FIN | TCP_FLAG_RST) != 0
            }
            _ => false,
        },
        MatchType::Ipv4DstMask => match (&parsed.l3, pattern) {
            (Some((_, dst, _)), MatchPattern::IpMask(mask)) if dst.is_v4() => {
                mask.matches(dst.as_slice())
            }
            _ => false,
        },
        MatchType::Ipv6DstMask => match (&parsed.l3, pattern) {
            (Some((_, dst, _)), MatchPattern::IpMask(mask)) if !dst.is_v4() => {
                mask.matches(dst.as_slice())
            }
            _ => false,
        },
        MatchType::Ipv4UdpTuple | MatchType::Ipv6UdpTuple => match (&parsed.l3, &parsed.l4, pattern) {
            (Some((src, dst, _)), Some((L4::Udp, sport, dport)), MatchPattern::Tuple(tuple)) => {
                tuple_matches(tuple, src, dst, *sport, *dport)
            }
            _ => false,
        },
        MatchType::QuicFlowSrcCid
        | MatchType::QuicFlowDstCid
        | MatchType::TcpQuicFlowSrcCid
        | MatchType::TcpQuicFlowDstCid => {
            let is_tcp_variant = matches!(
                match_type,
                MatchType::TcpQuicFlowSrcCid | MatchType::TcpQuicFlowDstCid
            );
            let dst_port = match &parsed.l4 {
                Some((L4::Udp, _, dst)) if !is_tcp_variant => *dst,
                Some((L4::Tcp { .. }, _, dst)) if is_tcp_variant => *dst,
                _ => return false,
            };
            match pattern {
                MatchPattern::QuicFlow(flow) if flow.udp_port == dst_port => {
                    let start = parsed.payload_offset + flow.cid_offset as usize;
                    let cid = flow.cid();
                    frame.len() >= start + cid.len() && &frame[start..start + cid.len()] == cid
                }
                _ => false,
            }
        }
        MatchType::UdpPortSet => match (&parsed.l4, pattern) {
            (Some((L4::Udp, _, dst)), MatchPattern::PortSet(set)) => set.contains(*dst),
            _ => false,
        },
        MatchType::Ipv4UdpPortSet | MatchType::Ipv6UdpPortSet => {
            port_set_with_addr(parsed, pattern, L4Proto::Udp)
        }
        MatchType::Ipv4TcpPortSet | MatchType::Ipv6TcpPortSet => {
            port_set_with_addr(parsed, pattern, L4Proto::Tcp)
        }
    }
}

enum L4Proto {
    Udp,
    Tcp,
}

fn port_set_with_addr(parsed: &ParsedFrame, pattern: &MatchPattern, proto: L4Proto) -> bool {
    let dst_port = match (&parsed.l4, proto) {
        (Some((L4::Udp, _, dst)), L4Proto::Udp) => *dst,
        (Some((L4::Tcp { .. }, _, dst)), L4Proto::Tcp) => *dst,
        _ => return false,
    };
    let dst_addr = match &parsed.l3 {
        Some((_, dst, _)) => dst,
        None => return false,
    };
    match pattern {
        MatchPattern::Ipv4PortSet { address, port_set } => {
            dst_addr.is_v4() && dst_addr.as_slice() == address && port_set.contains(dst_port)
        }
        MatchPattern::Ipv6PortSet { address, port_set } => {
            !dst_addr.is_v4() && dst_addr.as_slice() == address && port_set.contains(dst_port)
        }
        _ => false,
    }
}

fn tuple_matches(tuple: &Tuple, src: &Addr, dst: &Addr, sport: u16, dport: u16) -> bool {
    match (tuple, src, dst) {
        (
            Tuple::V4 {
                source,
                destination,
                source_port,
                destination_port,
            },
            Addr::V4(s),
            Addr::V4(d),
        ) => s == source && d == destination && sport == *source_port && dport == *destination_port,
        (
            Tuple::V6 {
                source,
                destination,
                source_port,
                destination_port,
            },
            Addr::V6(s),
            Addr::V6(d),
        ) => s == source && d == destination && sport == *source_port && dport == *destination_port,
        _ => false,
    }
}

/// Swap the Ethernet source/destination MAC addresses in place (`L2FWD`).
fn swap_l2_addrs(frame: &mut [u8]) {
    if frame.len() < 12 {
        return;
    }
    let (dst, src) = frame[..12].split_at_mut(6);
    dst.swap_with_slice(src);
}

/// Evaluate `frame` against `program`'s rules in declaration order
/// (first match wins — filter-determinism property), then
/// perform the matched action. `physical` is the socket that owns the RX
/// queue frames are arriving on; its [`crate::socket::SocketStats`] is
/// updated for `DROP` and truncated redirects.
pub fn evaluate(
    program: &Program,
    physical: &Socket,
    umem: &Umem,
    frame: &mut [u8],
) -> Disposition {
    let parsed = ParsedFrame::parse(frame);

    let matched = program
        .rules
        .iter()
        .find(|rule| rule_matches(rule.match_type, &rule.pattern, frame, &parsed));

    let Some(rule) = matched else {
        return Disposition::Pass;
    };

    match &rule.action {
        Action::Drop => {
            physical.record_drop();
            Disposition::Drop
        }
        Action::Pass => Disposition::Pass,
        Action::L2Fwd => {
            swap_l2_addrs(frame);
            Disposition::L2Fwd
        }
        Action::Redirect(target) => match redirect(target, umem, frame) {
            Ok(()) => Disposition::Redirected,
            Err(RedirectError::Truncated) => {
                physical.record_truncated();
                Disposition::Drop
            }
            Err(RedirectError::NoCapacity) | Err(RedirectError::NotActive) => {
                physical.record_drop();
                Disposition::Drop
            }
        },
        Action::Ebpf => {
            // Unreachable: `Rule::new` rejects `Ebpf` at validation time.
            physical.record_drop();
            Disposition::Drop
        }
    }
}

enum RedirectError {
    NotActive,
    NoCapacity,
    Truncated,
}

/// Move a matched frame into `target`'s RX ring: pop a chunk
/// address from the target's RX-fill ring (playing the kernel's consumer
/// role on what the app sees as a producer ring — see
/// [`crate::xsk::ring::XskRingProd::kernel_peek`]), copy the payload into
/// that chunk past `umem`'s headroom, then push a frame descriptor onto the
/// target's RX ring the same way.
fn redirect(target: &Socket, umem: &Umem, frame: &[u8]) -> Result<(), RedirectError> {
    if !target.is_redirect_target() {
        return Err(RedirectError::NotActive);
    }

    let capacity = umem.chunk_size().saturating_sub(umem.headroom()) as usize;
    if frame.len() > capacity {
        return Err(RedirectError::Truncated);
    }

    let addr = target
        .with_device(|device| {
            let mut idx = BufIdx(0);
            if device.fcq.prod.kernel_peek(1..=1, &mut idx) == 0 {
                return None;
            }
            let addr = unsafe { *device.fcq.prod.fill_addr(idx).as_ptr() };
            device.fcq.prod.kernel_release(1);
            Some(addr)
        })
        .flatten()
        .ok_or(RedirectError::NoCapacity)?;

    let (chunk_index, _) = umem.unpack_addr(addr).map_err(|_| RedirectError::NoCapacity)?;
    let chunk = umem.chunk(chunk_index).ok_or(RedirectError::NoCapacity)?;

    // Safety: `chunk` is a live, registered UMEM chunk; nothing else holds a
    // reference to it until the descriptor we are about to submit is read
    // back out of the target's RX ring by its owner.
    unsafe {
        let base = chunk.as_ptr() as *mut u8;
        let dst = core::slice::from_raw_parts_mut(base.add(umem.headroom() as usize), frame.len());
        dst.copy_from_slice(frame);
    }

    let desc = XdpDesc {
        addr: umem.pack_addr(chunk_index, umem.headroom() as u16),
        len: frame.len() as u32,
        options: 0,
    };

    target
        .with_rx(|rx| {
            let mut idx = BufIdx(0);
            if rx.ring.kernel_reserve(1..=1, &mut idx) == 0 {
                return false;
            }
            unsafe { *rx.ring.rx_desc(idx).as_ptr() = desc };
            rx.ring.kernel_submit(1);
            true
        })
        .filter(|ok| *ok)
        .map(|_| ())
        .ok_or(RedirectError::NoCapacity)
}

/// What came out of one [`pump`] call. `pump` only owns steering: `DROP`ped
/// and successfully `REDIRECT`ed chunks are recycled back to `physical`'s
/// own fill ring and `L2FWD` frames are already on their way out
/// `physical`'s TX ring by the time this returns. `passed` is everything
/// `PASS`ed through unsteered — still `physical`'s own application's to
/// consume, by whatever means it reads that queue's traffic normally.
#[derive(Debug, Default)]
pub struct PumpResult {
    pub processed: usize,
    pub passed: alloc::vec::Vec<XdpDesc>,
}

/// Drain everything currently posted on `physical`'s RX ring and evaluate
/// each frame against `program`.
///
/// All of `physical`'s own rings are touched by this call, but never two at
/// once: every `with_rx`/`with_tx`/`with_device` call independently
/// acquires the same per-socket lock, so a closure passed to one of them
/// must never call another — the accumulated `forward`/`recycle`/`passed`
/// lists let the RX pass finish (and its lock drop) before TX and fill-ring
/// work begins.
pub fn pump(program: &Program, physical: &Socket, umem: &Umem) -> PumpResult {
    let mut forward = Vec::new();
    let mut recycle = Vec::new();
    let mut passed = Vec::new();

    let processed = physical
        .with_rx(|rx| {
            let mut reader = rx.receive(u32::MAX);
            let mut processed = 0usize;
            while let Some(desc) = reader.read() {
                processed += 1;
                match evaluate_posted(program, physical, umem, desc) {
                    Some(Disposition::L2Fwd) => forward.push(desc),
                    Some(Disposition::Pass) => passed.push(desc),
                    Some(Disposition::Drop) | Some(Disposition::Redirected) => {
                        recycle.push(desc.addr)
                    }
                    None => recycle.push(desc.addr),
                }
            }
            reader.release();
            processed
        })
        .unwrap_or(0);

    if !forward.is_empty() {
        physical.with_tx(|tx| {
            let mut writer = tx.transmit(forward.len() as u32);
            writer.insert(forward.iter().copied());
            writer.commit();
        });
    }

    if !recycle.is_empty() {
        physical.with_device(|device| {
            let mut writer = device.fill(recycle.len() as u32);
            writer.insert(recycle.iter().copied());
            writer.commit();
        });
    }

    PumpResult { processed, passed }
}

/// Resolve a posted RX descriptor to its backing chunk and run [`evaluate`]
/// over it. `None` if `desc.addr` doesn't resolve to a chunk in `umem` (a
/// malformed or foreign descriptor, treated the same as an unparseable
/// frame everywhere else in this module: dropped rather than trusted).
fn evaluate_posted(
    program: &Program,
    physical: &Socket,
    umem: &Umem,
    desc: XdpDesc,
) -> Option<Disposition> {
    let (chunk_index, in_chunk_offset) = umem.unpack_addr(desc.addr).ok()?;
    let chunk = umem.chunk(chunk_index)?;

    let frame = unsafe {
        let base = chunk.as_ptr() as *mut u8;
        core::slice::from_raw_parts_mut(base.add(in_chunk_offset as usize), desc.len as usize)
    };

    Some(evaluate(program, physical, umem, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CreateFlags, Rule};
    use crate::socket::HookId;
    use crate::xsk::IfInfo;

    fn udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36]); // dst mac
        frame.extend_from_slice(&[0x11, 0x12, 0x13, 0x14, 0x15, 0x16]); // src mac
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let udp_len = 8 + payload.len();
        let total_len = 20 + udp_len;
        frame.push(0x45); // version/ihl
        frame.push(0); // tos
        frame.extend_from_slice(&(total_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]); // id/flags/frag
        frame.push(64); // ttl
        frame.push(IPPROTO_UDP);
        frame.extend_from_slice(&[0, 0]); // checksum
        frame.extend_from_slice(&[192, 168, 1, 1]); // src
        frame.extend_from_slice(&[192, 168, 1, 2]); // dst
        frame.extend_from_slice(&[1111u16.to_be_bytes()[0], 1111u16.to_be_bytes()[1]]); // src port
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // checksum
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn parses_udp_dst_port() {
        let frame = udp_frame(1234, b"abc");
        let parsed = ParsedFrame::parse(&frame);
        assert!(matches!(parsed.l4, Some((L4::Udp, _, 1234))));
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        let drop_rule = Rule::new(MatchType::All, MatchPattern::None, Action::Drop).unwrap();
        let pass_rule = Rule::new(MatchType::All, MatchPattern::None, Action::Pass).unwrap();
        let program = Program {
            if_index: 1,
            hook: HookId::RX_INSPECT,
            flags: CreateFlags::default(),
            rules: vec![drop_rule, pass_rule],
        };

        let physical = Socket::new(IfInfo::invalid());
        let umem = crate::umem::Umem::new_for_test(1 << 16, 1 << 12, 0);
        let mut frame = udp_frame(53, b"xyz");

        let disposition = evaluate(&program, &physical, &umem, &mut frame);
        assert!(matches!(disposition, Disposition::Drop));
        assert_eq!(physical.statistics().rx_dropped, 1);
    }

    #[test]
    fn unmatched_frame_passes() {
        let program = Program {
            if_index: 1,
            hook: HookId::RX_INSPECT,
            flags: CreateFlags::default(),
            rules: vec![Rule::new(
                MatchType::UdpDst,
                MatchPattern::Port(9999),
                Action::Drop,
            )
            .unwrap()],
        };
        let physical = Socket::new(IfInfo::invalid());
        let umem = crate::umem::Umem::new_for_test(1 << 16, 1 << 12, 0);
        let mut frame = udp_frame(53, b"xyz");

        let disposition = evaluate(&program, &physical, &umem, &mut frame);
        assert!(matches!(disposition, Disposition::Pass));
        assert_eq!(physical.statistics().rx_dropped, 0);
    }

    #[test]
    fn l2fwd_swaps_mac_addresses_in_place() {
        let mut frame = udp_frame(80, b"z");
        let original_dst = frame[0..6].to_vec();
        let original_src = frame[6..12].to_vec();
        swap_l2_addrs(&mut frame);
        assert_eq!(frame[0..6], original_src[..]);
        assert_eq!(frame[6..12], original_dst[..]);
    }
}

/// End-to-end exercises for the seed scenarios: a full physical socket
/// draining its RX ring through [`pump`], rather than [`evaluate`] called
/// directly on a frame already in hand.
#[cfg(test)]
mod seed_scenarios {
    use super::*;
    use crate::program::{CreateFlags, Rule};
    use crate::socket::HookId;
    use crate::umem::Umem;
    use crate::xsk::BufIdx;

    fn udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36]); // dst mac
        frame.extend_from_slice(&[0x11, 0x12, 0x13, 0x14, 0x15, 0x16]); // src mac
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let udp_len = 8 + payload.len();
        let total_len = 20 + udp_len;
        frame.push(0x45);
        frame.push(0);
        frame.extend_from_slice(&(total_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.push(64);
        frame.push(IPPROTO_UDP);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&[192, 168, 1, 1]);
        frame.extend_from_slice(&[192, 168, 1, 2]);
        frame.extend_from_slice(&1111u16.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    /// Write `frame` into `umem`'s chunk `chunk_index` and post a matching
    /// descriptor on `physical`'s RX ring, as the kernel would after a real
    /// DMA completion. Mirrors the reservation dance `redirect` already
    /// does on the target side, here played on the source side instead.
    fn post_rx(physical: &Socket, umem: &Umem, chunk_index: u32, frame: &[u8]) {
        let chunk = umem.chunk(chunk_index).expect("chunk in range");
        unsafe {
            let base = chunk.as_ptr() as *mut u8;
            core::slice::from_raw_parts_mut(base, frame.len()).copy_from_slice(frame);
        }
        let desc = XdpDesc {
            addr: umem.pack_addr(chunk_index, 0),
            len: frame.len() as u32,
            options: 0,
        };
        physical
            .with_rx(|rx| {
                let mut idx = BufIdx(0);
                assert_eq!(rx.ring.kernel_reserve(1..=1, &mut idx), 1);
                unsafe { *rx.ring.rx_desc(idx).as_ptr() = desc };
                rx.ring.kernel_submit(1);
            })
            .expect("physical socket has an RX ring");
    }

    fn program_with(rule: Rule) -> Program {
        Program {
            if_index: 1,
            hook: HookId::RX_INSPECT,
            flags: CreateFlags::default(),
            rules: vec![rule],
        }
    }

    #[test]
    fn loopback_udp_redirect() {
        let umem = Umem::new_for_test(1 << 20, 1 << 12, 0);
        let physical = Socket::new_loopback_target(8, 8);
        let target = Socket::new_loopback_target(8, 8);
        target.seed_fill_ring(&umem, 4);

        let frame = udp_frame(53, b"hello");
        post_rx(&physical, &umem, 10, &frame);

        let program = program_with(
            Rule::new(MatchType::UdpDst, MatchPattern::Port(53), Action::Redirect(target.clone()))
                .unwrap(),
        );

        let result = pump(&program, &physical, &umem);
        assert_eq!(result.processed, 1);
        assert!(result.passed.is_empty());

        let delivered = target.drain_rx_for_test();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len as usize, frame.len());

        let (chunk_index, offset) = umem.unpack_addr(delivered[0].addr).unwrap();
        let chunk = umem.chunk(chunk_index).unwrap();
        let copied = unsafe {
            core::slice::from_raw_parts(chunk.as_ptr() as *const u8, frame.len() + offset as usize)
        };
        assert_eq!(&copied[offset as usize..], &frame[..]);
    }

    #[test]
    fn port_miss_passes_through_unsteered() {
        let umem = Umem::new_for_test(1 << 20, 1 << 12, 0);
        let physical = Socket::new_loopback_target(8, 8);

        let frame = udp_frame(9999, b"xyz");
        post_rx(&physical, &umem, 2, &frame);

        let program = program_with(
            Rule::new(MatchType::UdpDst, MatchPattern::Port(53), Action::Drop).unwrap(),
        );

        let result = pump(&program, &physical, &umem);
        assert_eq!(result.processed, 1);
        assert_eq!(result.passed.len(), 1);
        assert_eq!(physical.statistics().rx_dropped, 0);
    }

    #[test]
    fn redirect_with_empty_fill_ring_drops_and_accounts() {
        let umem = Umem::new_for_test(1 << 20, 1 << 12, 0);
        let physical = Socket::new_loopback_target(8, 8);
        // No `seed_fill_ring`: the target's fill ring starts empty, so the
        // redirect has nowhere to place the frame.
        let target = Socket::new_loopback_target(8, 8);

        let frame = udp_frame(53, b"hello");
        post_rx(&physical, &umem, 3, &frame);

        let program = program_with(
            Rule::new(MatchType::UdpDst, MatchPattern::Port(53), Action::Redirect(target.clone()))
                .unwrap(),
        );

        let result = pump(&program, &physical, &umem);
        assert_eq!(result.processed, 1);
        assert!(result.passed.is_empty());
        assert_eq!(physical.statistics().rx_dropped, 1);
        assert!(target.drain_rx_for_test().is_empty());
    }

    #[test]
    fn umem_sharing_refcount_tracks_live_handles() {
        let umem = Umem::new_for_test(1 << 16, 1 << 12, 0);
        assert_eq!(umem.refcount(), 1);

        let shared = umem.share();
        assert_eq!(umem.refcount(), 2);
        assert_eq!(shared.refcount(), 2);

        drop(shared);
        assert_eq!(umem.refcount(), 1);
    }
}
