// Traffic-control engine: HTB qdisc and classes plus the cgroup classifier
// filter, spoken directly over a NETLINK_ROUTE socket. Link-level work rides
// rtnetlink (netlink.rs); tc attributes are packed by hand because nothing
// in the stack exposes them.

use crate::error::{RuntimeError, RuntimeResult};
use crate::network::error::{NetworkError, NetworkResult};
use crate::utils::console::ConsoleLogger;
use crate::utils::constants::CGROUP_FILTER_PRIO;
use crate::utils::process::retry_busy;
use nix::sys::socket::{
    bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use nix::unistd::close;
use std::ffi::CString;
use std::fs;
use std::os::unix::io::RawFd;

// netlink message types and flags
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x001;
const NLM_F_ACK: u16 = 0x004;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_DUMP: u16 = 0x300;

// tc attribute types
const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_STATS: u16 = 3;
const TCA_STATS2: u16 = 7;

// TCA_STATS2 nested entries
const TCA_STATS_BASIC: u16 = 1;
const TCA_STATS_QUEUE: u16 = 3;

// HTB options
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_CTAB: u16 = 3;
const TCA_HTB_RTAB: u16 = 4;

const NLA_TYPE_MASK: u16 = 0x3fff;

const ETH_P_ALL: u16 = 0x0003;
const HTB_RATE2QUANTUM: u32 = 10;
const RTAB_CELLS: usize = 256;
const SHAPING_MTU: u32 = 1600;

/// Compose a tc handle from major and minor.
pub fn tc_handle(maj: u16, min: u16) -> u32 {
    ((maj as u32) << 16) | min as u32
}

/// The root qdisc handle: major FFFF, minor 0.
pub fn tc_root_handle() -> u32 {
    tc_handle(0xFFFF, 0)
}

pub fn tc_major(handle: u32) -> u16 {
    (handle >> 16) as u16
}

/// Class statistics exported per container class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcStat {
    Packets,
    Bytes,
    Drops,
    Overlimits,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// An outgoing tc request: nlmsghdr + tcmsg + attributes.
struct TcRequest {
    buf: Vec<u8>,
}

impl TcRequest {
    fn new(msg_type: u16, flags: u16, ifindex: i32, handle: u32, parent: u32, info: u32) -> Self {
        let mut buf = Vec::with_capacity(128);
        // nlmsghdr: len (fixed up later), type, flags, seq, pid
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&(NLM_F_REQUEST | flags).to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        // tcmsg: family, pad, pad, ifindex, handle, parent, info
        buf.push(libc::AF_UNSPEC as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&ifindex.to_ne_bytes());
        buf.extend_from_slice(&handle.to_ne_bytes());
        buf.extend_from_slice(&parent.to_ne_bytes());
        buf.extend_from_slice(&info.to_ne_bytes());
        TcRequest { buf }
    }

    fn add_attr(&mut self, kind: u16, payload: &[u8]) {
        let len = 4 + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    /// Open a nested attribute, returning the position to close it with.
    fn begin_nest(&mut self, kind: u16) -> usize {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        pos
    }

    fn end_nest(&mut self, pos: usize) {
        let len = (self.buf.len() - pos) as u16;
        self.buf[pos..pos + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(bytes)
}

/// Walk the attributes of a tc message payload, calling `f` with each
/// `(type, payload)` pair.
fn walk_attrs(payload: &[u8], mut f: impl FnMut(u16, &[u8])) {
    let mut pos = 0;
    while pos + 4 <= payload.len() {
        let len = read_u16(payload, pos) as usize;
        if len < 4 || pos + len > payload.len() {
            break;
        }
        let kind = read_u16(payload, pos + 2) & NLA_TYPE_MASK;
        f(kind, &payload[pos + 4..pos + len]);
        pos += align4(len);
    }
}

/// Kernel tick scaling read from /proc/net/psched, used to express rates
/// as transmission-time tables the way tc does.
struct PschedClock {
    tick_in_usec: f64,
    hz: u32,
}

impl PschedClock {
    fn read() -> Self {
        Self::parse(&fs::read_to_string("/proc/net/psched").unwrap_or_default())
    }

    fn parse(data: &str) -> Self {
        let mut fields = data
            .split_whitespace()
            .map(|f| u32::from_str_radix(f, 16).unwrap_or(0));
        let mut t2us = fields.next().unwrap_or(1);
        let us2t = fields.next().unwrap_or(1).max(1);
        let clock_res = fields.next().unwrap_or(1_000_000);
        let hz = fields.next().unwrap_or(100).max(1);
        // Nanosecond-resolution kernels advertise a compat multiplier.
        if clock_res == 1_000_000_000 {
            t2us = us2t;
        }
        let clock_factor = clock_res as f64 / 1_000_000f64;
        PschedClock {
            tick_in_usec: t2us as f64 / us2t as f64 * clock_factor,
            hz,
        }
    }

    /// Ticks needed to transmit `size` bytes at `rate` bytes/sec.
    fn xmittime(&self, rate: u64, size: u32) -> u32 {
        let usec = 1_000_000f64 * size as f64 / rate.max(1) as f64;
        (usec * self.tick_in_usec) as u32
    }
}

/// tc_ratespec: cell_log, linklayer, overhead, cell_align, mpu, rate.
fn pack_ratespec(rate: u64, cell_log: u8) -> [u8; 12] {
    let mut spec = [0u8; 12];
    spec[0] = cell_log;
    spec[1] = 1; // TC_LINKLAYER_ETHERNET
    let clamped = rate.min(u32::MAX as u64) as u32;
    spec[8..12].copy_from_slice(&clamped.to_ne_bytes());
    spec
}

fn rate_cell_log(mtu: u32) -> u8 {
    let mut cell_log = 0u8;
    while (mtu >> cell_log) > 255 {
        cell_log += 1;
    }
    cell_log
}

/// Transmission-time table: 256 cells of xmittime for growing sizes.
fn pack_rtab(clock: &PschedClock, rate: u64, cell_log: u8) -> Vec<u8> {
    let mut table = Vec::with_capacity(RTAB_CELLS * 4);
    for i in 0..RTAB_CELLS {
        let size = ((i + 1) << cell_log) as u32;
        table.extend_from_slice(&clock.xmittime(rate, size).to_ne_bytes());
    }
    table
}

/// Bandwidth shaper for one link, over its own scoped route socket.
pub struct TrafficShaper {
    fd: RawFd,
    ifindex: i32,
    device: String,
    seq: u32,
}

#[allow(dead_code)] // Stats and property reads are served to clients on demand
impl TrafficShaper {
    /// Open a shaper on a named link in the current network namespace.
    pub fn open(device: &str) -> NetworkResult<Self> {
        let name = CString::new(device)
            .map_err(|_| NetworkError::Validation(format!("bad device name {}", device)))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(NetworkError::NotFound(format!("link {}", device)));
        }

        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(|e| NetworkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        if let Err(e) = bind(fd, &NetlinkAddr::new(0, 0)) {
            let _ = close(fd);
            return Err(NetworkError::Io(std::io::Error::from_raw_os_error(e as i32)));
        }

        Ok(TrafficShaper {
            fd,
            ifindex: ifindex as i32,
            device: device.to_string(),
            seq: 1,
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send_expect_ack(&mut self, request: TcRequest, operation: &str) -> NetworkResult<()> {
        let seq = self.next_seq();
        let buf = request.finish(seq);
        send(self.fd, &buf, MsgFlags::empty())
            .map_err(|e| NetworkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        let mut reply = vec![0u8; 8192];
        let n = recv(self.fd, &mut reply, MsgFlags::empty())
            .map_err(|e| NetworkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        let reply = &reply[..n];
        if n >= 20 && read_u16(reply, 4) == NLMSG_ERROR {
            let errno = read_u32(reply, 16) as i32;
            if errno == 0 {
                return Ok(());
            }
            return Err(NetworkError::message(
                format!("{} on {}", operation, self.device),
                -errno,
            ));
        }
        Ok(())
    }

    /// Dump all classes of this link and hand each `(tcmsg, attrs)` to `f`.
    fn dump_classes(&mut self, mut f: impl FnMut(u32, &[u8])) -> NetworkResult<()> {
        let seq = self.next_seq();
        let request = TcRequest::new(libc::RTM_GETTCLASS, NLM_F_DUMP, self.ifindex, 0, 0, 0);
        let buf = request.finish(seq);
        send(self.fd, &buf, MsgFlags::empty())
            .map_err(|e| NetworkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        let mut done = false;
        while !done {
            let mut reply = vec![0u8; 65536];
            let n = recv(self.fd, &mut reply, MsgFlags::empty())
                .map_err(|e| NetworkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
            if n == 0 {
                break;
            }
            let reply = &reply[..n];
            let mut pos = 0;
            while pos + 16 <= reply.len() {
                let msg_len = read_u32(reply, pos) as usize;
                if msg_len < 16 || pos + msg_len > reply.len() {
                    break;
                }
                let msg_type = read_u16(reply, pos + 4);
                match msg_type {
                    NLMSG_DONE => {
                        done = true;
                        break;
                    }
                    NLMSG_ERROR => {
                        let errno = read_u32(reply, pos + 16) as i32;
                        if errno != 0 {
                            return Err(NetworkError::message(
                                format!("dump_classes on {}", self.device),
                                -errno,
                            ));
                        }
                        done = true;
                        break;
                    }
                    _ => {
                        // tcmsg follows the header; tcm_handle sits at +4+4.
                        let tcm = pos + 16;
                        if tcm + 20 <= reply.len() {
                            let handle = read_u32(reply, tcm + 8);
                            f(handle, &reply[tcm + 20..pos + msg_len]);
                        }
                    }
                }
                pos += align4(msg_len);
            }
        }
        Ok(())
    }

    /// Install the root HTB qdisc with a fixed default class.
    pub fn add_htb(&mut self, parent: u32, handle: u32, default_class: u32) -> NetworkResult<()> {
        let mut request = TcRequest::new(
            libc::RTM_NEWQDISC,
            NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
            self.ifindex,
            handle,
            parent,
            0,
        );
        request.add_attr(TCA_KIND, b"htb\0");
        let nest = request.begin_nest(TCA_OPTIONS);
        // tc_htb_glob: version, rate2quantum, defcls, debug, direct_pkts
        let mut glob = [0u8; 20];
        glob[0..4].copy_from_slice(&3u32.to_ne_bytes());
        glob[4..8].copy_from_slice(&HTB_RATE2QUANTUM.to_ne_bytes());
        glob[8..12].copy_from_slice(&default_class.to_ne_bytes());
        request.add_attr(TCA_HTB_INIT, &glob);
        request.end_nest(nest);

        ConsoleLogger::debug(&format!(
            "Adding HTB qdisc {:x}:{:x} on {}",
            tc_major(handle),
            handle & 0xFFFF,
            self.device
        ));
        self.send_expect_ack(request, "add_htb")
    }

    pub fn remove_htb(&mut self, parent: u32) -> NetworkResult<()> {
        let request = TcRequest::new(libc::RTM_DELQDISC, NLM_F_ACK, self.ifindex, 0, parent, 0);
        self.retry_remove(request, "remove_htb")
    }

    /// Add a shaping class under the root qdisc. Rate and ceil are in
    /// bytes per second.
    pub fn add_class(
        &mut self,
        parent: u32,
        handle: u32,
        prio: u32,
        rate: u64,
        ceil: u64,
    ) -> NetworkResult<()> {
        if rate == 0 {
            return Err(NetworkError::Validation(format!(
                "add_class({:x}): zero rate",
                handle
            )));
        }
        let ceil = if ceil == 0 { rate } else { ceil };
        let clock = PschedClock::read();
        let cell_log = rate_cell_log(SHAPING_MTU);

        // tc_htb_opt: rate spec, ceil spec, buffer, cbuffer, quantum,
        // level, prio
        let mut opt = Vec::with_capacity(44);
        opt.extend_from_slice(&pack_ratespec(rate, cell_log));
        opt.extend_from_slice(&pack_ratespec(ceil, cell_log));
        let buffer = clock.xmittime(rate, (rate / clock.hz as u64) as u32 + SHAPING_MTU);
        let cbuffer = clock.xmittime(ceil, (ceil / clock.hz as u64) as u32 + SHAPING_MTU);
        opt.extend_from_slice(&buffer.to_ne_bytes());
        opt.extend_from_slice(&cbuffer.to_ne_bytes());
        opt.extend_from_slice(&0u32.to_ne_bytes());
        opt.extend_from_slice(&0u32.to_ne_bytes());
        opt.extend_from_slice(&prio.to_ne_bytes());

        let mut request = TcRequest::new(
            libc::RTM_NEWTCLASS,
            NLM_F_CREATE | NLM_F_ACK,
            self.ifindex,
            handle,
            parent,
            0,
        );
        request.add_attr(TCA_KIND, b"htb\0");
        let nest = request.begin_nest(TCA_OPTIONS);
        request.add_attr(TCA_HTB_PARMS, &opt);
        request.add_attr(TCA_HTB_RTAB, &pack_rtab(&clock, rate, cell_log));
        request.add_attr(TCA_HTB_CTAB, &pack_rtab(&clock, ceil, cell_log));
        request.end_nest(nest);

        ConsoleLogger::debug(&format!(
            "Adding class {:x}:{:x} rate {} ceil {} on {}",
            tc_major(handle),
            handle & 0xFFFF,
            rate,
            ceil,
            self.device
        ));
        self.send_expect_ack(request, "add_class")
    }

    pub fn remove_class(&mut self, parent: u32, handle: u32) -> NetworkResult<()> {
        let request =
            TcRequest::new(libc::RTM_DELTCLASS, NLM_F_ACK, self.ifindex, handle, parent, 0);
        self.retry_remove(request, "remove_class")
    }

    pub fn class_exists(&mut self, handle: u32) -> bool {
        let mut found = false;
        let _ = self.dump_classes(|h, _| {
            if h == handle {
                found = true;
            }
        });
        found
    }

    /// Read back prio, rate and ceil of a class from its HTB parameters.
    pub fn get_class_properties(&mut self, handle: u32) -> NetworkResult<(u32, u64, u64)> {
        let mut result = None;
        self.dump_classes(|h, attrs| {
            if h != handle || result.is_some() {
                return;
            }
            walk_attrs(attrs, |kind, payload| {
                if kind != TCA_OPTIONS {
                    return;
                }
                walk_attrs(payload, |opt_kind, opt| {
                    if opt_kind == TCA_HTB_PARMS && opt.len() >= 44 {
                        let rate = read_u32(opt, 8) as u64;
                        let ceil = read_u32(opt, 20) as u64;
                        let prio = read_u32(opt, 40);
                        result = Some((prio, rate, ceil));
                    }
                });
            });
        })?;
        result.ok_or_else(|| NetworkError::NotFound(format!("class {:x}", handle)))
    }

    /// One statistic of a class, preferring the STATS2 blocks and falling
    /// back to the legacy tc_stats struct.
    pub fn get_stat(&mut self, handle: u32, stat: TcStat) -> NetworkResult<u64> {
        let mut result = None;
        self.dump_classes(|h, attrs| {
            if h != handle || result.is_some() {
                return;
            }
            let mut value = None;
            walk_attrs(attrs, |kind, payload| match kind {
                TCA_STATS2 => {
                    walk_attrs(payload, |stat_kind, block| match (stat_kind, stat) {
                        (TCA_STATS_BASIC, TcStat::Bytes) if block.len() >= 8 => {
                            value = Some(read_u64(block, 0));
                        }
                        (TCA_STATS_BASIC, TcStat::Packets) if block.len() >= 12 => {
                            value = Some(read_u32(block, 8) as u64);
                        }
                        (TCA_STATS_QUEUE, TcStat::Drops) if block.len() >= 12 => {
                            value = Some(read_u32(block, 8) as u64);
                        }
                        (TCA_STATS_QUEUE, TcStat::Overlimits) if block.len() >= 20 => {
                            value = Some(read_u32(block, 16) as u64);
                        }
                        _ => {}
                    });
                }
                TCA_STATS if value.is_none() && payload.len() >= 28 => {
                    // legacy tc_stats: bytes u64, packets, drops, overlimits
                    value = Some(match stat {
                        TcStat::Bytes => read_u64(payload, 0),
                        TcStat::Packets => read_u32(payload, 8) as u64,
                        TcStat::Drops => read_u32(payload, 12) as u64,
                        TcStat::Overlimits => read_u32(payload, 16) as u64,
                    });
                }
                _ => {}
            });
            if value.is_some() {
                result = value;
            }
        })?;
        result.ok_or_else(|| NetworkError::NotFound(format!("class {:x}", handle)))
    }

    /// Attach the cgroup classifier at the fixed priority so packets carry
    /// their net_cls classid into class selection.
    pub fn add_cgroup_filter(&mut self, parent: u32, handle: u32) -> NetworkResult<()> {
        let info = ((CGROUP_FILTER_PRIO as u32) << 16) | (ETH_P_ALL.to_be() as u32);
        let mut request = TcRequest::new(
            libc::RTM_NEWTFILTER,
            NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
            self.ifindex,
            handle,
            parent,
            info,
        );
        request.add_attr(TCA_KIND, b"cgroup\0");
        self.send_expect_ack(request, "add_cgroup_filter")
    }

    pub fn remove_cgroup_filter(&mut self, parent: u32, handle: u32) -> NetworkResult<()> {
        let info = ((CGROUP_FILTER_PRIO as u32) << 16) | (ETH_P_ALL.to_be() as u32);
        let request = TcRequest::new(
            libc::RTM_DELTFILTER,
            NLM_F_ACK,
            self.ifindex,
            handle,
            parent,
            info,
        );
        self.retry_remove(request, "remove_cgroup_filter")
    }

    /// Remove operations retry on EBUSY at this layer; everything else
    /// propagates immediately.
    fn retry_remove(&mut self, request: TcRequest, operation: &str) -> NetworkResult<()> {
        let body = request.buf.clone();
        let result: RuntimeResult<()> = retry_busy(5, 30, || {
            let req = TcRequest { buf: body.clone() };
            self.send_expect_ack(req, operation).map_err(RuntimeError::from)
        });
        result.map_err(|e| match e.errno {
            Some(errno) => NetworkError::message(format!("{} on {}", operation, self.device), errno),
            None => NetworkError::Validation(e.message),
        })
    }
}

impl Drop for TrafficShaper {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trip() {
        for h in [0u32, 0x1_0001, 0xFFFF_0000, 0x0001_00FF, 0xABCD_1234] {
            assert_eq!(tc_handle(tc_major(h), (h & 0xFFFF) as u16), h);
        }
        assert_eq!(tc_root_handle(), 0xFFFF_0000);
        assert_eq!(tc_major(tc_root_handle()), 0xFFFF);
    }

    #[test]
    fn request_layout() {
        let mut request = TcRequest::new(libc::RTM_NEWQDISC, NLM_F_ACK, 3, 0x1_0000, 0xFFFF_0000, 0);
        request.add_attr(TCA_KIND, b"htb\0");
        let buf = request.finish(7);

        assert_eq!(read_u32(&buf, 0) as usize, buf.len());
        assert_eq!(read_u16(&buf, 4), libc::RTM_NEWQDISC);
        assert_eq!(read_u16(&buf, 6), NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(read_u32(&buf, 8), 7);
        // tcmsg: ifindex at 20, handle at 24, parent at 28
        assert_eq!(read_u32(&buf, 20), 3);
        assert_eq!(read_u32(&buf, 24), 0x1_0000);
        assert_eq!(read_u32(&buf, 28), 0xFFFF_0000);
        // first attribute after the 20-byte tcmsg
        assert_eq!(read_u16(&buf, 36), 4 + 4);
        assert_eq!(read_u16(&buf, 38), TCA_KIND);
        assert_eq!(&buf[40..44], b"htb\0");
    }

    #[test]
    fn nested_attr_lengths() {
        let mut request = TcRequest::new(libc::RTM_NEWTCLASS, 0, 1, 0, 0, 0);
        let nest = request.begin_nest(TCA_OPTIONS);
        request.add_attr(TCA_HTB_PARMS, &[0u8; 44]);
        request.end_nest(nest);
        let buf = request.finish(1);

        let payload = &buf[36..];
        let mut seen = Vec::new();
        walk_attrs(payload, |kind, body| seen.push((kind, body.len())));
        assert_eq!(seen, vec![(TCA_OPTIONS, 48)]);

        let mut inner = Vec::new();
        walk_attrs(&payload[4..], |kind, body| inner.push((kind, body.len())));
        assert_eq!(inner, vec![(TCA_HTB_PARMS, 44)]);
    }

    #[test]
    fn ratespec_and_tables() {
        let spec = pack_ratespec(125_000, 3);
        assert_eq!(spec[0], 3);
        assert_eq!(read_u32(&spec, 8), 125_000);

        let clock = PschedClock::parse("000003e8 000003e8 000f4240 00000064");
        assert_eq!(clock.hz, 100);
        // 1 MB/s, 1000-byte cell: one millisecond in usec ticks
        assert_eq!(clock.xmittime(1_000_000, 1000), 1000);

        let rtab = pack_rtab(&clock, 125_000, 3);
        assert_eq!(rtab.len(), RTAB_CELLS * 4);
        // transmission time grows with cell index
        assert!(read_u32(&rtab, 0) < read_u32(&rtab, 1020));
    }

    #[test]
    fn cell_log_covers_mtu() {
        assert_eq!(rate_cell_log(255), 0);
        assert_eq!(rate_cell_log(1600), 3);
        assert!((1600 >> rate_cell_log(1600)) <= 255);
    }

    #[test]
    fn nanosecond_clock_compat() {
        let clock = PschedClock::parse("000003e8 00000040 3b9aca00 00000064");
        // t2us is replaced by us2t under nanosecond resolution
        assert!((clock.tick_in_usec - 1000.0).abs() < f64::EPSILON);
    }
}
