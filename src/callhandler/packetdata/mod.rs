//! P25 PDU (packet-data) engine: confirmed/unconfirmed block reassembly,
//! ARP, SNDCP dynamic IPv4 allocation and N(S)/V(R) ARQ windows (spec §4.7).
//!
//! DMR packet data (`dmr.rs`) reuses the same block assembler and ARP/SNDCP
//! tables, since §4.7 only names the P25 SAP table explicitly; the DMR
//! side only wires the shared pieces together (see `dmr.rs`).

pub mod dmr;
pub mod p25;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Attempts before an unresolved ARP egress is dropped.
pub const MAX_PKT_RETRY_CNT: u32 = 3;
pub const ARP_RETRY_MS: Duration = Duration::from_millis(5000);
pub const SUBSCRIBER_READY_RETRY_MS: Duration = Duration::from_millis(1000);
/// Idle budget for an in-progress PDU assembly before it is forcibly ended.
pub const PDU_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduFormat {
    Response,
    Unconfirmed,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sap {
    Arp,
    PacketData,
    ConvDataReg,
    SndcpCtrlData,
    UnencKmm,
    EncKmm,
    Other(u8),
}

impl Sap {
    pub fn from_raw(v: u8) -> Self {
        match v {
            0x00 => Sap::Arp,
            0x01 => Sap::PacketData,
            0x02 => Sap::ConvDataReg,
            0x03 => Sap::SndcpCtrlData,
            0x04 => Sap::UnencKmm,
            0x05 => Sap::EncKmm,
            other => Sap::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PduHeader {
    pub format: PduFormat,
    pub sap: Sap,
    pub llid: u32,
    pub blocks_to_follow: u8,
    /// Send-sequence number, present for confirmed PDUs.
    pub ns: Option<u8>,
    /// `synchronize` bit: forces V(R) to `N(S)+1 mod 8` regardless of the
    /// current window state (spec §4.7, §4 invariants).
    pub synchronize: bool,
}

/// Reassembles one in-progress PDU's data blocks.
pub struct PduAssembler {
    pub header: PduHeader,
    pub started_at: Instant,
    pub last_block_at: Instant,
    blocks: Vec<u8>,
    blocks_remaining: u8,
}

impl PduAssembler {
    pub fn begin(header: PduHeader) -> Self {
        let now = Instant::now();
        PduAssembler { blocks_remaining: header.blocks_to_follow, header, started_at: now, last_block_at: now, blocks: Vec::new() }
    }

    /// Feed one data block; returns the assembled payload once complete.
    pub fn feed(&mut self, block: &[u8]) -> Option<Vec<u8>> {
        self.blocks.extend_from_slice(block);
        self.last_block_at = Instant::now();
        if self.blocks_remaining > 0 {
            self.blocks_remaining -= 1;
        }
        if self.blocks_remaining == 0 { Some(std::mem::take(&mut self.blocks)) } else { None }
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_block_at) > PDU_IDLE_TIMEOUT
    }
}

/// Verdict for an inbound confirmed PDU's N(S) against the receiver's V(R)
/// (spec §4.7 "PACKET_DATA").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqVerdict {
    Accept,
    NackOutOfSeq,
}

/// Check and advance a receive window: accept when `n_s == v_r` (repeat) or
/// `n_s == (v_r + 1) mod 8` (next in sequence); `synchronize` forces
/// `v_r := n_s + 1 mod 8` unconditionally and accepts.
pub fn check_and_advance(v_r: &mut u8, n_s: u8, synchronize: bool) -> ArqVerdict {
    if synchronize {
        *v_r = (n_s + 1) % 8;
        return ArqVerdict::Accept;
    }
    if n_s == *v_r {
        *v_r = (n_s + 1) % 8;
        ArqVerdict::Accept
    } else if n_s == (*v_r + 1) % 8 {
        *v_r = (n_s + 1) % 8;
        ArqVerdict::Accept
    } else {
        ArqVerdict::NackOutOfSeq
    }
}

/// Advance an egress send-sequence counter, signalling wraparound so the
/// caller can set `synchronize` on the next header.
pub fn advance_send_seq(v_s: &mut u8) -> bool {
    let wrapped = *v_s == 7;
    *v_s = (*v_s + 1) % 8;
    wrapped
}

/// `LLID <-> IPv4` resolution, shared by ARP and static-RID lookups.
#[derive(Default)]
pub struct ArpTable {
    by_ip: parking_lot::Mutex<HashMap<Ipv4Addr, u32>>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn(&self, ip: Ipv4Addr, llid: u32) {
        self.by_ip.lock().insert(ip, llid);
    }

    pub fn resolve(&self, ip: Ipv4Addr) -> Option<u32> {
        self.by_ip.lock().get(&ip).copied()
    }

    pub fn forget(&self, ip: Ipv4Addr) {
        self.by_ip.lock().remove(&ip);
    }

    /// Remove every mapping pointing at `llid` (SNDCP deactivation, spec §4.7).
    pub fn forget_llid(&self, llid: u32) {
        self.by_ip.lock().retain(|_, v| *v != llid);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SndcpError {
    SuNotProvisioned,
    DynIpPoolEmpty,
}

/// Dynamic IPv4 pool for SNDCP context activation (spec §4.7
/// `SNDCP_CTRL_DATA`). Allocation is sequential over `[start, end]` with
/// uniqueness enforced against the shared ARP table.
pub struct SndcpPool {
    start: u32,
    end: u32,
    next: parking_lot::Mutex<u32>,
}

impl SndcpPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        let start_u32 = u32::from(start);
        SndcpPool { start: start_u32, end: u32::from(end), next: parking_lot::Mutex::new(start_u32) }
    }

    /// Allocate the next free dynamic address for `llid`, skipping any
    /// address already resolved in `arp`.
    pub fn allocate(&self, llid: u32, arp: &ArpTable) -> Result<Ipv4Addr, SndcpError> {
        let mut cursor = self.next.lock();
        let span = self.end - self.start + 1;
        for _ in 0..span {
            let candidate = Ipv4Addr::from(*cursor);
            *cursor = if *cursor == self.end { self.start } else { *cursor + 1 };
            if arp.resolve(candidate).is_none() {
                arp.learn(candidate, llid);
                return Ok(candidate);
            }
        }
        Err(SndcpError::DynIpPoolEmpty)
    }
}

/// `CONV_DATA_REG` LLID->IPv4 mapping table (connect/disconnect).
#[derive(Default)]
pub struct ConvDataRegTable {
    inner: parking_lot::Mutex<HashMap<u32, Ipv4Addr>>,
}

impl ConvDataRegTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, llid: u32, ip: Ipv4Addr) {
        self.inner.lock().insert(llid, ip);
    }

    pub fn disconnect(&self, llid: u32) {
        self.inner.lock().remove(&llid);
    }

    pub fn lookup(&self, llid: u32) -> Option<Ipv4Addr> {
        self.inner.lock().get(&llid).copied()
    }
}

/// One queued egress PDU awaiting ARP resolution (spec §4.7 "Egress path").
pub struct QueuedEgress {
    pub dest_ip: Ipv4Addr,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub last_attempt: Instant,
    pub extended_budget: bool,
}

impl QueuedEgress {
    pub fn new(dest_ip: Ipv4Addr, payload: Vec<u8>) -> Self {
        QueuedEgress { dest_ip, payload, attempts: 0, last_attempt: Instant::now(), extended_budget: false }
    }

    /// Has the retry budget been exhausted for this queued egress?
    pub fn exhausted(&self) -> bool {
        let budget = if self.extended_budget { MAX_PKT_RETRY_CNT * 2 } else { MAX_PKT_RETRY_CNT };
        self.attempts >= budget
    }

    pub fn retry_interval(&self) -> Duration {
        if self.extended_budget { SUBSCRIBER_READY_RETRY_MS } else { ARP_RETRY_MS }
    }

    pub fn due(&self, now: Instant) -> bool {
        now.duration_since(self.last_attempt) >= self.retry_interval()
    }
}

const CRC32_POLY: u32 = 0xEDB88320;

fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ CRC32_POLY } else { crc >> 1 };
        }
    }
    !crc
}

/// PDU user-data CRC-32, replicating the wire format's "big-endian
/// reversed" quirk (spec §9 design notes): every 2-byte pair in the first
/// `len - 4` bytes is byte-swapped before the CRC is computed, and the
/// trailing 4-byte CRC field is stored with its byte order reversed.
pub fn pdu_crc32(data: &[u8]) -> [u8; 4] {
    let body_len = data.len().saturating_sub(4).min(data.len());
    let mut swapped = data[..body_len].to_vec();
    let mut i = 0;
    while i + 1 < swapped.len() {
        swapped.swap(i, i + 1);
        i += 2;
    }
    let crc = crc32_ieee(&swapped);
    let mut out = crc.to_be_bytes();
    out.reverse();
    out
}

/// Verify a received PDU's trailing CRC-32 field against its user data,
/// applying the same byte-reordering as [`pdu_crc32`].
pub fn pdu_crc32_valid(data_with_crc: &[u8]) -> bool {
    if data_with_crc.len() < 4 {
        return false;
    }
    let (body, trailing) = data_with_crc.split_at(data_with_crc.len() - 4);
    let mut full = body.to_vec();
    full.extend_from_slice(trailing);
    pdu_crc32(&full) == trailing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_crc_is_deterministic_and_validates() {
        let body = vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let crc = pdu_crc32(&body);
        assert_eq!(crc, pdu_crc32(&body));

        let mut frame = body.clone();
        frame.extend_from_slice(&crc);
        assert!(pdu_crc32_valid(&frame));

        frame[0] ^= 0xFF;
        assert!(!pdu_crc32_valid(&frame));
    }

    #[test]
    fn arq_window_accepts_repeat_and_next_rejects_others() {
        // v_r starts at 3; a repeat of n_s=3 still advances v_r to the next
        // expected N(S), matching the original's `(receivedNs + 1) % 8`.
        let mut v_r = 3u8;
        assert_eq!(check_and_advance(&mut v_r, 3, false), ArqVerdict::Accept);
        assert_eq!(v_r, 4);
        assert_eq!(check_and_advance(&mut v_r, 4, false), ArqVerdict::Accept);
        assert_eq!(v_r, 5);
        assert_eq!(check_and_advance(&mut v_r, 7, false), ArqVerdict::NackOutOfSeq);
        assert_eq!(v_r, 5);
    }

    #[test]
    fn synchronize_forces_window() {
        let mut v_r = 0u8;
        assert_eq!(check_and_advance(&mut v_r, 5, true), ArqVerdict::Accept);
        assert_eq!(v_r, 6);
    }

    #[test]
    fn send_seq_wraps_past_seven() {
        let mut v_s = 7u8;
        assert!(advance_send_seq(&mut v_s));
        assert_eq!(v_s, 0);
        assert!(!advance_send_seq(&mut v_s));
    }

    #[test]
    fn sndcp_pool_allocates_sequentially_then_exhausts() {
        let pool = SndcpPool::new("10.10.1.1".parse().unwrap(), "10.10.1.2".parse().unwrap());
        let arp = ArpTable::new();
        let a = pool.allocate(100, &arp).unwrap();
        let b = pool.allocate(200, &arp).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocate(300, &arp), Err(SndcpError::DynIpPoolEmpty));
    }

    #[test]
    fn assembler_completes_after_declared_block_count() {
        let header = PduHeader { format: PduFormat::Confirmed, sap: Sap::PacketData, llid: 1, blocks_to_follow: 2, ns: Some(0), synchronize: false };
        let mut asm = PduAssembler::begin(header);
        assert!(asm.feed(&[1, 2]).is_none());
        let out = asm.feed(&[3, 4]).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }
}
