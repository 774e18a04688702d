//! RTP+FNE frame codec and transport-level opcode table (spec §4.1, §6).
//!
//! Every traffic datagram is `[12-byte RTP header][10-byte FNE header][body]`.
//! The core treats the body past its parse window as opaque per-protocol
//! payload (DMR/P25/NXDN/analog air-interface bytes the router inspects only
//! for source/destination IDs, DUID, MI, algorithm-id, key-id and status
//! bits).

use std::time::Duration;

/// A stream is "late" if processed more than this long after receipt.
pub const LATE_FRAME_THRESHOLD: Duration = Duration::from_millis(200);

/// Sentinel packet-sequence value marking terminator frames; never assigned
/// by the per-destination sequence counter.
pub const END_OF_CALL_SEQ: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub const LEN: usize = 12;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = 0x80; // V=2, P=0, X=0, CC=0
        out[1] = 0x00; // M=0, PT=0
        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < Self::LEN {
            anyhow::bail!("short rtp header");
        }
        Ok(RtpHeader {
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Function {
    Protocol = 0,
    Rptl = 1,
    Rptk = 2,
    Rptc = 3,
    RptDisc = 4,
    Ping = 5,
    Pong = 6,
    Ack = 7,
    Nak = 8,
    GrantReq = 9,
    InCallCtrl = 10,
    KeyReq = 11,
    KeyRsp = 12,
    Announce = 13,
    Repl = 14,
    NetTree = 15,
    Master = 16,
}

impl Function {
    pub fn from_u8(v: u8) -> anyhow::Result<Self> {
        use Function::*;
        Ok(match v {
            0 => Protocol,
            1 => Rptl,
            2 => Rptk,
            3 => Rptc,
            4 => RptDisc,
            5 => Ping,
            6 => Pong,
            7 => Ack,
            8 => Nak,
            9 => GrantReq,
            10 => InCallCtrl,
            11 => KeyReq,
            12 => KeyRsp,
            13 => Announce,
            14 => Repl,
            15 => NetTree,
            16 => Master,
            other => anyhow::bail!("unknown FNE function {other}"),
        })
    }
}

/// Protocol sub-function, selected when `function == Protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolSub {
    Dmr = 0,
    P25 = 1,
    Nxdn = 2,
    Analog = 3,
}

/// Announcement sub-function, selected when `function == Announce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnounceSub {
    GrpAffil = 0,
    UnitReg = 1,
    UnitDereg = 2,
    GrpUnaffil = 3,
    Affils = 4,
    SiteVc = 5,
}

/// Replication sub-function, selected when `function == Repl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplSub {
    RidList = 0,
    TalkgroupList = 1,
    PeerList = 2,
    HaParams = 3,
    ActPeerList = 4,
}

/// Spanning-tree sub-function, selected when `function == NetTree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetTreeSub {
    Disc = 0,
    List = 1,
}

/// Master-to-peer metadata sub-function, selected when `function == Master`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterSub {
    WlRid = 0,
    BlRid = 1,
    ActiveTgs = 2,
    DeactiveTgs = 3,
    HaParams = 4,
}

/// NAK reasons (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NakReason {
    ModeNotEnabled = 0,
    IllegalPacket = 1,
    FneUnauthorized = 2,
    BadConnState = 3,
    InvalidConfigData = 4,
    FneMaxConn = 5,
    PeerReset = 6,
    PeerAcl = 7,
    FneDuplicateConn = 8,
    GeneralFailure = 9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FneHeader {
    pub function: Function,
    pub sub_function: u8,
    pub peer_id: u32,
    pub stream_id: u32,
}

impl FneHeader {
    pub const LEN: usize = 10;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.function as u8;
        out[1] = self.sub_function;
        out[2..6].copy_from_slice(&self.peer_id.to_be_bytes());
        out[6..10].copy_from_slice(&self.stream_id.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < Self::LEN {
            anyhow::bail!("short FNE header");
        }
        Ok(FneHeader {
            function: Function::from_u8(buf[0])?,
            sub_function: buf[1],
            peer_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            stream_id: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

/// A fully parsed traffic datagram: RTP header, FNE header, and the opaque
/// protocol body past the parse window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub rtp: RtpHeader,
    pub fne: FneHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RtpHeader::LEN + FneHeader::LEN + self.body.len());
        out.extend_from_slice(&self.rtp.encode());
        out.extend_from_slice(&self.fne.encode());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let rtp = RtpHeader::decode(buf)?;
        let fne = FneHeader::decode(&buf[RtpHeader::LEN..])?;
        let body = buf[RtpHeader::LEN + FneHeader::LEN..].to_vec();
        Ok(Frame { rtp, fne, body })
    }
}

/// Classification of an inbound frame's stream sequence relative to the
/// previously observed sequence for that (peer, stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    Valid,
    OutOfOrder,
    /// Missing sequence range `(from, to)`, inclusive.
    LostFrames(u16, u16),
}

/// Classify `seq` given the previously observed sequence for this stream.
/// Does not drop or reorder the packet; callers log the verdict only.
pub fn verify_sequence(previous: Option<u16>, seq: u16) -> SeqVerdict {
    match previous {
        None => SeqVerdict::Valid,
        Some(prev) => {
            let expected = prev.wrapping_add(1);
            if seq == expected {
                SeqVerdict::Valid
            } else if seq <= prev {
                SeqVerdict::OutOfOrder
            } else {
                SeqVerdict::LostFrames(expected, seq.wrapping_sub(1))
            }
        }
    }
}

/// Per-destination, per-stream outbound sequence counter. `END_OF_CALL_SEQ`
/// is assigned verbatim for terminator frames and never advances the
/// counter.
#[derive(Debug, Default)]
pub struct OutboundSeq {
    next: u16,
}

impl OutboundSeq {
    pub fn next_for_frame(&mut self, is_terminator: bool) -> u16 {
        if is_terminator {
            return END_OF_CALL_SEQ;
        }
        let seq = self.next;
        // Skip the sentinel on wrap: END_OF_CALL_SEQ is reserved for
        // terminator frames and must never be counter-driven (spec §4.1).
        self.next = if seq == END_OF_CALL_SEQ.wrapping_sub(1) { 0 } else { seq.wrapping_add(1) };
        seq
    }
}

/// True if `received` is more than [`LATE_FRAME_THRESHOLD`] older than `now`.
/// Late frames are still processed; this only drives a warning log.
pub fn is_late(received: std::time::Instant, now: std::time::Instant) -> bool {
    now.saturating_duration_since(received) > LATE_FRAME_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fne_header_round_trips() {
        let h = FneHeader { function: Function::Protocol, sub_function: ProtocolSub::P25 as u8, peer_id: 42, stream_id: 0xAABBCCDD };
        let encoded = h.encode();
        let decoded = FneHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn sequence_verifier_classifies_correctly() {
        assert_eq!(verify_sequence(Some(5), 6), SeqVerdict::Valid);
        assert_eq!(verify_sequence(Some(5), 5), SeqVerdict::OutOfOrder);
        assert_eq!(verify_sequence(Some(5), 9), SeqVerdict::LostFrames(6, 8));
    }

    #[test]
    fn outbound_seq_never_assigns_end_of_call_by_counting() {
        let mut seq = OutboundSeq::default();
        for _ in 0..10 {
            assert_ne!(seq.next_for_frame(false), END_OF_CALL_SEQ);
        }
        assert_eq!(seq.next_for_frame(true), END_OF_CALL_SEQ);
    }

    #[test]
    fn outbound_seq_skips_sentinel_on_wraparound() {
        let mut seq = OutboundSeq { next: END_OF_CALL_SEQ - 1 };
        assert_eq!(seq.next_for_frame(false), END_OF_CALL_SEQ - 1);
        assert_eq!(seq.next_for_frame(false), 0);
    }
}
