//! Fragmented multi-block carrier for large ACL/REPL transfers (spec §2,
//! §4.2 "Metadata distribution": "raw ACL files as fragmented, compressed
//! packet-buffer transfers"). This module owns fragmentation/reassembly
//! only — compression, if any, is applied by the caller before `encode`
//! and reversed after `decode_all`/`Reassembler::feed` return, since the
//! wire format does not mandate a specific codec.
//!
//! Each fragment prepends a small header so reassembly doesn't depend on
//! external framing: `{total_len: u32, fragment_index: u16, fragment_count: u16}`
//! followed by that fragment's chunk of the payload.

use std::collections::BTreeMap;

/// Fragments are sized to stay well under a UDP datagram's safe payload,
/// leaving headroom for the RTP+FNE header ahead of them on the wire.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub total_len: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub chunk: Vec<u8>,
}

impl Fragment {
    pub const HEADER_LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.chunk.len());
        out.extend_from_slice(&self.total_len.to_be_bytes());
        out.extend_from_slice(&self.fragment_index.to_be_bytes());
        out.extend_from_slice(&self.fragment_count.to_be_bytes());
        out.extend_from_slice(&self.chunk);
        out
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        if buf.len() < Self::HEADER_LEN {
            anyhow::bail!("short packet-buffer fragment");
        }
        Ok(Fragment {
            total_len: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            fragment_index: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
            fragment_count: u16::from_be_bytes(buf[6..8].try_into().unwrap()),
            chunk: buf[Self::HEADER_LEN..].to_vec(),
        })
    }
}

/// Split `payload` into fragments of at most [`MAX_FRAGMENT_PAYLOAD`] bytes.
/// An empty payload still produces one (empty) fragment so the reassembler
/// has something to complete on.
pub fn encode(payload: &[u8]) -> Vec<Fragment> {
    if payload.is_empty() {
        return vec![Fragment { total_len: 0, fragment_index: 0, fragment_count: 1, chunk: Vec::new() }];
    }
    let total_len = payload.len() as u32;
    let fragment_count = payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD) as u16;
    payload
        .chunks(MAX_FRAGMENT_PAYLOAD)
        .enumerate()
        .map(|(i, chunk)| Fragment { total_len, fragment_index: i as u16, fragment_count, chunk: chunk.to_vec() })
        .collect()
}

/// Reassembler accumulating fragments, not assuming arrival order (spec §5:
/// "no global ordering is provided" across a peer's inbound traffic).
#[derive(Default)]
pub struct Reassembler {
    fragment_count: Option<u16>,
    total_len: u32,
    received: BTreeMap<u16, Vec<u8>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the reassembled payload once every
    /// fragment named by `fragment_count` has arrived.
    pub fn feed(&mut self, fragment: Fragment) -> Option<Vec<u8>> {
        self.fragment_count = Some(fragment.fragment_count);
        self.total_len = fragment.total_len;
        self.received.insert(fragment.fragment_index, fragment.chunk);
        if self.received.len() as u16 == fragment.fragment_count {
            let mut out = Vec::with_capacity(self.total_len as usize);
            for (_, chunk) in std::mem::take(&mut self.received) {
                out.extend_from_slice(&chunk);
            }
            Some(out)
        } else {
            None
        }
    }
}

/// Reassemble a complete, already-collected set of encoded fragments
/// (spec §8 "Packet buffer" round-trip law).
pub fn decode_all(fragments: &[Vec<u8>]) -> anyhow::Result<Vec<u8>> {
    let mut reassembler = Reassembler::new();
    let mut out = None;
    for raw in fragments {
        let fragment = Fragment::decode(raw)?;
        out = reassembler.feed(fragment);
    }
    out.ok_or_else(|| anyhow::anyhow!("packet-buffer fragments incomplete"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_payload_smaller_than_one_fragment() {
        let payload = b"RID_LIST:1000,2000,3000".to_vec();
        let fragments: Vec<Vec<u8>> = encode(&payload).iter().map(|f| f.encode()).collect();
        assert_eq!(fragments.len(), 1);
        assert_eq!(decode_all(&fragments).unwrap(), payload);
    }

    #[test]
    fn round_trips_payload_spanning_many_fragments() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let fragments: Vec<Vec<u8>> = encode(&payload).iter().map(|f| f.encode()).collect();
        assert!(fragments.len() > 1);
        assert_eq!(decode_all(&fragments).unwrap(), payload);
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 256) as u8).collect();
        let mut fragments = encode(&payload);
        fragments.reverse();
        let mut reassembler = Reassembler::new();
        let mut out = None;
        for f in fragments {
            out = reassembler.feed(f);
        }
        assert_eq!(out.unwrap(), payload);
    }

    #[test]
    fn empty_payload_round_trips() {
        let fragments: Vec<Vec<u8>> = encode(&[]).iter().map(|f| f.encode()).collect();
        assert_eq!(decode_all(&fragments).unwrap(), Vec::<u8>::new());
    }
}
