//! P25 voice keystream generator: MI advance, IV expansion, per-algorithm
//! keystream tables and per-DUID IMBE XOR offsets. Ported from the
//! `P25Crypto` TEK handling (`generateNextMI`, `expandMIToIV`,
//! `generateKeystream`, `cryptDES_IMBE`/`cryptAES_IMBE`/`cryptARC4_IMBE`).

use super::{arc4, des};

pub const MI_LENGTH_BYTES: usize = 9;
pub const RAW_IMBE_LENGTH_BYTES: usize = 11;

pub const ALGO_DES: u8 = 0x81;
pub const ALGO_AES_256: u8 = 0x84;
pub const ALGO_ARC4: u8 = 0xAA;

/// P25 DUID values relevant to voice keystream offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duid {
    Ldu1,
    Ldu2,
}

/// Per-call keystream state: the rolling MI, the current TEK and the
/// materialized keystream table it was expanded into.
pub struct P25Crypto {
    pub algo_id: u8,
    pub key_id: u16,
    pub tek: Vec<u8>,
    pub mi: [u8; MI_LENGTH_BYTES],
    keystream: Vec<u8>,
    keystream_pos: usize,
}

impl P25Crypto {
    pub fn new(algo_id: u8, key_id: u16, tek: Vec<u8>) -> Self {
        P25Crypto {
            algo_id,
            key_id,
            tek,
            mi: [0u8; MI_LENGTH_BYTES],
            keystream: Vec::new(),
            keystream_pos: 0,
        }
    }

    pub fn set_mi(&mut self, mi: [u8; MI_LENGTH_BYTES]) {
        self.mi = mi;
    }

    pub fn has_valid_mi(&self) -> bool {
        self.mi.iter().any(|&b| b != 0)
    }

    pub fn has_valid_keystream(&self) -> bool {
        !self.tek.is_empty() && !self.keystream.is_empty()
    }

    pub fn reset_keystream(&mut self) {
        self.mi = [0u8; MI_LENGTH_BYTES];
        self.keystream.clear();
        self.keystream_pos = 0;
    }

    /// Advance the MI by one 64-cycle LFSR step (taps on bytes 0,2,3,4,6, bit
    /// positions 7,5,5,5,2,6 respectively) and store the result.
    pub fn generate_next_mi(&mut self) {
        let mut next = self.mi;
        for _ in 0..64 {
            let carry = ((next[0] >> 7) ^ (next[0] >> 5) ^ (next[2] >> 5) ^ (next[3] >> 5) ^ (next[4] >> 2) ^ (next[6] >> 6)) & 1;
            for i in 0..7 {
                next[i] = ((next[i] & 0x7F) << 1) | (next[i + 1] >> 7);
            }
            next[7] = ((next[7] & 0x7F) << 1) | carry;
        }
        self.mi = next;
    }

    /// The raw generated keystream, for non-IMBE callers (OTAR datagram
    /// encryption, spec §6) that XOR it directly rather than through
    /// [`Self::crypt_imbe`]'s per-DUID offset table.
    pub fn keystream_bytes(&self) -> &[u8] {
        &self.keystream
    }

    /// Generate the keystream table for the current `(algo_id, tek, mi)`.
    pub fn generate_keystream(&mut self) {
        self.keystream_pos = 0;
        self.keystream = match self.algo_id {
            ALGO_DES => generate_des_keystream(&self.tek, &self.mi),
            ALGO_AES_256 => generate_aes256_keystream(&self.tek, &self.mi),
            ALGO_ARC4 => generate_arc4_keystream(&self.tek, &self.mi),
            _ => Vec::new(),
        };
    }

    /// XOR one IMBE voice frame (11 bytes) at the fixed offset for `duid`,
    /// advancing the internal voice-frame index modulo 9.
    pub fn crypt_imbe(&mut self, imbe: &mut [u8; RAW_IMBE_LENGTH_BYTES], duid: Duid) {
        let gap = if self.keystream_pos < 8 { 0usize } else { 2 };
        let ldu2_bump = if duid == Duid::Ldu2 { 101 } else { 0 };
        let offset = match self.algo_id {
            ALGO_DES => 8 + ldu2_bump + self.keystream_pos * RAW_IMBE_LENGTH_BYTES + RAW_IMBE_LENGTH_BYTES + gap,
            ALGO_AES_256 => 16 + ldu2_bump + self.keystream_pos * RAW_IMBE_LENGTH_BYTES + RAW_IMBE_LENGTH_BYTES + gap,
            ALGO_ARC4 => ldu2_bump + self.keystream_pos * RAW_IMBE_LENGTH_BYTES + 267 + gap,
            _ => return,
        };
        self.keystream_pos = (self.keystream_pos + 1) % 9;
        if offset + RAW_IMBE_LENGTH_BYTES > self.keystream.len() {
            return;
        }
        for i in 0..RAW_IMBE_LENGTH_BYTES {
            imbe[i] ^= self.keystream[offset + i];
        }
    }
}

fn pack_be(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for &b in bytes {
        v = (v << 8) | b as u64;
    }
    v
}

/// One step of the 64-bit LFSR with feedback polynomial
/// x^64+x^62+x^46+x^38+x^27+x^15+1, returning the bit shifted out.
fn step_lfsr(lfsr: &mut u64) -> u8 {
    let overflow_bit = ((*lfsr >> 63) & 1) as u8;
    let feedback = ((*lfsr >> 63) ^ (*lfsr >> 61) ^ (*lfsr >> 45) ^ (*lfsr >> 37) ^ (*lfsr >> 26) ^ (*lfsr >> 14)) & 1;
    *lfsr = (*lfsr << 1) | feedback;
    overflow_bit
}

/// Expand the first 8 bytes of the MI into a 16-byte AES IV: run the LFSR
/// 64 steps from that seed, collecting the bits shifted out as the IV's
/// high 8 bytes, then emit the final LFSR state as the low 8 bytes.
pub fn expand_mi_to_iv(mi: &[u8; MI_LENGTH_BYTES]) -> [u8; 16] {
    let mut lfsr = pack_be(&mi[0..8]);
    let mut overflow = 0u64;
    for _ in 0..64 {
        overflow = (overflow << 1) | step_lfsr(&mut lfsr) as u64;
    }
    let mut iv = [0u8; 16];
    for i in 0..8 {
        iv[7 - i] = (overflow >> (8 * i)) as u8;
    }
    for i in 0..8 {
        iv[15 - i] = (lfsr >> (8 * i)) as u8;
    }
    iv
}

fn generate_des_keystream(tek: &[u8], mi: &[u8; MI_LENGTH_BYTES]) -> Vec<u8> {
    const KEYSTREAM_LEN: usize = 224;
    let pad_len = 8usize.saturating_sub(tek.len());
    let mut key = [0u8; 8];
    key[pad_len..].copy_from_slice(&tek[..8 - pad_len]);

    let mut out = Vec::with_capacity(KEYSTREAM_LEN);
    let mut block: [u8; 8] = mi[0..8].try_into().unwrap();
    for _ in 0..(KEYSTREAM_LEN / 8) {
        block = des::encrypt_block(&block, &key);
        out.extend_from_slice(&block);
    }
    out
}

fn generate_aes256_keystream(tek: &[u8], mi: &[u8; MI_LENGTH_BYTES]) -> Vec<u8> {
    const KEYSTREAM_LEN: usize = 240;
    let mut key = [0u8; 32];
    let n = tek.len().min(32);
    key[..n].copy_from_slice(&tek[..n]);

    let mut out = Vec::with_capacity(KEYSTREAM_LEN);
    let mut block = expand_mi_to_iv(mi);
    for _ in 0..(KEYSTREAM_LEN / 16) {
        block = super::aes::encrypt_block_ecb_256(&block, &key);
        out.extend_from_slice(&block);
    }
    out
}

fn generate_arc4_keystream(tek: &[u8], mi: &[u8; MI_LENGTH_BYTES]) -> Vec<u8> {
    const KEYSTREAM_LEN: usize = 469;
    let take = tek.len().min(5);
    let pad_len = 5 - take;
    let mut key = Vec::with_capacity(13);
    key.resize(pad_len, 0u8);
    key.extend_from_slice(&tek[..take]);
    key.extend_from_slice(&mi[0..8]);
    arc4::keystream(&key, KEYSTREAM_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes256_keystream_is_deterministic_and_240_bytes() {
        let mut a = P25Crypto::new(ALGO_AES_256, 1, vec![0x22u8; 32]);
        a.set_mi([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
        a.generate_keystream();
        let mut b = P25Crypto::new(ALGO_AES_256, 1, vec![0x22u8; 32]);
        b.set_mi([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
        b.generate_keystream();
        assert_eq!(a.keystream, b.keystream);
        assert_eq!(a.keystream.len(), 240);
    }

    #[test]
    fn des_keystream_is_224_bytes() {
        let mut c = P25Crypto::new(ALGO_DES, 1, vec![0x11u8; 8]);
        c.set_mi([9, 8, 7, 6, 5, 4, 3, 2, 1]);
        c.generate_keystream();
        assert_eq!(c.keystream.len(), 224);
    }

    #[test]
    fn arc4_keystream_is_469_bytes() {
        let mut c = P25Crypto::new(ALGO_ARC4, 1, vec![0x11u8; 5]);
        c.set_mi([9, 8, 7, 6, 5, 4, 3, 2, 1]);
        c.generate_keystream();
        assert_eq!(c.keystream.len(), 469);
    }

    #[test]
    fn mi_advance_changes_state() {
        let mut c = P25Crypto::new(ALGO_AES_256, 1, vec![0x22u8; 32]);
        c.set_mi([1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let before = c.mi;
        c.generate_next_mi();
        assert_ne!(before, c.mi);
    }
}
