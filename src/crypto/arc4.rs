//! ARC4 (RC4) KSA/PRGA, used for the `$AA` P25 voice TEK algorithm. No
//! crate in the surrounding stack ships a plain RC4 implementation (it is
//! considered legacy-only even by RustCrypto), so this is a direct,
//! dependency-free port of the classical KSA/PRGA pair.

pub struct Arc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Arc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j = 0u8;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Arc4 { s, i: 0, j: 0 }
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        let k = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
        self.s[k as usize]
    }

    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next_byte();
        }
    }
}

/// Produce `len` bytes of RC4 keystream for `key` (keystream == RC4(0..0) under the key).
pub fn keystream(key: &[u8], len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    Arc4::new(key).apply_keystream(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer_vector() {
        // RFC 6229 test vector: key "Key", keystream starts EB9F7781 B734CA72 A719...
        let ks = keystream(b"Key", 4);
        assert_eq!(hex::encode(&ks), "eb9f7781");
    }
}
