//! KMM message-authentication helpers: the legacy CBC-MAC scheme and the
//! KBKDF-derived CMAC scheme (`cryptAES_KMM_CBC`/`cryptAES_KMM_CBC_KDF` and
//! `cryptAES_KMM_CMAC`/`cryptAES_KMM_CMAC_KDF` in the original KMF).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::aes;

const CBC_MAC_LEN: usize = 8;
const OTAR_MAC_LABEL: &[u8] = b"OTAR MAC";

/// Pad a KMM message the way the legacy CBC-MAC scheme does: drop the
/// trailing `MAC_LEN + 5` bytes (reserved for the MAC and trailer), then
/// append the message's last 5 bytes back, leaving a block-aligned buffer.
fn cbc_mac_pad(message: &[u8]) -> Vec<u8> {
    let keep = message.len().saturating_sub(CBC_MAC_LEN + 5);
    let mut padded = message[..keep].to_vec();
    let tail_start = message.len().saturating_sub(5);
    padded.extend_from_slice(&message[tail_start..]);
    let rem = padded.len() % 16;
    if rem != 0 {
        padded.resize(padded.len() + (16 - rem), 0);
    }
    padded
}

/// Legacy CBC-MAC: AES-256-CBC encrypt the padded message under a zero IV
/// and take the trailing 8 bytes of ciphertext as the MAC.
pub fn cbc_mac(kek: &[u8; 32], message: &[u8]) -> anyhow::Result<[u8; CBC_MAC_LEN]> {
    let padded = cbc_mac_pad(message);
    let cipher = aes::encrypt_cbc_256(&padded, kek, &[0u8; 16])?;
    let tail = &cipher[cipher.len() - CBC_MAC_LEN..];
    let mut mac = [0u8; CBC_MAC_LEN];
    mac.copy_from_slice(tail);
    Ok(mac)
}

/// KBKDF (NIST SP 800-108 counter mode, HMAC-SHA256) deriving a 32-byte MAC
/// key from a KEK, with the fixed `"OTAR MAC"` label and a message-derived
/// context (first 10 or 12 bytes depending on whether the KMM carries a
/// message number).
pub fn kbkdf_mac_key(kek: &[u8; 32], context: &[u8]) -> [u8; 32] {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(kek).expect("hmac accepts any key length");
    mac.update(&1u32.to_be_bytes());
    mac.update(OTAR_MAC_LABEL);
    mac.update(&[0u8]);
    mac.update(context);
    mac.update(&256u32.to_be_bytes());
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&out);
    key
}

/// Derive the context bytes used by `kbkdf_mac_key`: the first 12 bytes of
/// the message when it carries a message number, else the first 10.
pub fn kmm_context(message: &[u8], has_message_number: bool) -> Vec<u8> {
    let n = if has_message_number { 12 } else { 10 };
    message[..n.min(message.len())].to_vec()
}

/// AES-256-CBC-based CMAC over the same padding scheme as `cbc_mac`, keyed
/// by a KBKDF-derived key rather than the raw KEK.
pub fn cmac_kdf(kek: &[u8; 32], message: &[u8], has_message_number: bool) -> [u8; 16] {
    let context = kmm_context(message, has_message_number);
    let mac_key = kbkdf_mac_key(kek, &context);
    let padded = cbc_mac_pad(message);
    aes::cmac_256(&mac_key, &padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_mac_is_deterministic() {
        let kek = [0x44u8; 32];
        let msg = vec![0xAAu8; 40];
        let a = cbc_mac(&kek, &msg).unwrap();
        let b = cbc_mac(&kek, &msg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cmac_kdf_is_deterministic() {
        let kek = [0x77u8; 32];
        let msg = vec![0x11u8; 50];
        let a = cmac_kdf(&kek, &msg, true);
        let b = cmac_kdf(&kek, &msg, true);
        assert_eq!(a, b);
    }
}
