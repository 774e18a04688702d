//! AES-128/256 ECB/CBC and AES-256 KeyWrap, backed by RustCrypto's `aes`,
//! `ecb`, `cbc` and `aes-kw` crates (the family the pack already leans on
//! for `sha2`/`hmac`/`hkdf`-flavoured primitives).

use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// Static IV mandated by TIA-102.AACA-C-2023 §13.3 for AES-256 KeyWrap of TEKs.
pub const KEYWRAP_IV: [u8; 8] = [0xA6; 8];

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Single-block AES-256 ECB encrypt, used to chain the AES-256 voice keystream.
pub fn encrypt_block_ecb_256(block: &[u8; 16], key: &[u8; 32]) -> [u8; 16] {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    buf.into()
}

/// AES-256-CBC encrypt over already block-aligned data (the KMM CBC-MAC/CBC
/// schemes pad the message to a 16-byte boundary themselves before calling
/// this, so no padding mode is applied here).
pub fn encrypt_cbc_256(data: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> anyhow::Result<Vec<u8>> {
    if data.len() % 16 != 0 {
        anyhow::bail!("cbc input must be block-aligned");
    }
    let enc = Aes256CbcEnc::new(key.into(), iv.into());
    let mut buf = data.to_vec();
    enc.encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, data.len())
        .map_err(|e| anyhow::anyhow!("cbc encrypt failed: {e}"))?;
    Ok(buf)
}

pub fn decrypt_cbc_256(data: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> anyhow::Result<Vec<u8>> {
    if data.len() % 16 != 0 {
        anyhow::bail!("cbc input must be block-aligned");
    }
    let dec = Aes256CbcDec::new(key.into(), iv.into());
    let mut buf = data.to_vec();
    let out = dec
        .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
        .map_err(|e| anyhow::anyhow!("cbc decrypt failed: {e}"))?;
    Ok(out.to_vec())
}

/// AES-256 KeyWrap (RFC 3394), used to wrap TEKs in a Rekey-Command under a
/// UKEK. `aes-kw`'s `wrap`/`unwrap` use the RFC 3394 default IV, which is
/// [`KEYWRAP_IV`] — the same `0xA6` IV TIA-102.AACA-C-2023 §13.3 mandates —
/// so no custom-IV plumbing is needed.
pub fn keywrap_256(kek: &[u8; 32], key_to_wrap: &[u8]) -> anyhow::Result<Vec<u8>> {
    use aes_kw::KekAes256;
    let kek = KekAes256::new(kek.into());
    let mut out = vec![0u8; key_to_wrap.len() + 8];
    kek.wrap(key_to_wrap, &mut out)
        .map_err(|e| anyhow::anyhow!("key wrap failed: {e:?}"))?;
    Ok(out)
}

pub fn keyunwrap_256(kek: &[u8; 32], wrapped: &[u8]) -> anyhow::Result<Vec<u8>> {
    use aes_kw::KekAes256;
    let kek = KekAes256::new(kek.into());
    let mut out = vec![0u8; wrapped.len() - 8];
    kek.unwrap(wrapped, &mut out)
        .map_err(|e| anyhow::anyhow!("key unwrap failed: {e:?}"))?;
    Ok(out)
}

/// AES-256-CBC-based CMAC over the padded KMM message, used as the
/// alternative (non-legacy) OTAR MAC scheme.
pub fn cmac_256(key: &[u8; 32], message: &[u8]) -> [u8; 16] {
    use cmac::Mac;
    let mut mac = cmac::Cmac::<Aes256>::new(key.into());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecb_chain_is_deterministic() {
        let key = [0x11u8; 32];
        let a = encrypt_block_ecb_256(&[0u8; 16], &key);
        let b = encrypt_block_ecb_256(&[0u8; 16], &key);
        assert_eq!(a, b);
    }

    #[test]
    fn keywrap_round_trips() {
        let kek = [0x5Au8; 32];
        let tek = [0x01u8; 32];
        let wrapped = keywrap_256(&kek, &tek).unwrap();
        let unwrapped = keyunwrap_256(&kek, &wrapped).unwrap();
        assert_eq!(unwrapped, tek);
    }
}
