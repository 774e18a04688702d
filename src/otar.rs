//! P25 OTAR/KMM service: inbound KMM dispatch, Rekey-Command construction
//! and the key-request forward/pending-queue path (spec §4.8).

use std::collections::HashMap;

use tracing::{info, warn};

use crate::acl::KeyContainer;
use crate::crypto::aes::keywrap_256;
use crate::crypto::kmm_mac::cbc_mac;

/// KMM message IDs the service dispatches on (subset relevant to the core).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmmMessageId {
    Hello,
    Nak,
    RekeyAck,
    RegRsp,
    UnableToDecrypt,
    DeregCmd,
    KeyReq,
    ModifyKey,
    DeregResponse,
}

#[derive(Debug, Clone)]
pub struct KmmMessage {
    pub message_id: KmmMessageId,
    pub message_number: Option<u16>,
    pub src_llid: u32,
    pub dst_llid: u32,
    pub body: Vec<u8>,
}

/// Outcome of dispatching one inbound KMM message.
#[derive(Debug, Clone)]
pub enum KmmOutcome {
    /// Send `Dereg_Response` with `CMD_PERFORMED` back to `dst_llid`.
    DeregResponse { dst_llid: u32 },
    /// Respond `NoService` (spec §4.8, §9 open question: current policy).
    NoService { dst_llid: u32 },
    /// A `KMMModifyKey` was synthesized locally for an inbound `KEY_REQ` hit.
    ModifyKeyResponse { dst_llid: u32, payload: Vec<u8> },
    /// Local key-container miss: forward upstream and queue the peer.
    ForwardUpstream { key_id: u16, requesting_peer: u32 },
    /// Informational message logged and otherwise dropped.
    Logged,
}

/// A `KMMModifyKey` Rekey-Command built from the key container, targeted at
/// one RSI's UKEK (spec §4.8 "Rekey-Command (OSP)").
pub struct RekeyCommand {
    pub payload: Vec<u8>,
    pub mac: [u8; 8],
    /// Set when any key in the payload shipped unwrapped because no UKEK
    /// was provisioned and `allow_no_ukek_rekey` permitted it.
    pub shipped_plaintext: bool,
}

/// Build a Rekey-Command carrying every key in `keys`, wrapped under
/// `ukek` when present. `allow_plaintext_fallback` mirrors
/// `FneConfig::allow_no_ukek_rekey`.
pub fn build_rekey_command(keys: &KeyContainer, ukek: Option<&[u8; 32]>, allow_plaintext_fallback: bool) -> anyhow::Result<RekeyCommand> {
    let mut payload = Vec::new();
    let mut shipped_plaintext = false;

    for (key_id, entry) in keys.all() {
        payload.extend_from_slice(&key_id.to_be_bytes());
        payload.push(entry.algo_id);

        let key_ukek = entry.ukek.as_ref().or(ukek);
        match key_ukek {
            Some(kek) => {
                let wrapped = keywrap_256(kek, &entry.key)?;
                payload.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
                payload.extend_from_slice(&wrapped);
            }
            None if allow_plaintext_fallback => {
                warn!(key_id, "shipping TEK in plaintext: no UKEK provisioned for this RSI and allow_no_ukek_rekey is set");
                shipped_plaintext = true;
                payload.extend_from_slice(&(entry.key.len() as u16).to_be_bytes());
                payload.extend_from_slice(&entry.key);
            }
            None => anyhow::bail!("key {key_id} has no UKEK and allow_no_ukek_rekey is not set"),
        }
    }

    let mac_kek = ukek.copied().unwrap_or([0u8; 32]);
    let mac = cbc_mac(&mac_kek, &payload)?;
    Ok(RekeyCommand { payload, mac, shipped_plaintext })
}

/// Dispatch one inbound KMM message, consulting the local key container for
/// `KEY_REQ` (spec §4.8 message table and key-request flow).
pub fn dispatch_inbound(msg: &KmmMessage, keys: &KeyContainer, requesting_peer: u32, peer_may_request_keys: bool) -> KmmOutcome {
    match msg.message_id {
        KmmMessageId::Hello => KmmOutcome::NoService { dst_llid: msg.src_llid },
        KmmMessageId::Nak | KmmMessageId::RekeyAck | KmmMessageId::RegRsp | KmmMessageId::UnableToDecrypt => {
            info!(message = ?msg.message_id, src = msg.src_llid, "KMM status message");
            KmmOutcome::Logged
        }
        KmmMessageId::DeregCmd => KmmOutcome::DeregResponse { dst_llid: msg.src_llid },
        KmmMessageId::KeyReq => {
            if !peer_may_request_keys {
                return KmmOutcome::Logged;
            }
            if msg.body.len() < 2 {
                return KmmOutcome::Logged;
            }
            let key_id = u16::from_be_bytes([msg.body[0], msg.body[1]]);
            match keys.get(key_id) {
                Some(entry) => {
                    let mut payload = Vec::new();
                    payload.extend_from_slice(&key_id.to_be_bytes());
                    payload.push(entry.algo_id);
                    payload.extend_from_slice(&entry.key);
                    KmmOutcome::ModifyKeyResponse { dst_llid: msg.src_llid, payload }
                }
                None => KmmOutcome::ForwardUpstream { key_id, requesting_peer },
            }
        }
        KmmMessageId::ModifyKey | KmmMessageId::DeregResponse => KmmOutcome::Logged,
    }
}

/// Pending-queue for `KEY_REQ`s forwarded upstream: `kid -> waiting peers`.
/// Flushed when the upstream response for that `kid` arrives (spec §4.8).
#[derive(Default)]
pub struct PendingKeyRequests {
    inner: parking_lot::Mutex<HashMap<u16, Vec<u32>>>,
}

impl PendingKeyRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key_id: u16, peer_id: u32) {
        self.inner.lock().entry(key_id).or_default().push(peer_id);
    }

    /// Drain and return every peer waiting on `key_id`, for fan-out of the
    /// upstream `KMMModifyKey` response.
    pub fn flush(&self, key_id: u16) -> Vec<u32> {
        self.inner.lock().remove(&key_id).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::KeyEntry;

    fn container_with_one_key() -> KeyContainer {
        let mut keys = KeyContainer::new();
        keys.insert(7, KeyEntry { algo_id: 0x84, key: vec![0x42; 32], ukek: None });
        keys
    }

    #[test]
    fn hello_gets_no_service() {
        let keys = container_with_one_key();
        let msg = KmmMessage { message_id: KmmMessageId::Hello, message_number: None, src_llid: 100, dst_llid: 200, body: vec![] };
        assert!(matches!(dispatch_inbound(&msg, &keys, 1, true), KmmOutcome::NoService { dst_llid: 100 }));
    }

    #[test]
    fn key_req_hit_returns_modify_key() {
        let keys = container_with_one_key();
        let msg = KmmMessage { message_id: KmmMessageId::KeyReq, message_number: None, src_llid: 100, dst_llid: 200, body: vec![0, 7] };
        match dispatch_inbound(&msg, &keys, 1, true) {
            KmmOutcome::ModifyKeyResponse { dst_llid, .. } => assert_eq!(dst_llid, 100),
            other => panic!("expected modify-key response, got {other:?}"),
        }
    }

    #[test]
    fn key_req_miss_forwards_upstream_and_queues() {
        let keys = container_with_one_key();
        let msg = KmmMessage { message_id: KmmMessageId::KeyReq, message_number: None, src_llid: 100, dst_llid: 200, body: vec![0, 9] };
        match dispatch_inbound(&msg, &keys, 42, true) {
            KmmOutcome::ForwardUpstream { key_id, requesting_peer } => {
                assert_eq!(key_id, 9);
                assert_eq!(requesting_peer, 42);
            }
            other => panic!("expected forward upstream, got {other:?}"),
        }
        let pending = PendingKeyRequests::new();
        pending.enqueue(9, 42);
        assert_eq!(pending.flush(9), vec![42]);
        assert!(pending.flush(9).is_empty());
    }

    #[test]
    fn rekey_command_falls_back_to_plaintext_when_allowed() {
        let keys = container_with_one_key();
        let cmd = build_rekey_command(&keys, None, true).unwrap();
        assert!(cmd.shipped_plaintext);
    }

    #[test]
    fn rekey_command_refuses_plaintext_when_disallowed() {
        let keys = container_with_one_key();
        assert!(build_rekey_command(&keys, None, false).is_err());
    }
}
