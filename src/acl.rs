//! Read-mostly external-collaborator lookup tables: radio-ID ACL,
//! talkgroup-rule list, peer-ACL list, and the crypto key container (spec
//! §3). Loading/reloading these from disk is the YAML-ACL-reloader's job
//! (out of scope); this crate ships a TOML-backed loader for local use and
//! depends on the `PeerAcl` trait (`peer.rs`) plus these value types.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default)]
pub struct RidEntry {
    pub enabled: bool,
    pub static_ip: Option<Ipv4Addr>,
}

#[derive(Default)]
pub struct RidAcl {
    entries: HashMap<u32, RidEntry>,
    reject_unknown: bool,
}

impl RidAcl {
    pub fn new(reject_unknown: bool) -> Self {
        RidAcl { entries: HashMap::new(), reject_unknown }
    }

    pub fn insert(&mut self, rid: u32, entry: RidEntry) {
        self.entries.insert(rid, entry);
    }

    /// `None` means the RID is wholly unknown to the ACL.
    pub fn lookup(&self, rid: u32) -> Option<&RidEntry> {
        self.entries.get(&rid)
    }

    pub fn is_enabled(&self, rid: u32) -> bool {
        self.entries.get(&rid).map(|e| e.enabled).unwrap_or(false)
    }

    pub fn is_unknown(&self, rid: u32) -> bool {
        !self.entries.contains_key(&rid)
    }

    pub fn reject_unknown_enabled(&self) -> bool {
        self.reject_unknown
    }

    pub fn static_ip_for(&self, rid: u32) -> Option<Ipv4Addr> {
        self.entries.get(&rid).and_then(|e| e.static_ip)
    }

    /// Reverse lookup: the RID provisioned with `ip` as its static address,
    /// consulted by the PDU engine's ARP/SNDCP static-IP path (spec §4.7).
    pub fn rid_for_static_ip(&self, ip: Ipv4Addr) -> Option<u32> {
        self.entries.iter().find(|(_, e)| e.static_ip == Some(ip)).map(|(&rid, _)| rid)
    }
}

/// A single `(peerId -> tgId)` route-rewrite entry (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct RewriteEntry {
    pub peer_id: u32,
    pub tg_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TgRule {
    pub active: bool,
    pub parrot: bool,
    pub parrot_only_originating: bool,
    pub affiliation_required: bool,
    pub non_preferred: bool,
    pub permitted_rids: HashSet<u32>,
    pub inclusion: HashSet<u32>,
    pub exclusion: HashSet<u32>,
    pub always_send: HashSet<u32>,
    pub rewrite: Vec<RewriteEntry>,
}

impl TgRule {
    /// The canonical TGID rewrite target for a frame outbound to `peer_id`,
    /// if a rewrite entry names it.
    pub fn outbound_rewrite_for(&self, peer_id: u32) -> Option<u32> {
        self.rewrite.iter().find(|r| r.peer_id == peer_id).map(|r| r.tg_id)
    }

    /// The canonical source TGID for a frame inbound from `peer_id` whose
    /// destination was itself a rewritten TGID (spec §4.4, inverse direction).
    pub fn inbound_canonical_for(&self, peer_id: u32, canonical_tg_id: u32) -> Option<u32> {
        self.rewrite.iter().find(|r| r.peer_id == peer_id).map(|_| canonical_tg_id)
    }
}

#[derive(Default)]
pub struct TalkgroupRules {
    rules: HashMap<u32, TgRule>,
}

impl TalkgroupRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tg_id: u32, rule: TgRule) {
        self.rules.insert(tg_id, rule);
    }

    pub fn lookup(&self, tg_id: u32) -> Option<&TgRule> {
        self.rules.get(&tg_id)
    }

    pub fn is_invalid(&self, tg_id: u32) -> bool {
        !self.rules.contains_key(&tg_id)
    }
}

/// A symmetric TEK/KEK entry in the crypto key container, keyed by 16-bit
/// key ID (spec §4.8, §4.10). Reads are lock-free per spec §5; the writer
/// (config reloader) is an external collaborator.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub algo_id: u8,
    pub key: Vec<u8>,
    /// Unique KEK associated with a target RSI, if provisioned.
    pub ukek: Option<[u8; 32]>,
}

#[derive(Default)]
pub struct KeyContainer {
    keys: HashMap<u16, KeyEntry>,
}

impl KeyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: u16, entry: KeyEntry) {
        self.keys.insert(key_id, entry);
    }

    pub fn get(&self, key_id: u16) -> Option<&KeyEntry> {
        self.keys.get(&key_id)
    }

    pub fn all(&self) -> impl Iterator<Item = (&u16, &KeyEntry)> {
        self.keys.iter()
    }
}

/// `{peerId, ipv4, port}` HA-failover entries (supplemented feature,
/// SPEC_FULL §11), redistributed to peers alongside the other REPL_* payloads.
#[derive(Debug, Clone, Copy)]
pub struct HaParameterEntry {
    pub peer_id: u32,
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Default)]
pub struct HaParameters {
    entries: Vec<HaParameterEntry>,
}

impl HaParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, entries: Vec<HaParameterEntry>) {
        self.entries = entries;
    }

    pub fn entries(&self) -> &[HaParameterEntry] {
        &self.entries
    }
}

/// On-disk TOML shapes for the local loader. The YAML ACL reloader this
/// crate treats as an external collaborator would populate the same
/// `RidAcl`/`TalkgroupRules`/`KeyContainer` types from its own format; this
/// loader exists so the crate is independently testable/runnable without
/// that collaborator.
pub mod toml_loader {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct RidAclFile {
        #[serde(default)]
        reject_unknown: bool,
        #[serde(default)]
        radios: Vec<RidAclRow>,
    }

    #[derive(Deserialize)]
    struct RidAclRow {
        id: u32,
        enabled: bool,
        #[serde(default)]
        static_ip: Option<Ipv4Addr>,
    }

    pub fn load_rid_acl(path: &std::path::Path) -> anyhow::Result<RidAcl> {
        let raw = std::fs::read_to_string(path)?;
        let file: RidAclFile = toml::from_str(&raw)?;
        let mut acl = RidAcl::new(file.reject_unknown);
        for row in file.radios {
            acl.insert(row.id, RidEntry { enabled: row.enabled, static_ip: row.static_ip });
        }
        Ok(acl)
    }

    #[derive(Deserialize)]
    struct TgRuleFile {
        #[serde(default)]
        talkgroups: Vec<TgRuleRow>,
    }

    #[derive(Deserialize)]
    struct TgRuleRow {
        id: u32,
        #[serde(default)]
        active: bool,
        #[serde(default)]
        parrot: bool,
        #[serde(default)]
        parrot_only_originating: bool,
        #[serde(default)]
        affiliation_required: bool,
        #[serde(default)]
        non_preferred: bool,
        #[serde(default)]
        permitted_rids: HashSet<u32>,
        #[serde(default)]
        inclusion: HashSet<u32>,
        #[serde(default)]
        exclusion: HashSet<u32>,
        #[serde(default)]
        always_send: HashSet<u32>,
        #[serde(default)]
        rewrite: Vec<(u32, u32)>,
    }

    pub fn load_tg_rules(path: &std::path::Path) -> anyhow::Result<TalkgroupRules> {
        let raw = std::fs::read_to_string(path)?;
        let file: TgRuleFile = toml::from_str(&raw)?;
        let mut rules = TalkgroupRules::new();
        for row in file.talkgroups {
            rules.insert(
                row.id,
                TgRule {
                    active: row.active,
                    parrot: row.parrot,
                    parrot_only_originating: row.parrot_only_originating,
                    affiliation_required: row.affiliation_required,
                    non_preferred: row.non_preferred,
                    permitted_rids: row.permitted_rids,
                    inclusion: row.inclusion,
                    exclusion: row.exclusion,
                    always_send: row.always_send,
                    rewrite: row.rewrite.into_iter().map(|(peer_id, tg_id)| RewriteEntry { peer_id, tg_id }).collect(),
                },
            );
        }
        Ok(rules)
    }

    #[derive(Deserialize)]
    struct KeyContainerFile {
        #[serde(default)]
        keys: Vec<KeyRow>,
    }

    #[derive(Deserialize)]
    struct KeyRow {
        id: u16,
        algo_id: u8,
        key_hex: String,
        #[serde(default)]
        ukek_hex: Option<String>,
    }

    pub fn load_key_container(path: &std::path::Path) -> anyhow::Result<KeyContainer> {
        let raw = std::fs::read_to_string(path)?;
        let file: KeyContainerFile = toml::from_str(&raw)?;
        let mut keys = KeyContainer::new();
        for row in file.keys {
            let key = hex::decode(&row.key_hex)?;
            let ukek = match row.ukek_hex {
                Some(hex_str) => {
                    let bytes = hex::decode(&hex_str)?;
                    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| anyhow::anyhow!("ukek for key {} must be 32 bytes", row.id))?;
                    Some(arr)
                }
                None => None,
            };
            keys.insert(row.id, KeyEntry { algo_id: row.algo_id, key, ukek });
        }
        Ok(keys)
    }

    #[derive(Deserialize)]
    struct HaParametersFile {
        #[serde(default)]
        peers: Vec<HaParameterRow>,
    }

    #[derive(Deserialize)]
    struct HaParameterRow {
        peer_id: u32,
        ipv4: Ipv4Addr,
        port: u16,
    }

    pub fn load_ha_parameters(path: &std::path::Path) -> anyhow::Result<HaParameters> {
        let raw = std::fs::read_to_string(path)?;
        let file: HaParametersFile = toml::from_str(&raw)?;
        let mut ha = HaParameters::new();
        ha.set(file.peers.into_iter().map(|r| HaParameterEntry { peer_id: r.peer_id, ipv4: r.ipv4, port: r.port }).collect());
        Ok(ha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_acl_distinguishes_unknown_from_disabled() {
        let mut acl = RidAcl::new(true);
        acl.insert(1000, RidEntry { enabled: true, static_ip: None });
        acl.insert(2000, RidEntry { enabled: false, static_ip: None });
        assert!(acl.is_enabled(1000));
        assert!(!acl.is_enabled(2000));
        assert!(acl.is_unknown(3000));
        assert!(!acl.is_unknown(2000));
    }

    #[test]
    fn rewrite_lookup_finds_peer_specific_entry() {
        let rule = TgRule {
            rewrite: vec![RewriteEntry { peer_id: 7, tg_id: 12345 }],
            ..Default::default()
        };
        assert_eq!(rule.outbound_rewrite_for(7), Some(12345));
        assert_eq!(rule.outbound_rewrite_for(8), None);
    }
}
