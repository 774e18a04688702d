//! Per-peer affiliation table: group affiliations and unit registrations
//! (spec §3). Unit-registration timeout is disabled on the FNE — entries
//! leave only via explicit deregistration or peer removal.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PeerAffiliations {
    /// source RID -> TGID
    pub group_affiliations: HashMap<u32, u32>,
    /// RID -> SSRC
    pub unit_registrations: HashMap<u32, u32>,
}

/// Process-wide affiliation table, keyed by peer ID. Per the data-model
/// invariant, an entry must exist here for every key present in the peer
/// table until `erase_peer` removes both.
#[derive(Default)]
pub struct AffiliationTable {
    inner: parking_lot::Mutex<HashMap<u32, PeerAffiliations>>,
}

impl AffiliationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the (initially empty) affiliation entry for a newly logged-in peer.
    pub fn create_peer(&self, peer_id: u32) {
        self.inner.lock().entry(peer_id).or_default();
    }

    /// Remove the peer's affiliation entry, enforcing the 1:1 invariant
    /// with the peer table.
    pub fn erase_peer(&self, peer_id: u32) {
        self.inner.lock().remove(&peer_id);
    }

    pub fn affiliate_group(&self, peer_id: u32, src_rid: u32, tgid: u32) {
        let mut table = self.inner.lock();
        table.entry(peer_id).or_default().group_affiliations.insert(src_rid, tgid);
    }

    pub fn unaffiliate_group(&self, peer_id: u32, src_rid: u32) {
        if let Some(entry) = self.inner.lock().get_mut(&peer_id) {
            entry.group_affiliations.remove(&src_rid);
        }
    }

    pub fn register_unit(&self, peer_id: u32, rid: u32, ssrc: u32) {
        let mut table = self.inner.lock();
        table.entry(peer_id).or_default().unit_registrations.insert(rid, ssrc);
    }

    pub fn deregister_unit(&self, peer_id: u32, rid: u32) {
        if let Some(entry) = self.inner.lock().get_mut(&peer_id) {
            entry.unit_registrations.remove(&rid);
        }
    }

    /// Does `peer_id`'s affiliation set carry `tgid`? Used by the
    /// group-call peer-permit check (spec §4.5).
    pub fn has_group_affiliation(&self, peer_id: u32, tgid: u32) -> bool {
        self.inner.lock().get(&peer_id).map(|e| e.group_affiliations.values().any(|&t| t == tgid)).unwrap_or(false)
    }

    /// Find the peer ID holding a unit-registration for `rid`, used to
    /// derive the destination peer ID for P25 private calls (spec §3, §4.5).
    pub fn peer_for_unit_registration(&self, rid: u32) -> Option<u32> {
        let table = self.inner.lock();
        table.iter().find(|(_, v)| v.unit_registrations.contains_key(&rid)).map(|(k, _)| *k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_lifecycle_keeps_table_in_sync() {
        let table = AffiliationTable::new();
        table.create_peer(1);
        table.affiliate_group(1, 1001, 9000);
        assert!(table.has_group_affiliation(1, 9000));
        table.erase_peer(1);
        assert!(!table.has_group_affiliation(1, 9000));
    }

    #[test]
    fn unit_registration_has_no_timeout_and_survives_lookups() {
        let table = AffiliationTable::new();
        table.create_peer(2);
        table.register_unit(2, 5555, 0xAAAA);
        assert_eq!(table.peer_for_unit_registration(5555), Some(2));
        table.deregister_unit(2, 5555);
        assert_eq!(table.peer_for_unit_registration(5555), None);
    }
}
