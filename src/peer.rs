//! Peer session engine: the login/auth/config handshake, connection state
//! machine, keep-alives and the peer table itself (spec §3, §4.2).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::{FneConfig, HARD_CONN_LIMIT};
use crate::frame::{NakReason, OutboundSeq};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Invalid,
    WaitingLogin,
    WaitingAuth,
    WaitingConfig,
    Running,
}

#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub height: i32,
    pub location: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub tx_power: u32,
    pub tx_offset_mhz: f32,
    pub ch_bandwidth_khz: f32,
    pub channel_id: u8,
    pub channel_no: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RconConfig {
    pub password: String,
    pub port: u16,
}

/// Parsed `RPTC` configuration payload.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub identity: String,
    pub rx_frequency: u32,
    pub tx_frequency: u32,
    pub info: PeerInfo,
    pub channel: ChannelConfig,
    pub rcon: RconConfig,
    pub software: String,
    pub sys_view: bool,
    pub external_peer: bool,
    pub conventional_peer: bool,
    pub master_peer_id: Option<u32>,
}

impl PeerConfig {
    /// Parse the JSON `RPTC` body (spec §4.2). Unknown fields are ignored;
    /// a structurally invalid document is the only parse failure.
    pub fn from_json(body: &[u8]) -> anyhow::Result<Self> {
        let v: serde_json::Value = serde_json::from_slice(body)?;
        let obj = v.as_object().ok_or_else(|| anyhow::anyhow!("RPTC body is not a JSON object"))?;
        let get_str = |k: &str| obj.get(k).and_then(|x| x.as_str()).unwrap_or_default().to_string();
        let get_u32 = |k: &str| obj.get(k).and_then(|x| x.as_u64()).unwrap_or(0) as u32;
        let info_obj = obj.get("info").and_then(|x| x.as_object());
        let channel_obj = obj.get("channel").and_then(|x| x.as_object());
        let rcon_obj = obj.get("rcon").and_then(|x| x.as_object());

        Ok(PeerConfig {
            identity: get_str("identity"),
            rx_frequency: get_u32("rxFrequency"),
            tx_frequency: get_u32("txFrequency"),
            info: PeerInfo {
                latitude: info_obj.and_then(|o| o.get("latitude")).and_then(|x| x.as_f64()).unwrap_or(0.0),
                longitude: info_obj.and_then(|o| o.get("longitude")).and_then(|x| x.as_f64()).unwrap_or(0.0),
                height: info_obj.and_then(|o| o.get("height")).and_then(|x| x.as_i64()).unwrap_or(0) as i32,
                location: info_obj.and_then(|o| o.get("location")).and_then(|x| x.as_str()).unwrap_or_default().to_string(),
            },
            channel: ChannelConfig {
                tx_power: channel_obj.and_then(|o| o.get("txPower")).and_then(|x| x.as_u64()).unwrap_or(0) as u32,
                tx_offset_mhz: channel_obj.and_then(|o| o.get("txOffsetMhz")).and_then(|x| x.as_f64()).unwrap_or(0.0) as f32,
                ch_bandwidth_khz: channel_obj.and_then(|o| o.get("chBandwidthKhz")).and_then(|x| x.as_f64()).unwrap_or(0.0) as f32,
                channel_id: channel_obj.and_then(|o| o.get("channelId")).and_then(|x| x.as_u64()).unwrap_or(0) as u8,
                channel_no: channel_obj.and_then(|o| o.get("channelNo")).and_then(|x| x.as_u64()).unwrap_or(0) as u32,
            },
            rcon: RconConfig {
                password: rcon_obj.and_then(|o| o.get("password")).and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                port: rcon_obj.and_then(|o| o.get("port")).and_then(|x| x.as_u64()).unwrap_or(0) as u16,
            },
            software: get_str("software"),
            sys_view: obj.get("sysView").and_then(|x| x.as_bool()).unwrap_or(false),
            external_peer: obj.get("externalPeer").and_then(|x| x.as_bool()).unwrap_or(false),
            conventional_peer: obj.get("conventionalPeer").and_then(|x| x.as_bool()).unwrap_or(false),
            master_peer_id: obj.get("masterPeerId").and_then(|x| x.as_u64()).map(|v| v as u32),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JitterBufferParams {
    pub depth_ms: u32,
    pub max_depth_ms: u32,
}

/// A connected (or connecting) peer (spec §3 "Peer connection").
pub struct PeerConnection {
    pub peer_id: u32,
    pub addr: SocketAddr,
    pub salt: u32,
    pub state: ConnectionState,
    pub config: Option<PeerConfig>,
    /// Wall-clock login time, carried for admin-facing connection listings;
    /// all timeout/collision arithmetic uses [`Instant`] instead.
    pub connected_at: DateTime<Utc>,
    pub last_ping: Instant,
    pub pings_received: u32,
    pub missed_metadata_updates: u32,
    pub control_channel_peer_id: Option<u32>,
    pub stream_seq: HashMap<u32, u16>,
    pub replica: bool,
    pub has_call_priority: bool,
    pub jitter: JitterBufferParams,
    pub jitter_by_stream: HashMap<u32, JitterBufferParams>,
    pub outbound_seq: HashMap<(u8, u32), OutboundSeq>,
}

impl PeerConnection {
    fn new(peer_id: u32, addr: SocketAddr, salt: u32) -> Self {
        PeerConnection {
            peer_id,
            addr,
            salt,
            state: ConnectionState::WaitingLogin,
            config: None,
            connected_at: Utc::now(),
            last_ping: Instant::now(),
            pings_received: 0,
            missed_metadata_updates: 0,
            control_channel_peer_id: None,
            stream_seq: HashMap::new(),
            replica: false,
            has_call_priority: false,
            jitter: JitterBufferParams::default(),
            jitter_by_stream: HashMap::new(),
            outbound_seq: HashMap::new(),
        }
    }

    /// True when `connectionState == RUNNING`, the only state in which the
    /// peer counts as "connected" per the data-model invariant.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Running
    }

    fn is_neighbour_fne(&self) -> bool {
        self.config.as_ref().map(|c| c.external_peer).unwrap_or(false)
    }

    /// Ping timeout budget in milliseconds, doubled for neighbour-FNE/replica peers.
    pub fn ping_timeout_ms(&self, ping_time_ms: u64, max_missed: u32) -> u64 {
        let base = ping_time_ms * max_missed as u64;
        if self.is_neighbour_fne() || self.replica { base * 2 } else { base }
    }
}

/// A capability allowing a caller to look up a global or per-peer password
/// override (spec's peer-ACL), and whether a peer ID is ACL-permitted at
/// all. Config-file parsing/reloading of the backing store is an external
/// collaborator; this is the seam the core depends on.
pub trait PeerAcl: Send + Sync {
    fn is_permitted(&self, peer_id: u32) -> bool;
    fn password_override(&self, peer_id: u32) -> Option<String>;
    fn can_request_keys(&self, peer_id: u32) -> bool;
    fn can_issue_inhibit(&self, peer_id: u32) -> bool;
    fn is_replica_participant(&self, peer_id: u32) -> bool;
}

/// A single peer-ACL entry (spec §3 "peer-ACL list").
#[derive(Debug, Clone, Default)]
pub struct PeerAclEntry {
    pub password: Option<String>,
    pub can_request_keys: bool,
    pub can_issue_inhibit: bool,
    pub replica_participant: bool,
}

/// TOML-backed `PeerAcl`. Reload is an external collaborator per spec §1;
/// this loader is for local/test use (spec SPEC_FULL §10).
pub struct TomlPeerAcl {
    entries: HashMap<u32, PeerAclEntry>,
    open_by_default: bool,
}

impl TomlPeerAcl {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        #[derive(serde::Deserialize)]
        struct PeerAclFile {
            #[serde(default = "default_true")]
            open_by_default: bool,
            #[serde(default)]
            peers: Vec<PeerAclRow>,
        }
        fn default_true() -> bool {
            true
        }
        #[derive(serde::Deserialize)]
        struct PeerAclRow {
            id: u32,
            #[serde(default)]
            password: Option<String>,
            #[serde(default)]
            can_request_keys: bool,
            #[serde(default)]
            can_issue_inhibit: bool,
            #[serde(default)]
            replica_participant: bool,
        }
        let raw = std::fs::read_to_string(path)?;
        let file: PeerAclFile = toml::from_str(&raw)?;
        let mut entries = HashMap::new();
        for row in file.peers {
            entries.insert(
                row.id,
                PeerAclEntry {
                    password: row.password,
                    can_request_keys: row.can_request_keys,
                    can_issue_inhibit: row.can_issue_inhibit,
                    replica_participant: row.replica_participant,
                },
            );
        }
        Ok(TomlPeerAcl { entries, open_by_default: file.open_by_default })
    }
}

impl PeerAcl for TomlPeerAcl {
    fn is_permitted(&self, peer_id: u32) -> bool {
        self.entries.contains_key(&peer_id) || self.open_by_default
    }
    fn password_override(&self, peer_id: u32) -> Option<String> {
        self.entries.get(&peer_id).and_then(|e| e.password.clone())
    }
    fn can_request_keys(&self, peer_id: u32) -> bool {
        self.entries.get(&peer_id).map(|e| e.can_request_keys).unwrap_or(false)
    }
    fn can_issue_inhibit(&self, peer_id: u32) -> bool {
        self.entries.get(&peer_id).map(|e| e.can_issue_inhibit).unwrap_or(false)
    }
    fn is_replica_participant(&self, peer_id: u32) -> bool {
        self.entries.get(&peer_id).map(|e| e.replica_participant).unwrap_or(false)
    }
}

/// Default permissive ACL used when no peer-ACL file is configured.
pub struct OpenPeerAcl;

impl PeerAcl for OpenPeerAcl {
    fn is_permitted(&self, _peer_id: u32) -> bool {
        true
    }
    fn password_override(&self, _peer_id: u32) -> Option<String> {
        None
    }
    fn can_request_keys(&self, _peer_id: u32) -> bool {
        false
    }
    fn can_issue_inhibit(&self, _peer_id: u32) -> bool {
        false
    }
    fn is_replica_participant(&self, _peer_id: u32) -> bool {
        false
    }
}

pub enum LoginOutcome {
    /// ACK with the freshly drawn 4-byte salt.
    Ack { salt: [u8; 4] },
    Nak(NakReason),
}

pub enum AuthOutcome {
    Ack,
    Nak(NakReason),
}

pub enum ConfigOutcome {
    /// ACK carrying the one-byte diagnostic-port flag.
    Ack { diagnostic_port: bool },
    Nak(NakReason),
}

/// The process-wide peer table. Guarded by a single mutex; per spec §5 this
/// is a short-critical-section structure (lookup by key is O(1), iteration
/// for fan-out holds the lock only long enough to snapshot).
pub struct PeerTable {
    peers: parking_lot::Mutex<HashMap<u32, PeerConnection>>,
    soft_cap: u32,
}

impl PeerTable {
    pub fn new(soft_cap: u32) -> Self {
        PeerTable { peers: parking_lot::Mutex::new(HashMap::new()), soft_cap: soft_cap.min(HARD_CONN_LIMIT) }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, peer_id: u32) -> bool {
        self.peers.lock().contains_key(&peer_id)
    }

    pub fn state_of(&self, peer_id: u32) -> Option<ConnectionState> {
        self.peers.lock().get(&peer_id).map(|p| p.state)
    }

    /// Handle an inbound `RPTL` (login). See spec §4.2.
    pub fn handle_login(&self, peer_id: u32, addr: SocketAddr, acl: &dyn PeerAcl) -> LoginOutcome {
        if !acl.is_permitted(peer_id) {
            return LoginOutcome::Nak(NakReason::PeerAcl);
        }
        let mut peers = self.peers.lock();
        if let Some(existing) = peers.get(&peer_id) {
            if existing.is_connected() {
                // "reset peer": tear down and begin afresh.
                peers.remove(&peer_id);
            }
        }
        if !peers.contains_key(&peer_id) && peers.len() as u32 >= self.soft_cap {
            return LoginOutcome::Nak(NakReason::FneMaxConn);
        }
        let salt = rand::thread_rng().next_u32();
        let mut conn = PeerConnection::new(peer_id, addr, salt);
        conn.state = ConnectionState::WaitingAuth;
        peers.insert(peer_id, conn);
        LoginOutcome::Ack { salt: salt.to_be_bytes() }
    }

    /// Handle an inbound `RPTK` (auth). `password` is looked up from the
    /// peer-ACL override or the global password.
    pub fn handle_auth(&self, peer_id: u32, addr: SocketAddr, digest: &[u8], acl: &dyn PeerAcl, global_password: &str) -> AuthOutcome {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&peer_id) else {
            return AuthOutcome::Nak(NakReason::BadConnState);
        };
        if peer.state != ConnectionState::WaitingLogin && peer.state != ConnectionState::WaitingAuth {
            return AuthOutcome::Nak(NakReason::BadConnState);
        }
        if peer.addr != addr {
            return AuthOutcome::Nak(NakReason::FneUnauthorized);
        }
        let password = acl.password_override(peer_id).unwrap_or_else(|| global_password.to_string());
        let mut hasher = Sha256::new();
        hasher.update(peer.salt.to_be_bytes());
        hasher.update(password.as_bytes());
        let expected = hasher.finalize();
        if expected.as_slice() == digest {
            peer.state = ConnectionState::WaitingConfig;
            AuthOutcome::Ack
        } else {
            peers.remove(&peer_id);
            AuthOutcome::Nak(NakReason::FneUnauthorized)
        }
    }

    /// Handle an inbound `RPTC` (config). Returns the parsed config for the
    /// caller to hand to the spanning-tree duplicate check (externalPeer).
    pub fn handle_config(&self, peer_id: u32, addr: SocketAddr, body: &[u8], diagnostic_port_enabled: bool) -> (ConfigOutcome, Option<PeerConfig>) {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&peer_id) else {
            return (ConfigOutcome::Nak(NakReason::BadConnState), None);
        };
        if peer.state != ConnectionState::WaitingConfig {
            return (ConfigOutcome::Nak(NakReason::BadConnState), None);
        }
        if peer.addr != addr {
            return (ConfigOutcome::Nak(NakReason::FneUnauthorized), None);
        }
        match PeerConfig::from_json(body) {
            Ok(cfg) => {
                peer.state = ConnectionState::Running;
                peer.config = Some(cfg.clone());
                (ConfigOutcome::Ack { diagnostic_port: diagnostic_port_enabled }, Some(cfg))
            }
            Err(_) => (ConfigOutcome::Nak(NakReason::InvalidConfigData), None),
        }
    }

    /// Handle an inbound `PING`: refresh `lastPing`, bump the counter.
    pub fn handle_ping(&self, peer_id: u32) -> bool {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&peer_id) else { return false };
        peer.last_ping = Instant::now();
        peer.pings_received += 1;
        true
    }

    /// Sweep for peers whose missed-ping budget has expired; returns the
    /// peer IDs to disconnect.
    pub fn sweep_timeouts(&self, config: &FneConfig) -> Vec<u32> {
        let now = Instant::now();
        let peers = self.peers.lock();
        peers
            .values()
            .filter(|p| p.is_connected())
            .filter(|p| {
                let budget_ms = p.ping_timeout_ms(config.ping_time_ms, config.max_missed_pings);
                now.duration_since(p.last_ping).as_millis() as u64 > budget_ms
            })
            .map(|p| p.peer_id)
            .collect()
    }

    pub fn remove(&self, peer_id: u32) -> Option<PeerConnection> {
        self.peers.lock().remove(&peer_id)
    }

    /// Snapshot of `(peer_id, addr, replica)` for fan-out iteration. Cloning
    /// addresses keeps the critical section short (spec §5).
    pub fn snapshot_running(&self) -> Vec<(u32, SocketAddr, bool, DateTime<Utc>)> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.is_connected())
            .map(|p| (p.peer_id, p.addr, p.replica, p.connected_at))
            .collect()
    }

    pub fn with_peer_mut<R>(&self, peer_id: u32, f: impl FnOnce(&mut PeerConnection) -> R) -> Option<R> {
        self.peers.lock().get_mut(&peer_id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn login_auth_config_ping_happy_path() {
        let table = PeerTable::new(10);
        let acl = OpenPeerAcl;
        let salt = match table.handle_login(1, addr(), &acl) {
            LoginOutcome::Ack { salt } => salt,
            LoginOutcome::Nak(_) => panic!("expected ack"),
        };
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(b"dvm123");
        let digest = hasher.finalize();
        match table.handle_auth(1, addr(), &digest, &acl, "dvm123") {
            AuthOutcome::Ack => {}
            AuthOutcome::Nak(_) => panic!("expected ack"),
        }
        let body = br#"{"identity":"UNIT-1","rxFrequency":851000000}"#;
        let (outcome, cfg) = table.handle_config(1, addr(), body, false);
        match outcome {
            ConfigOutcome::Ack { .. } => {}
            ConfigOutcome::Nak(_) => panic!("expected ack"),
        }
        assert_eq!(cfg.unwrap().identity, "UNIT-1");
        assert_eq!(table.state_of(1), Some(ConnectionState::Running));
        assert!(table.handle_ping(1));
        assert_eq!(table.with_peer_mut(1, |p| p.pings_received), Some(1));
    }

    #[test]
    fn wrong_state_is_nakd() {
        let table = PeerTable::new(10);
        let acl = OpenPeerAcl;
        table.handle_login(2, addr(), &acl);
        let body = br#"{"identity":"X"}"#;
        let (outcome, _) = table.handle_config(2, addr(), body, false);
        assert!(matches!(outcome, ConfigOutcome::Nak(NakReason::BadConnState)));
    }

    #[test]
    fn auth_mismatch_removes_peer() {
        let table = PeerTable::new(10);
        let acl = OpenPeerAcl;
        table.handle_login(3, addr(), &acl);
        let bad_digest = [0u8; 32];
        let outcome = table.handle_auth(3, addr(), &bad_digest, &acl, "dvm123");
        assert!(matches!(outcome, AuthOutcome::Nak(NakReason::FneUnauthorized)));
        assert!(!table.contains(3));
    }

    #[test]
    fn soft_cap_rejects_new_logins() {
        let table = PeerTable::new(1);
        let acl = OpenPeerAcl;
        assert!(matches!(table.handle_login(1, addr(), &acl), LoginOutcome::Ack { .. }));
        assert!(matches!(table.handle_login(2, addr(), &acl), LoginOutcome::Nak(NakReason::FneMaxConn)));
    }
}
