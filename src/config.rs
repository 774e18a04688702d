//! FNE process configuration.
//!
//! Parsing itself (and the YAML ACL reloader it feeds) is an external
//! collaborator per the core's scope; this is the concrete shape the
//! core's constructors expect.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Soft cap checked first on RPTL; operator configurable.
pub const DEFAULT_SOFT_CONN_LIMIT: u32 = 200;
/// Hard cap the soft cap may never exceed.
pub const HARD_CONN_LIMIT: u32 = 250;

#[derive(Parser, Debug, Clone)]
#[command(name = "dvm-fne", about = "Converged FNE for P25/DMR/NXDN trunking")]
pub struct FneConfig {
    /// Traffic UDP socket bind address.
    #[arg(long, env = "FNE_TRAFFIC_ADDR", default_value = "0.0.0.0:62031")]
    pub traffic_addr: SocketAddr,

    /// OTAR UDP socket bind address.
    #[arg(long, env = "FNE_OTAR_ADDR", default_value = "0.0.0.0:62032")]
    pub otar_addr: SocketAddr,

    /// This FNE's own peer ID.
    #[arg(long, env = "FNE_PEER_ID")]
    pub peer_id: u32,

    /// Global repeater password used unless a peer-ACL override applies.
    #[arg(long, env = "FNE_PASSWORD")]
    pub password: String,

    /// Soft peer-count cap (must be <= the 250 hard cap).
    #[arg(long, default_value_t = DEFAULT_SOFT_CONN_LIMIT)]
    pub soft_conn_limit: u32,

    /// Packet-handler worker pool size.
    #[arg(long, default_value_t = 4)]
    pub worker_threads: usize,

    /// OTAR worker pool size (fixed at 4 per the concurrency model, overridable for tests).
    #[arg(long, default_value_t = 4)]
    pub otar_worker_threads: usize,

    /// Path to the radio-ID ACL file (TOML; reload is out of scope).
    #[arg(long)]
    pub rid_acl_file: Option<PathBuf>,

    /// Path to the talkgroup-rule file (TOML; reload is out of scope).
    #[arg(long)]
    pub tg_rule_file: Option<PathBuf>,

    /// Path to the peer-ACL file (TOML; reload is out of scope).
    #[arg(long)]
    pub peer_acl_file: Option<PathBuf>,

    /// Path to the crypto key container file (TOML; reload is out of scope).
    #[arg(long)]
    pub key_container_file: Option<PathBuf>,

    /// Path to the HA-parameter replication file (TOML; supplemented feature, SPEC_FULL §11).
    #[arg(long)]
    pub ha_params_file: Option<PathBuf>,

    /// This FNE's own TUN IPv4 address, used for ARP self-resolution (spec §4.7).
    #[arg(long, default_value = "10.10.1.1")]
    pub tun_addr: std::net::Ipv4Addr,

    /// Seconds between ACL/metadata redistribution cycles (spec §4.2 `updateLookupTime`).
    #[arg(long, default_value_t = 60)]
    pub update_lookup_time_secs: u64,

    /// Milliseconds between orchestration-clock ticks driving keep-alive
    /// scans, ACL redistribution, HA heartbeats and parrot playback (spec §2, §5).
    #[arg(long, default_value_t = 250)]
    pub clock_interval_ms: u64,

    /// Disallow unit-to-unit (private) calls entirely (spec §4.5).
    #[arg(long, default_value_t = false)]
    pub disallow_u2u: bool,

    /// Restrict private calls to the destination RID's registered peer only (spec §4.5).
    #[arg(long, default_value_t = false)]
    pub restrict_pv_call_to_reg_only: bool,

    /// Enable in-call control preemption/rejection (spec §4.6).
    #[arg(long, default_value_t = true)]
    pub in_call_control_enabled: bool,

    /// Emit structured debug events for every raw packet before dispatch
    /// (named after `FNENetwork.h`'s `m_dumpPacketData`; SPEC_FULL §10).
    #[arg(long, default_value_t = false)]
    pub dump_packet_data: bool,

    /// Ping interval, milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub ping_time_ms: u64,

    /// Missed-ping budget before disconnect (doubled for neighbour-FNE/replica peers).
    #[arg(long, default_value_t = 3)]
    pub max_missed_pings: u32,

    /// Seconds since last packet before a stalled call releases its slot.
    #[arg(long, default_value_t = 2)]
    pub call_collision_timeout_secs: u64,

    /// Cycles of metadata update a non-replica peer may skip during an active stream.
    #[arg(long, default_value_t = 3)]
    pub max_missed_acl_updates: u32,

    /// Mask outbound SSRC/peerId with this FNE's own peer ID (spec §4.1).
    #[arg(long, default_value_t = true)]
    pub mask_outbound_peer_id: bool,

    /// Additionally mask for peers without packet-level visibility (supplemented flag).
    #[arg(long, default_value_t = false)]
    pub mask_outbound_peer_id_for_non_pl: bool,

    /// Reject frames whose source RID is wholly unknown to the RID ACL.
    #[arg(long, default_value_t = false)]
    pub reject_unknown_rid: bool,

    /// Dynamic SNDCP pool start address.
    #[arg(long, default_value = "10.10.1.1")]
    pub sndcp_start_addr: std::net::Ipv4Addr,

    /// Dynamic SNDCP pool end address.
    #[arg(long, default_value = "10.10.1.254")]
    pub sndcp_end_addr: std::net::Ipv4Addr,

    /// Emit structured debug events for every PDU block (supplemented flag).
    #[arg(long, default_value_t = false)]
    pub verbose_packet_data: bool,

    /// Disable the P25 PDU engine entirely.
    #[arg(long, default_value_t = false)]
    pub disable_packet_data: bool,

    /// Allow Rekey-Command to ship plaintext TEKs when no UKEK is configured.
    #[arg(long, default_value_t = false)]
    pub allow_no_ukek_rekey: bool,

    /// Overlay config from a TOML file, applied before flag/env parsing wins.
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

impl FneConfig {
    /// Merge a TOML overlay loaded from `config_file`, if any, leaving explicitly
    /// provided CLI/env values untouched. Resolved once in `main`, same as
    /// any other startup file the binary reads before serving.
    pub fn load_overlay(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.config_file.clone() else {
            return Ok(());
        };
        let raw = std::fs::read_to_string(&path)?;
        let overlay: ConfigOverlay = toml::from_str(&raw)?;
        if let Some(v) = overlay.password {
            self.password = v;
        }
        if let Some(v) = overlay.soft_conn_limit {
            self.soft_conn_limit = v;
        }
        Ok(())
    }
}

#[derive(serde::Deserialize, Default)]
struct ConfigOverlay {
    password: Option<String>,
    soft_conn_limit: Option<u32>,
}
