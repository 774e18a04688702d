//! FNE orchestrator: binds the traffic and OTAR UDP sockets, drives the
//! packet-handler worker pools and the orchestration clock, and wires
//! together the peer, router, call-handler, OTAR and spanning-tree engines
//! (spec §2, §5, §6).

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::acl::{self, HaParameters, KeyContainer, RidAcl, TalkgroupRules};
use crate::affiliation::AffiliationTable;
use crate::callhandler::packetdata::p25 as pd_p25;
use crate::callhandler::packetdata::{
    ArpTable, ArqVerdict, ConvDataRegTable, PduAssembler, PduFormat, PduHeader, QueuedEgress, Sap, SndcpPool, advance_send_seq, check_and_advance, pdu_crc32, pdu_crc32_valid,
};
use crate::callhandler::{self, ParrotRecorder};
use crate::config::{FneConfig, HARD_CONN_LIMIT};
use crate::crypto::p25_voice::{MI_LENGTH_BYTES, P25Crypto};
use crate::frame::{AnnounceSub, Frame, FneHeader, Function, NakReason, NetTreeSub, ProtocolSub, ReplSub, RtpHeader};
use crate::otar::{self, KmmMessage, KmmMessageId, KmmOutcome, PendingKeyRequests};
use crate::packet_buffer;
use crate::peer::{AuthOutcome, ConfigOutcome, ConnectionState, LoginOutcome, OpenPeerAcl, PeerAcl, PeerTable, TomlPeerAcl};
use crate::router::{self, CallKey, CallStatusTable, FanOutBatcher, PermitContext, Protocol, ValidationContext};
use crate::spanning_tree::{LoginAdmission, SpanningTree, TreeNodeJson};
use crate::tun::{self, NullTunDevice, TunDevice};

/// Sentinel LLID standing in for "the FNE itself" in ARP replies (spec §4.7
/// "ARP"; no real unit holds this address).
const FNE_WUID_LLID: u32 = 0x00FF_FFFF;

/// Every long-lived table the packet-handler and OTAR worker pools share,
/// plus the orchestration clock (spec §3, §5 "Shared-resource policy").
/// ACL/key-container/HA-parameter reload is an external collaborator, so
/// those tables are populated once at startup and read without a lock.
pub struct FneState {
    pub config: FneConfig,
    pub peers: PeerTable,
    pub peer_acl: Box<dyn PeerAcl>,
    pub rid_acl: RidAcl,
    pub tg_rules: TalkgroupRules,
    pub keys: KeyContainer,
    pub ha_params: parking_lot::Mutex<HaParameters>,
    pub affiliations: AffiliationTable,
    pub calls: CallStatusTable,
    pub parrot: ParrotRecorder,
    pub tree: SpanningTree,
    pub pending_key_requests: PendingKeyRequests,
    pub arp: ArpTable,
    pub conv_data_reg: ConvDataRegTable,
    pub sndcp_pool: SndcpPool,
    pub pdu_assemblers: parking_lot::Mutex<HashMap<(u32, u32), PduAssembler>>,
    pub repl_reassembly: parking_lot::Mutex<HashMap<(u32, u8), packet_buffer::Reassembler>>,
    /// Platform TUN device (spec §4.7 "Egress path for PDUs"); an external
    /// collaborator, wired as [`NullTunDevice`] unless the binary supplies one.
    pub tun: Box<dyn TunDevice>,
    /// V(R) receive window per `(peer_id, llid)`.
    pub pdu_recv_seq: parking_lot::Mutex<HashMap<(u32, u32), u8>>,
    /// V(S) send counter and pending-synchronize flag per LLID, for PDUs
    /// this FNE originates on the egress path.
    pub pdu_send_seq: parking_lot::Mutex<HashMap<u32, (u8, bool)>>,
    /// Per-LLID "ready for next packet" gate (spec §4.7 "Egress path").
    pub pdu_ready: parking_lot::Mutex<HashMap<u32, bool>>,
    /// PDUs awaiting ARP resolution or subscriber readiness.
    pub pdu_egress_queue: parking_lot::Mutex<VecDeque<QueuedEgress>>,
}

pub struct Server {
    config: FneConfig,
    tun_override: Option<Box<dyn TunDevice>>,
}

impl Server {
    pub fn new(config: FneConfig) -> Self {
        Server { config, tun_override: None }
    }

    /// Inject a concrete TUN device; defaults to [`NullTunDevice`] if never
    /// called. The platform TUN is an external collaborator (spec §6), so
    /// the binary wires a real one in `main` while tests can wire in a
    /// fake to exercise the egress path without a real network device.
    pub fn with_tun_device(mut self, tun: Box<dyn TunDevice>) -> Self {
        self.tun_override = Some(tun);
        self
    }

    /// Load the configured ACL/key-container/peer-ACL/HA-parameter files (or
    /// fall back to empty/open defaults) and assemble the shared state.
    fn build_state(&mut self) -> anyhow::Result<Arc<FneState>> {
        let rid_acl = match &self.config.rid_acl_file {
            Some(path) => acl::toml_loader::load_rid_acl(path)?,
            None => RidAcl::new(self.config.reject_unknown_rid),
        };
        let tg_rules = match &self.config.tg_rule_file {
            Some(path) => acl::toml_loader::load_tg_rules(path)?,
            None => TalkgroupRules::new(),
        };
        let keys = match &self.config.key_container_file {
            Some(path) => acl::toml_loader::load_key_container(path)?,
            None => KeyContainer::new(),
        };
        let ha_params = match &self.config.ha_params_file {
            Some(path) => acl::toml_loader::load_ha_parameters(path)?,
            None => HaParameters::new(),
        };
        let peer_acl: Box<dyn PeerAcl> = match &self.config.peer_acl_file {
            Some(path) => Box::new(TomlPeerAcl::load(path)?),
            None => Box::new(OpenPeerAcl),
        };

        info!(soft_cap = self.config.soft_conn_limit, peer_id = self.config.peer_id, "FNE state constructed");

        Ok(Arc::new(FneState {
            peers: PeerTable::new(self.config.soft_conn_limit),
            peer_acl,
            rid_acl,
            tg_rules,
            keys,
            ha_params: parking_lot::Mutex::new(ha_params),
            affiliations: AffiliationTable::new(),
            calls: CallStatusTable::new(Duration::from_secs(self.config.call_collision_timeout_secs)),
            parrot: ParrotRecorder::new(),
            tree: SpanningTree::new(self.config.peer_id),
            pending_key_requests: PendingKeyRequests::new(),
            arp: ArpTable::new(),
            conv_data_reg: ConvDataRegTable::new(),
            sndcp_pool: SndcpPool::new(self.config.sndcp_start_addr, self.config.sndcp_end_addr),
            pdu_assemblers: parking_lot::Mutex::new(HashMap::new()),
            repl_reassembly: parking_lot::Mutex::new(HashMap::new()),
            tun: self.tun_override.take().unwrap_or_else(|| Box::new(NullTunDevice)),
            pdu_recv_seq: parking_lot::Mutex::new(HashMap::new()),
            pdu_send_seq: parking_lot::Mutex::new(HashMap::new()),
            pdu_ready: parking_lot::Mutex::new(HashMap::new()),
            pdu_egress_queue: parking_lot::Mutex::new(VecDeque::new()),
            config: self.config.clone(),
        }))
    }

    /// Bind the traffic and OTAR sockets and assemble shared state without
    /// spawning the worker pools yet. Split out from [`Server::run`] so
    /// integration tests can bind to an ephemeral port (`127.0.0.1:0`),
    /// read back the real bound address, and drive the engine with real
    /// UDP datagrams instead of calling internal handlers directly.
    pub async fn bind(&mut self) -> anyhow::Result<(Arc<FneState>, Arc<UdpSocket>, Arc<UdpSocket>)> {
        if self.config.soft_conn_limit > HARD_CONN_LIMIT {
            anyhow::bail!("soft_conn_limit {} exceeds the hard cap {}", self.config.soft_conn_limit, HARD_CONN_LIMIT);
        }
        let state = self.build_state()?;
        let traffic_socket = Arc::new(UdpSocket::bind(self.config.traffic_addr).await?);
        info!(addr = %traffic_socket.local_addr()?, "traffic socket bound");
        let otar_socket = Arc::new(UdpSocket::bind(self.config.otar_addr).await?);
        info!(addr = %otar_socket.local_addr()?, "OTAR socket bound");
        Ok((state, traffic_socket, otar_socket))
    }

    /// Spawn the packet-handler worker pools and the orchestration clock
    /// against already-bound sockets (spec §5 "Scheduling model").
    pub fn spawn_workers(&self, state: Arc<FneState>, traffic_socket: Arc<UdpSocket>, otar_socket: Arc<UdpSocket>) {
        for worker_id in 0..self.config.worker_threads.max(1) {
            let socket = traffic_socket.clone();
            let state = state.clone();
            tokio::spawn(async move { traffic_worker(socket, state, worker_id).await });
        }

        for worker_id in 0..self.config.otar_worker_threads.max(1) {
            let socket = otar_socket.clone();
            let state = state.clone();
            tokio::spawn(async move { otar_worker(socket, state, worker_id).await });
        }

        tokio::spawn(orchestration_clock(state, traffic_socket));
    }

    /// Run the FNE, blocking until interrupted. Binds the traffic and OTAR
    /// sockets, spawns their worker pools and the orchestration clock (spec
    /// §5 "Scheduling model").
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (state, traffic_socket, otar_socket) = self.bind().await?;
        self.spawn_workers(state, traffic_socket, otar_socket);

        info!(peer_id = self.config.peer_id, "FNE orchestrator running");
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        Ok(())
    }
}

async fn traffic_worker(socket: Arc<UdpSocket>, state: Arc<FneState>, worker_id: usize) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                error!(worker_id, error = %e, "traffic socket recv failed");
                continue;
            }
        };
        if let Err(e) = handle_traffic_datagram(&state, &socket, addr, &buf[..len]).await {
            warn!(worker_id, error = %e, %addr, "dropping malformed traffic datagram");
        }
    }
}

async fn otar_worker(socket: Arc<UdpSocket>, state: Arc<FneState>, worker_id: usize) {
    let mut buf = vec![0u8; 1024];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                error!(worker_id, error = %e, "OTAR socket recv failed");
                continue;
            }
        };
        if let Err(e) = handle_otar_datagram(&state, &socket, addr, &buf[..len]).await {
            warn!(worker_id, error = %e, %addr, "dropping malformed OTAR datagram");
        }
    }
}

async fn handle_traffic_datagram(state: &Arc<FneState>, socket: &Arc<UdpSocket>, addr: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
    let frame = Frame::decode(datagram)?;
    if state.config.dump_packet_data {
        debug!(function = ?frame.fne.function, sub = frame.fne.sub_function, peer_id = frame.fne.peer_id, stream_id = frame.fne.stream_id, "traffic datagram");
    }
    match frame.fne.function {
        Function::Rptl => handle_rptl(state, socket, addr, &frame).await,
        Function::Rptk => handle_rptk(state, socket, addr, &frame).await,
        Function::Rptc => handle_rptc(state, socket, addr, &frame).await,
        Function::RptDisc => {
            handle_disconnect(state, frame.fne.peer_id);
            Ok(())
        }
        Function::Ping => handle_ping(state, socket, addr, &frame).await,
        Function::Ack | Function::Pong => Ok(()),
        Function::Nak => {
            info!(peer_id = frame.fne.peer_id, "peer reported NAK");
            Ok(())
        }
        Function::GrantReq => handle_grant_req(&frame),
        Function::InCallCtrl => handle_incall_ctrl(state, &frame),
        Function::KeyReq | Function::KeyRsp => {
            debug!(peer_id = frame.fne.peer_id, "legacy key envelope on traffic socket, ignored (OTAR socket handles KMM)");
            Ok(())
        }
        Function::Announce => handle_announce(state, &frame),
        Function::Repl => handle_repl(state, &frame),
        Function::NetTree => handle_net_tree(state, &frame),
        Function::Master => {
            debug!(peer_id = frame.fne.peer_id, "unexpected inbound MASTER frame, ignored");
            Ok(())
        }
        Function::Protocol => handle_protocol(state, socket, addr, &frame).await,
    }
}

async fn handle_rptl(state: &Arc<FneState>, socket: &UdpSocket, addr: SocketAddr, frame: &Frame) -> anyhow::Result<()> {
    let peer_id = frame.fne.peer_id;
    match state.peers.handle_login(peer_id, addr, state.peer_acl.as_ref()) {
        LoginOutcome::Ack { salt } => {
            state.affiliations.create_peer(peer_id);
            send_ack(socket, addr, peer_id, frame.fne.stream_id, &salt).await
        }
        LoginOutcome::Nak(reason) => send_nak(socket, addr, peer_id, frame.fne.stream_id, reason).await,
    }
}

async fn handle_rptk(state: &Arc<FneState>, socket: &UdpSocket, addr: SocketAddr, frame: &Frame) -> anyhow::Result<()> {
    let peer_id = frame.fne.peer_id;
    if frame.body.len() < 32 {
        return send_nak(socket, addr, peer_id, frame.fne.stream_id, NakReason::IllegalPacket).await;
    }
    match state.peers.handle_auth(peer_id, addr, &frame.body[..32], state.peer_acl.as_ref(), &state.config.password) {
        AuthOutcome::Ack => send_ack(socket, addr, peer_id, frame.fne.stream_id, &[]).await,
        AuthOutcome::Nak(reason) => send_nak(socket, addr, peer_id, frame.fne.stream_id, reason).await,
    }
}

async fn handle_rptc(state: &Arc<FneState>, socket: &UdpSocket, addr: SocketAddr, frame: &Frame) -> anyhow::Result<()> {
    let peer_id = frame.fne.peer_id;
    let (outcome, cfg) = state.peers.handle_config(peer_id, addr, &frame.body, true);
    match outcome {
        ConfigOutcome::Ack { diagnostic_port } => {
            if let Some(cfg) = cfg {
                if cfg.external_peer {
                    let master_id = cfg.master_peer_id.unwrap_or(peer_id);
                    match state.tree.admit_neighbour_login(peer_id, master_id) {
                        LoginAdmission::Accept | LoginAdmission::FastReconnect => {
                            state.tree.create_node(peer_id, master_id, cfg.identity.clone(), None);
                        }
                        LoginAdmission::DuplicateReject { offending_peer_id, informing_master } => {
                            state.peers.remove(offending_peer_id);
                            state.affiliations.erase_peer(offending_peer_id);
                            if let Some(master_addr) = state.peers.with_peer_mut(informing_master, |p| p.addr) {
                                let _ = send_net_tree_disc(socket, master_addr, state.config.peer_id, offending_peer_id).await;
                            }
                            return send_nak(socket, addr, peer_id, frame.fne.stream_id, NakReason::FneDuplicateConn).await;
                        }
                    }
                }
                if state.peer_acl.is_replica_participant(peer_id) {
                    state.peers.with_peer_mut(peer_id, |p| p.replica = true);
                }
                if state.peer_acl.can_issue_inhibit(peer_id) {
                    state.peers.with_peer_mut(peer_id, |p| p.has_call_priority = true);
                }
            }
            send_ack(socket, addr, peer_id, frame.fne.stream_id, &[diagnostic_port as u8]).await
        }
        ConfigOutcome::Nak(reason) => send_nak(socket, addr, peer_id, frame.fne.stream_id, reason).await,
    }
}

fn handle_disconnect(state: &Arc<FneState>, peer_id: u32) {
    state.peers.remove(peer_id);
    state.affiliations.erase_peer(peer_id);
    state.tree.erase_peer(peer_id);
    info!(peer_id, "peer disconnected");
}

async fn handle_ping(state: &Arc<FneState>, socket: &UdpSocket, addr: SocketAddr, frame: &Frame) -> anyhow::Result<()> {
    let peer_id = frame.fne.peer_id;
    if !state.peers.handle_ping(peer_id) {
        return send_nak(socket, addr, peer_id, frame.fne.stream_id, NakReason::BadConnState).await;
    }
    let now_ms = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    send_frame(socket, addr, Function::Pong, 0, state.config.peer_id, frame.fne.stream_id, now_ms.to_be_bytes().to_vec()).await
}

fn handle_grant_req(frame: &Frame) -> anyhow::Result<()> {
    if frame.body.len() < 8 {
        return Err(crate::error::FneError::Protocol("short GRANT_REQ body".to_string()).into());
    }
    let src_id = read_id24(&frame.body[0..3]);
    let dst_id = read_id24(&frame.body[3..6]);
    debug!(peer_id = frame.fne.peer_id, src_id, dst_id, "GRANT_REQ received");
    Ok(())
}

/// `cmd` value requesting the current call owner stand down (spec §6
/// "In-Call Control"); the remaining command space is not exercised by
/// this core.
const INCALL_CTRL_REJECT_TRAFFIC: u8 = 0x01;

fn handle_incall_ctrl(state: &Arc<FneState>, frame: &Frame) -> anyhow::Result<()> {
    if frame.body.len() < 9 {
        return Err(crate::error::FneError::Protocol("short INCALL_CTRL body".to_string()).into());
    }
    let cmd = frame.body[4];
    let dst_id = read_id24(&frame.body[5..8]);
    if cmd == INCALL_CTRL_REJECT_TRAFFIC {
        for protocol in [Protocol::Dmr, Protocol::P25, Protocol::Nxdn, Protocol::Analog] {
            state.calls.mark_takeover(CallKey { protocol, dst_id });
        }
    }
    Ok(())
}

fn handle_announce(state: &Arc<FneState>, frame: &Frame) -> anyhow::Result<()> {
    let peer_id = frame.fne.peer_id;
    let sub = frame.fne.sub_function;
    match sub {
        s if s == AnnounceSub::GrpAffil as u8 => {
            if frame.body.len() < 8 {
                return Err(crate::error::FneError::Protocol("short GRP_AFFIL body".to_string()).into());
            }
            let rid = u32::from_be_bytes(frame.body[0..4].try_into().unwrap());
            let tgid = u32::from_be_bytes(frame.body[4..8].try_into().unwrap());
            state.affiliations.affiliate_group(peer_id, rid, tgid);
        }
        s if s == AnnounceSub::GrpUnaffil as u8 => {
            if frame.body.len() < 4 {
                return Err(crate::error::FneError::Protocol("short GRP_UNAFFIL body".to_string()).into());
            }
            let rid = u32::from_be_bytes(frame.body[0..4].try_into().unwrap());
            state.affiliations.unaffiliate_group(peer_id, rid);
        }
        s if s == AnnounceSub::UnitReg as u8 => {
            if frame.body.len() < 8 {
                return Err(crate::error::FneError::Protocol("short UNIT_REG body".to_string()).into());
            }
            let rid = u32::from_be_bytes(frame.body[0..4].try_into().unwrap());
            let ssrc = u32::from_be_bytes(frame.body[4..8].try_into().unwrap());
            state.affiliations.register_unit(peer_id, rid, ssrc);
        }
        s if s == AnnounceSub::UnitDereg as u8 => {
            if frame.body.len() < 4 {
                return Err(crate::error::FneError::Protocol("short UNIT_DEREG body".to_string()).into());
            }
            let rid = u32::from_be_bytes(frame.body[0..4].try_into().unwrap());
            state.affiliations.deregister_unit(peer_id, rid);
        }
        s if s == AnnounceSub::Affils as u8 || s == AnnounceSub::SiteVc as u8 => {
            debug!(peer_id, "bulk affiliation/site-vc announce received");
        }
        other => debug!(peer_id, sub = other, "unknown ANNOUNCE sub-function"),
    }
    Ok(())
}

/// Inbound REPL reassembly only; applying the reassembled snapshot to this
/// process's own ACL/HA tables is left to the external ACL reloader (spec
/// §1) — this core logs completed reassembly and stops there (see
/// DESIGN.md, `m_peerReplicaSavesACL` open question).
fn handle_repl(state: &Arc<FneState>, frame: &Frame) -> anyhow::Result<()> {
    let fragment = packet_buffer::Fragment::decode(&frame.body)?;
    let key = (frame.fne.peer_id, frame.fne.sub_function);
    let mut table = state.repl_reassembly.lock();
    let reassembler = table.entry(key).or_default();
    if let Some(payload) = reassembler.feed(fragment) {
        table.remove(&key);
        drop(table);
        info!(peer_id = frame.fne.peer_id, sub = frame.fne.sub_function, bytes = payload.len(), "REPL payload reassembled");
    }
    Ok(())
}

fn handle_net_tree(state: &Arc<FneState>, frame: &Frame) -> anyhow::Result<()> {
    match frame.fne.sub_function {
        s if s == NetTreeSub::Disc as u8 => {
            if frame.body.len() < 4 {
                return Err(crate::error::FneError::Protocol("short NET_TREE_DISC body".to_string()).into());
            }
            let offending = u32::from_be_bytes(frame.body[0..4].try_into().unwrap());
            warn!(offending_peer_id = offending, "NET_TREE_DISC received, erasing subtree");
            state.tree.erase_peer(offending);
        }
        s if s == NetTreeSub::List as u8 => {
            let tree: Vec<TreeNodeJson> = serde_json::from_slice(&frame.body)?;
            state.tree.deserialize_announcement(frame.fne.peer_id, &tree);
        }
        other => debug!(sub = other, "unknown NET_TREE sub-function"),
    }
    Ok(())
}

/// One inbound PROTOCOL frame's routing-relevant attributes. The core's
/// scope excludes exact DMR/P25/NXDN air-interface bit layouts (spec §1);
/// this is the concrete minimal prefix this crate's wire format uses to
/// carry the fields the router does inspect (source/destination IDs,
/// status bits, slot) ahead of the opaque per-protocol payload.
struct StreamHeader {
    dst_id: u32,
    src_id: u32,
    is_terminator: bool,
    switch_over: bool,
    has_call_priority_hint: bool,
    is_private_call: bool,
    is_packet_data: bool,
    slot: Option<u8>,
}

fn parse_stream_header(body: &[u8]) -> anyhow::Result<(StreamHeader, &[u8])> {
    if body.len() < 10 {
        return Err(crate::error::FneError::Protocol("short protocol body".to_string()).into());
    }
    let dst_id = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let src_id = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let flags = body[8];
    let slot_raw = body[9];
    Ok((
        StreamHeader {
            dst_id,
            src_id,
            is_terminator: flags & 0x01 != 0,
            switch_over: flags & 0x02 != 0,
            has_call_priority_hint: flags & 0x04 != 0,
            is_private_call: flags & 0x08 != 0,
            is_packet_data: flags & 0x10 != 0,
            slot: if slot_raw == 0xFF { None } else { Some(slot_raw) },
        },
        &body[10..],
    ))
}

fn protocol_sub_code(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Dmr => ProtocolSub::Dmr as u8,
        Protocol::P25 => ProtocolSub::P25 as u8,
        Protocol::Nxdn => ProtocolSub::Nxdn as u8,
        Protocol::Analog => ProtocolSub::Analog as u8,
    }
}

async fn handle_protocol(state: &Arc<FneState>, socket: &Arc<UdpSocket>, addr: SocketAddr, frame: &Frame) -> anyhow::Result<()> {
    let peer_id = frame.fne.peer_id;
    if state.peers.state_of(peer_id) != Some(ConnectionState::Running) {
        return send_nak(socket, addr, peer_id, frame.fne.stream_id, NakReason::BadConnState).await;
    }
    let protocol = match frame.fne.sub_function {
        s if s == ProtocolSub::Dmr as u8 => Protocol::Dmr,
        s if s == ProtocolSub::P25 as u8 => Protocol::P25,
        s if s == ProtocolSub::Nxdn as u8 => Protocol::Nxdn,
        s if s == ProtocolSub::Analog as u8 => Protocol::Analog,
        other => return Err(crate::error::FneError::Protocol(format!("unknown protocol sub-function {other}")).into()),
    };

    let (hdr, payload) = parse_stream_header(&frame.body)?;

    if hdr.is_packet_data {
        if protocol == Protocol::P25 && !state.config.disable_packet_data {
            return handle_p25_pdu(state, socket, peer_id, addr, payload).await;
        }
        return Ok(());
    }

    let ctx = ValidationContext { rid_acl: &state.rid_acl, tg_rules: &state.tg_rules, reject_unknown_rid: state.config.reject_unknown_rid };
    let tg_id_opt = if hdr.is_private_call { None } else { Some(hdr.dst_id) };
    if let Err(reject) = router::validate_frame(&ctx, hdr.src_id, hdr.is_private_call, Some(hdr.dst_id), tg_id_opt, peer_id) {
        debug!(?reject, src_id = hdr.src_id, dst_id = hdr.dst_id, "frame rejected by validation");
        return Ok(());
    }

    let has_call_priority = hdr.has_call_priority_hint || state.peers.with_peer_mut(peer_id, |p| p.has_call_priority).unwrap_or(false);

    let stream_frame = callhandler::StreamFrame {
        protocol,
        dst_id: hdr.dst_id,
        src_id: hdr.src_id,
        peer_id,
        peer_addr: addr,
        ssrc: frame.rtp.ssrc,
        stream_id: frame.fne.stream_id,
        slot: hdr.slot,
        is_terminator: hdr.is_terminator,
        switch_over: hdr.switch_over,
        has_call_priority,
        in_call_control_enabled: state.config.in_call_control_enabled,
        is_private_call: hdr.is_private_call,
        payload: payload.to_vec(),
    };

    let decision = callhandler::drive_call_status(&state.calls, &state.parrot, &state.tg_rules, &stream_frame);

    match decision {
        callhandler::HandlerDecision::Reject => {
            debug!(protocol = ?protocol, dst_id = hdr.dst_id, "call collision, frame dropped");
            return Ok(());
        }
        callhandler::HandlerDecision::Preempt { preempted_peer_id } => {
            let _ = send_incall_ctrl_reject(socket, state, preempted_peer_id, hdr.dst_id, hdr.slot).await;
        }
        callhandler::HandlerDecision::PlaybackReady { frames } => {
            if !frames.is_empty() {
                spawn_parrot_playback(state.clone(), socket.clone(), protocol, hdr.dst_id, frames);
            }
        }
        callhandler::HandlerDecision::Forward => {}
    }

    fan_out_protocol_frame(state, socket, peer_id, protocol, frame, &hdr, payload).await;
    Ok(())
}

/// Fan out one accepted PROTOCOL frame to every permitted destination peer
/// (spec §4.3-§4.5): route-rewrite, then the group/private peer-permit
/// checks, batched via [`FanOutBatcher`].
async fn fan_out_protocol_frame(state: &Arc<FneState>, socket: &Arc<UdpSocket>, origin_peer_id: u32, protocol: Protocol, frame: &Frame, hdr: &StreamHeader, payload: &[u8]) {
    let rule = state.tg_rules.lookup(hdr.dst_id).cloned();
    let permit_ctx = PermitContext {
        affiliations: &state.affiliations,
        disallow_u2u: state.config.disallow_u2u,
        drop_u2u_peer_table: &[],
        restrict_pv_call_to_reg_only: state.config.restrict_pv_call_to_reg_only,
    };

    let targets: Vec<(u32, SocketAddr)> = if hdr.is_private_call {
        match callhandler::p25::steer_private_call(&state.affiliations, hdr.dst_id) {
            Some(dest_peer_id) if dest_peer_id != origin_peer_id && router::peer_permit_private(&permit_ctx, dest_peer_id, hdr.dst_id) => state
                .peers
                .snapshot_running()
                .into_iter()
                .filter(|(id, _, _, _)| *id == dest_peer_id)
                .map(|(id, addr, _, _)| (id, addr))
                .collect(),
            _ => Vec::new(),
        }
    } else {
        state
            .peers
            .snapshot_running()
            .into_iter()
            .filter(|(id, _, _, _)| *id != origin_peer_id)
            .filter(|(id, _, replica, _)| {
                if *replica {
                    return true;
                }
                let (is_conv, is_sysview) = state
                    .peers
                    .with_peer_mut(*id, |p| {
                        let cfg = p.config.as_ref();
                        (cfg.map(|c| c.conventional_peer).unwrap_or(false), cfg.map(|c| c.sys_view).unwrap_or(false))
                    })
                    .unwrap_or((false, false));
                rule.as_ref().map(|r| router::peer_permit_group(&permit_ctx, r, hdr.dst_id, *id, *replica, is_conv, is_sysview, false)).unwrap_or(true)
            })
            .map(|(id, addr, _, _)| (id, addr))
            .collect()
    };

    if targets.is_empty() {
        return;
    }

    let out_peer_id = if state.config.mask_outbound_peer_id { state.config.peer_id } else { origin_peer_id };

    let mut batcher = FanOutBatcher::new(|batch: &[(SocketAddr, Vec<u8>)]| {
        for (addr, bytes) in batch {
            let socket = socket.clone();
            let addr = *addr;
            let bytes = bytes.clone();
            tokio::spawn(async move {
                let _ = socket.send_to(&bytes, addr).await;
            });
        }
    });

    for (dest_peer_id, dest_addr) in targets {
        let tg_out = rule.as_ref().map(|r| router::rewrite_outbound_tg(Some(r), dest_peer_id, hdr.dst_id)).unwrap_or(hdr.dst_id);
        let out_seq = state
            .peers
            .with_peer_mut(dest_peer_id, |p| p.outbound_seq.entry((protocol_sub_code(protocol), tg_out)).or_default().next_for_frame(hdr.is_terminator))
            .unwrap_or(0);

        let out_rtp = RtpHeader { sequence: out_seq, timestamp: frame.rtp.timestamp, ssrc: frame.rtp.ssrc };
        let out_fne = FneHeader { function: Function::Protocol, sub_function: frame.fne.sub_function, peer_id: out_peer_id, stream_id: frame.fne.stream_id };
        let mut out_body = Vec::with_capacity(10 + payload.len());
        out_body.extend_from_slice(&tg_out.to_be_bytes());
        out_body.extend_from_slice(&hdr.src_id.to_be_bytes());
        out_body.push(frame.body[8]);
        out_body.push(frame.body[9]);
        out_body.extend_from_slice(payload);
        let out_frame = Frame { rtp: out_rtp, fne: out_fne, body: out_body };
        batcher.enqueue(dest_addr, out_frame.encode());
    }
}

/// Replay a completed parrot recording back to every connected peer (spec
/// §4.6 "Parrot"). For P25, a leading grant-demand is always synthesized
/// ahead of playback — resolving the open question of whether
/// grant-demand synthesis should precede broadcast or only originating-only
/// playback in favor of always preceding it (see DESIGN.md).
fn spawn_parrot_playback(state: Arc<FneState>, socket: Arc<UdpSocket>, protocol: Protocol, tg_id: u32, frames: Vec<callhandler::ParrotFrame>) {
    tokio::spawn(async move {
        let pacing = callhandler::playback_pacing(protocol);
        if protocol == Protocol::P25 {
            if let Some(first) = frames.first() {
                let _demand = callhandler::p25::synth_grant_demand(tg_id, first.src_id);
            }
        }
        for frame in frames {
            tokio::time::sleep(pacing).await;
            for (_, addr, _, _) in state.peers.snapshot_running() {
                let rtp = RtpHeader { sequence: 0, timestamp: 0, ssrc: frame.src_id };
                let fne = FneHeader { function: Function::Protocol, sub_function: protocol_sub_code(protocol), peer_id: state.config.peer_id, stream_id: 0 };
                let mut body = Vec::with_capacity(10 + frame.payload.len());
                body.extend_from_slice(&tg_id.to_be_bytes());
                body.extend_from_slice(&frame.src_id.to_be_bytes());
                body.push(0);
                body.push(0xFF);
                body.extend_from_slice(&frame.payload);
                let out = Frame { rtp, fne, body };
                let _ = socket.send_to(&out.encode(), addr).await;
            }
        }
    });
}

/// P25 PDU SAP dispatch: reassemble one confirmed/unconfirmed block series
/// and route the completed PDU to the SAP-specific handler (spec §4.7).
async fn handle_p25_pdu(state: &Arc<FneState>, socket: &Arc<UdpSocket>, peer_id: u32, addr: SocketAddr, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() < 7 {
        return Err(crate::error::FneError::Protocol("short PDU fixed header".to_string()).into());
    }
    let format = match payload[0] {
        0 => PduFormat::Response,
        1 => PduFormat::Unconfirmed,
        2 => PduFormat::Confirmed,
        other => return Err(crate::error::FneError::Protocol(format!("unknown PDU format {other}")).into()),
    };
    let sap = Sap::from_raw(payload[1]);
    let llid = u32::from_be_bytes(payload[2..6].try_into().unwrap());
    let blocks_to_follow = payload[6];
    let (ns, synchronize, data_start) = if format == PduFormat::Confirmed {
        if payload.len() < 9 {
            return Err(crate::error::FneError::Protocol("short confirmed PDU header".to_string()).into());
        }
        (Some(payload[7]), payload[8] & 0x01 != 0, 9)
    } else {
        (None, false, 7)
    };
    let data = &payload[data_start..];

    if !pdu_crc32_valid(data) {
        debug!(peer_id, llid, "PDU CRC failed, discarding");
        return Ok(());
    }

    let key = (peer_id, llid);
    let assembled = {
        let mut assemblers = state.pdu_assemblers.lock();
        let header = PduHeader { format, sap, llid, blocks_to_follow, ns, synchronize };
        let assembler = assemblers.entry(key).or_insert_with(|| PduAssembler::begin(header));
        assembler.feed(data)
    };
    let Some(assembled) = assembled else { return Ok(()) };
    state.pdu_assemblers.lock().remove(&key);

    match sap {
        Sap::Arp => {
            if assembled.len() >= 4 {
                let target = Ipv4Addr::from(u32::from_be_bytes(assembled[0..4].try_into().unwrap()));
                match pd_p25::dispatch_arp(target, state.config.tun_addr, &state.arp, |ip| state.rid_acl.rid_for_static_ip(ip)) {
                    pd_p25::SapOutcome::ArpReplyLlid(resolved) => {
                        debug!(peer_id, target = %target, resolved, "ARP resolved");
                        let _ = send_arp_reply(socket, addr, state.config.peer_id, llid, resolved).await;
                    }
                    pd_p25::SapOutcome::ArpReplyFneWuid => {
                        debug!(peer_id, "ARP resolved to FNE self address");
                        let _ = send_arp_reply(socket, addr, state.config.peer_id, llid, FNE_WUID_LLID).await;
                    }
                    pd_p25::SapOutcome::ArpUnresolved => debug!(peer_id, target = %target, "ARP unresolved"),
                    _ => {}
                }
            }
        }
        Sap::PacketData if format == PduFormat::Response => {
            if let Some(&marker) = assembled.first() {
                if marker == PDU_MARK_ACK {
                    state.pdu_ready.lock().insert(llid, true);
                    debug!(peer_id, llid, "egress PDU acked, subscriber ready for next packet");
                } else {
                    debug!(peer_id, llid, "egress PDU nacked by subscriber");
                }
            }
        }
        Sap::PacketData if format == PduFormat::Confirmed => {
            let ns_val = ns.unwrap_or(0);
            let (verdict, expected) = {
                let mut recv = state.pdu_recv_seq.lock();
                let v_r = recv.entry((peer_id, llid)).or_insert(0);
                let verdict = check_and_advance(v_r, ns_val, synchronize);
                (verdict, *v_r)
            };
            match verdict {
                ArqVerdict::Accept => {
                    debug!(peer_id, llid, bytes = assembled.len(), "packet-data PDU reassembled");
                    state.tun.send(&assembled);
                    let _ = send_pdu_ack(socket, addr, state.config.peer_id, llid).await;
                    maybe_broadcast_packet_data(state, socket, peer_id, llid, &assembled).await;
                }
                ArqVerdict::NackOutOfSeq => {
                    let _ = send_pdu_nack(socket, addr, state.config.peer_id, llid, expected).await;
                }
            }
        }
        Sap::PacketData => {
            debug!(peer_id, llid, bytes = assembled.len(), "unconfirmed packet-data PDU reassembled");
            state.tun.send(&assembled);
            maybe_broadcast_packet_data(state, socket, peer_id, llid, &assembled).await;
        }
        Sap::ConvDataReg => {
            if assembled.len() >= 5 {
                let cmd = if assembled[0] == 0 { pd_p25::ConvDataRegCmd::Connect } else { pd_p25::ConvDataRegCmd::Disconnect };
                let ip = Ipv4Addr::from(u32::from_be_bytes(assembled[1..5].try_into().unwrap()));
                pd_p25::dispatch_conv_data_reg(&state.conv_data_reg, cmd, llid, ip);
            }
        }
        Sap::SndcpCtrlData => {
            if !assembled.is_empty() {
                let ctrl = if assembled[0] == 0 { pd_p25::SndcpCtrl::ActTdsCtx } else { pd_p25::SndcpCtrl::DeactTdsCtxReq };
                let static_ip = state.rid_acl.static_ip_for(llid);
                pd_p25::dispatch_sndcp(ctrl, llid, static_ip, true, &state.sndcp_pool, &state.arp);
            }
        }
        Sap::UnencKmm | Sap::EncKmm => {
            debug!(peer_id, llid, "KMM-over-PDU received on traffic socket, ignored (OTAR socket is canonical)");
        }
        Sap::Other(code) => debug!(peer_id, code, "unhandled PDU SAP"),
    }
    Ok(())
}

/// Broadcast-destined packet data also fans out on the CAI side (spec §4.7
/// "PACKET_DATA"): every other connected peer receives the same payload
/// re-wrapped under the FNE's own send sequence for that LLID.
async fn maybe_broadcast_packet_data(state: &Arc<FneState>, socket: &Arc<UdpSocket>, origin_peer_id: u32, llid: u32, payload: &[u8]) {
    let Some(hdr) = tun::validate_ipv4(payload) else { return };
    if hdr.dst != Ipv4Addr::BROADCAST {
        return;
    }
    let pdu = encode_pdu_block(PduFormat::Unconfirmed, Sap::PacketData, llid, None, false, payload);
    for (peer_id, peer_addr, _, _) in state.peers.snapshot_running() {
        if peer_id == origin_peer_id {
            continue;
        }
        let _ = send_pdu_frame(socket, peer_addr, state.config.peer_id, llid, llid, pdu.clone()).await;
    }
}

const PDU_MARK_ACK: u8 = 0x00;
const PDU_MARK_NACK: u8 = 0x01;

fn sap_to_raw(sap: Sap) -> u8 {
    match sap {
        Sap::Arp => 0x00,
        Sap::PacketData => 0x01,
        Sap::ConvDataReg => 0x02,
        Sap::SndcpCtrlData => 0x03,
        Sap::UnencKmm => 0x04,
        Sap::EncKmm => 0x05,
        Sap::Other(v) => v,
    }
}

fn format_to_raw(format: PduFormat) -> u8 {
    match format {
        PduFormat::Response => 0,
        PduFormat::Unconfirmed => 1,
        PduFormat::Confirmed => 2,
    }
}

/// Encode one single-block PDU the way [`handle_p25_pdu`] decodes it:
/// `[format][sap][llid(4)][blocksToFollow=1][ns?][syncFlags?][data...][crc(4)]`.
/// The exact TIA-102 PDU bit layout is outside the core's scope (spec §2);
/// this is this crate's own concrete realization, symmetric with the
/// decode side above.
fn encode_pdu_block(format: PduFormat, sap: Sap, llid: u32, ns: Option<u8>, synchronize: bool, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + data.len() + 4);
    out.push(format_to_raw(format));
    out.push(sap_to_raw(sap));
    out.extend_from_slice(&llid.to_be_bytes());
    out.push(1);
    if let Some(ns) = ns {
        out.push(ns);
        out.push(if synchronize { 0x01 } else { 0x00 });
    }
    let mut crc_input = data.to_vec();
    crc_input.extend_from_slice(&[0, 0, 0, 0]);
    let crc = pdu_crc32(&crc_input);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc);
    out
}

fn encode_pdu_protocol_body(dst_llid: u32, src_llid: u32, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + pdu.len());
    out.extend_from_slice(&dst_llid.to_be_bytes());
    out.extend_from_slice(&src_llid.to_be_bytes());
    out.push(0x10); // is_packet_data
    out.push(0xFF); // slot: not applicable to packet data
    out.extend_from_slice(pdu);
    out
}

async fn send_pdu_frame(socket: &UdpSocket, addr: SocketAddr, fne_peer_id: u32, dst_llid: u32, src_llid: u32, pdu: Vec<u8>) -> anyhow::Result<()> {
    let body = encode_pdu_protocol_body(dst_llid, src_llid, &pdu);
    send_frame(socket, addr, Function::Protocol, ProtocolSub::P25 as u8, fne_peer_id, 0, body).await
}

async fn send_arp_reply(socket: &UdpSocket, addr: SocketAddr, fne_peer_id: u32, requester_llid: u32, reply_llid: u32) -> anyhow::Result<()> {
    let pdu = encode_pdu_block(PduFormat::Response, Sap::Arp, reply_llid, None, false, &[]);
    send_pdu_frame(socket, addr, fne_peer_id, requester_llid, reply_llid, pdu).await
}

async fn send_pdu_ack(socket: &UdpSocket, addr: SocketAddr, fne_peer_id: u32, llid: u32) -> anyhow::Result<()> {
    let pdu = encode_pdu_block(PduFormat::Response, Sap::PacketData, llid, None, false, &[PDU_MARK_ACK]);
    send_pdu_frame(socket, addr, fne_peer_id, llid, llid, pdu).await
}

async fn send_pdu_nack(socket: &UdpSocket, addr: SocketAddr, fne_peer_id: u32, llid: u32, expected_ns: u8) -> anyhow::Result<()> {
    let pdu = encode_pdu_block(PduFormat::Response, Sap::PacketData, llid, None, false, &[PDU_MARK_NACK, expected_ns]);
    send_pdu_frame(socket, addr, fne_peer_id, llid, llid, pdu).await
}

/// Emit an ARP request for `target_ip` to every connected peer — the
/// converged-core analogue of broadcasting the request over the air (spec
/// §4.7 "Egress path for PDUs").
async fn emit_arp_request(state: &Arc<FneState>, socket: &Arc<UdpSocket>, target_ip: Ipv4Addr) {
    let pdu = encode_pdu_block(PduFormat::Unconfirmed, Sap::Arp, 0, None, false, &u32::from(target_ip).to_be_bytes());
    for (_, addr, _, _) in state.peers.snapshot_running() {
        let _ = send_pdu_frame(socket, addr, state.config.peer_id, 0, 0, pdu.clone()).await;
    }
}

/// Dispatch one resolved egress PDU to the peer owning `llid`'s unit
/// registration, advancing V(S) and clearing the per-LLID ready gate until
/// the subscriber ACKs (spec §4.7 "Egress path for PDUs").
async fn dispatch_egress(state: &Arc<FneState>, socket: &Arc<UdpSocket>, llid: u32, payload: Vec<u8>) {
    let Some(target_peer) = state.affiliations.peer_for_unit_registration(llid) else {
        warn!(llid, "no peer owns this LLID's unit registration, egress PDU dropped");
        return;
    };
    let Some(target_addr) = state.peers.with_peer_mut(target_peer, |p| p.addr) else {
        return;
    };
    let (ns, synchronize) = {
        let mut seqs = state.pdu_send_seq.lock();
        let entry = seqs.entry(llid).or_insert((0u8, false));
        let ns = entry.0;
        let synchronize = entry.1;
        entry.1 = advance_send_seq(&mut entry.0);
        (ns, synchronize)
    };
    state.pdu_ready.lock().insert(llid, false);
    let pdu = encode_pdu_block(PduFormat::Confirmed, Sap::PacketData, llid, Some(ns), synchronize, &payload);
    let _ = send_pdu_frame(socket, target_addr, state.config.peer_id, llid, llid, pdu).await;
}

/// Drain the TUN device and pump the egress-retry queue (spec §4.7 "Egress
/// path for PDUs"): packets with a known, ready LLID dispatch immediately;
/// everything else queues for ARP resolution or subscriber-readiness retry.
async fn drive_pdu_egress(state: &Arc<FneState>, socket: &Arc<UdpSocket>) {
    if state.config.disable_packet_data {
        return;
    }
    while let Some(packet) = state.tun.try_recv() {
        match tun::validate_ipv4(&packet) {
            Some(hdr) => state.pdu_egress_queue.lock().push_back(QueuedEgress::new(hdr.dst, packet)),
            None => debug!("malformed IPv4 datagram on TUN, dropped"),
        }
    }

    let now = Instant::now();
    let pending: Vec<QueuedEgress> = state.pdu_egress_queue.lock().drain(..).collect();
    let mut remaining = VecDeque::new();
    for mut item in pending {
        let resolved = state.arp.resolve(item.dest_ip).or_else(|| state.rid_acl.rid_for_static_ip(item.dest_ip));
        match resolved {
            Some(llid) => {
                let ready = { state.pdu_ready.lock().get(&llid).copied().unwrap_or(true) };
                if ready {
                    dispatch_egress(state, socket, llid, item.payload).await;
                    continue;
                }
                if !item.extended_budget {
                    item.extended_budget = true;
                    item.attempts = 0;
                    item.last_attempt = now;
                } else if item.due(now) {
                    item.attempts += 1;
                    item.last_attempt = now;
                }
                if item.exhausted() {
                    warn!(dest = %item.dest_ip, "queued PDU dropped, subscriber never signalled ready");
                    continue;
                }
                remaining.push_back(item);
            }
            None => {
                if item.due(now) {
                    item.attempts += 1;
                    item.last_attempt = now;
                    emit_arp_request(state, socket, item.dest_ip).await;
                }
                if item.exhausted() {
                    warn!(dest = %item.dest_ip, "queued PDU dropped, ARP resolution exhausted");
                    continue;
                }
                remaining.push_back(item);
            }
        }
    }
    state.pdu_egress_queue.lock().extend(remaining);
}

/// Inbound `{mfId, algoId, kid, mi}` + KMM frame (spec §6 "OTAR UDP
/// socket"). `mfId == 0` means the KMM body travels unencrypted; any other
/// value selects the keystream-XOR scheme derived from `(MI, algoId, kid)`.
const MF_ID_UNENCRYPTED: u8 = 0x00;

mod kmm_wire {
    pub const HELLO: u8 = 0x10;
    pub const NAK: u8 = 0x11;
    pub const REKEY_ACK: u8 = 0x12;
    pub const REG_RSP: u8 = 0x13;
    pub const UNABLE_TO_DECRYPT: u8 = 0x14;
    pub const DEREG_CMD: u8 = 0x15;
    pub const KEY_REQ: u8 = 0x16;
    pub const MODIFY_KEY: u8 = 0x17;
    pub const DEREG_RESPONSE: u8 = 0x18;
}

fn kmm_message_id_from_raw(v: u8) -> anyhow::Result<KmmMessageId> {
    use kmm_wire::*;
    Ok(match v {
        HELLO => KmmMessageId::Hello,
        NAK => KmmMessageId::Nak,
        REKEY_ACK => KmmMessageId::RekeyAck,
        REG_RSP => KmmMessageId::RegRsp,
        UNABLE_TO_DECRYPT => KmmMessageId::UnableToDecrypt,
        DEREG_CMD => KmmMessageId::DeregCmd,
        KEY_REQ => KmmMessageId::KeyReq,
        MODIFY_KEY => KmmMessageId::ModifyKey,
        DEREG_RESPONSE => KmmMessageId::DeregResponse,
        other => return Err(crate::error::FneError::Protocol(format!("unknown KMM message id {other}")).into()),
    })
}

fn kmm_raw_from_message_id(id: KmmMessageId) -> u8 {
    use kmm_wire::*;
    match id {
        KmmMessageId::Hello => HELLO,
        KmmMessageId::Nak => NAK,
        KmmMessageId::RekeyAck => REKEY_ACK,
        KmmMessageId::RegRsp => REG_RSP,
        KmmMessageId::UnableToDecrypt => UNABLE_TO_DECRYPT,
        KmmMessageId::DeregCmd => DEREG_CMD,
        KmmMessageId::KeyReq => KEY_REQ,
        KmmMessageId::ModifyKey => MODIFY_KEY,
        KmmMessageId::DeregResponse => DEREG_RESPONSE,
    }
}

/// `[msgId(1)][msgNumber(2)][srcLlid(4)][dstLlid(4)][payload...]` — this
/// crate's concrete realization of "a KMM frame" (spec §6), since the exact
/// TIA-102 KMM field layout is outside the core's bit-exact scope.
fn build_kmm_body(message_id: KmmMessageId, src_llid: u32, dst_llid: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + payload.len());
    out.push(kmm_raw_from_message_id(message_id));
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&src_llid.to_be_bytes());
    out.extend_from_slice(&dst_llid.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

async fn handle_otar_datagram(state: &Arc<FneState>, socket: &Arc<UdpSocket>, addr: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
    if datagram.len() < 13 {
        return Err(crate::error::FneError::Protocol("short OTAR datagram".to_string()).into());
    }
    let mf_id = datagram[0];
    let algo_id = datagram[1];
    let key_id = u16::from_be_bytes([datagram[2], datagram[3]]);
    let mi: [u8; MI_LENGTH_BYTES] = datagram[4..13].try_into().unwrap();
    let mut kmm_body = datagram[13..].to_vec();

    if mf_id != MF_ID_UNENCRYPTED {
        let Some(entry) = state.keys.get(key_id) else {
            warn!(key_id, "OTAR datagram references unknown key id, dropping");
            return Ok(());
        };
        xor_keystream(&mut kmm_body, algo_id, key_id, &entry.key, mi);
    }

    if kmm_body.len() < 11 {
        return Err(crate::error::FneError::Protocol("short KMM message".to_string()).into());
    }
    let message_id = kmm_message_id_from_raw(kmm_body[0])?;
    let message_number = u16::from_be_bytes([kmm_body[1], kmm_body[2]]);
    let src_llid = u32::from_be_bytes(kmm_body[3..7].try_into().unwrap());
    let dst_llid = u32::from_be_bytes(kmm_body[7..11].try_into().unwrap());
    let msg = KmmMessage { message_id, message_number: Some(message_number), src_llid, dst_llid, body: kmm_body[11..].to_vec() };

    let requesting_peer = state.peers.snapshot_running().into_iter().find(|(_, peer_addr, _, _)| *peer_addr == addr).map(|(id, _, _, _)| id).unwrap_or(0);
    let peer_may_request_keys = state.peer_acl.can_request_keys(requesting_peer);

    match otar::dispatch_inbound(&msg, &state.keys, requesting_peer, peer_may_request_keys) {
        KmmOutcome::DeregResponse { dst_llid } => {
            let body = build_kmm_body(KmmMessageId::DeregResponse, state.config.peer_id, dst_llid, &[]);
            send_kmm_response(socket, addr, state, algo_id, key_id, mi, body).await
        }
        KmmOutcome::NoService { dst_llid } => {
            let body = build_kmm_body(KmmMessageId::Nak, state.config.peer_id, dst_llid, &[]);
            send_kmm_response(socket, addr, state, algo_id, key_id, mi, body).await
        }
        KmmOutcome::ModifyKeyResponse { dst_llid, payload } => {
            let body = build_kmm_body(KmmMessageId::ModifyKey, state.config.peer_id, dst_llid, &payload);
            send_kmm_response(socket, addr, state, algo_id, key_id, mi, body).await
        }
        KmmOutcome::ForwardUpstream { key_id: kid, requesting_peer } => {
            state.pending_key_requests.enqueue(kid, requesting_peer);
            info!(key_id = kid, requesting_peer, "forwarding KEY_REQ upstream (no master configured for this process)");
            Ok(())
        }
        KmmOutcome::Logged => Ok(()),
    }
}

fn xor_keystream(body: &mut [u8], algo_id: u8, key_id: u16, tek: &[u8], mi: [u8; MI_LENGTH_BYTES]) {
    let mut crypto = P25Crypto::new(algo_id, key_id, tek.to_vec());
    crypto.set_mi(mi);
    crypto.generate_keystream();
    let ks = crypto.keystream_bytes();
    if ks.is_empty() {
        return;
    }
    for (i, b) in body.iter_mut().enumerate() {
        *b ^= ks[i % ks.len()];
    }
}

async fn send_kmm_response(socket: &UdpSocket, addr: SocketAddr, state: &Arc<FneState>, algo_id: u8, key_id: u16, mi: [u8; MI_LENGTH_BYTES], mut kmm_body: Vec<u8>) -> anyhow::Result<()> {
    let mf_id = if let Some(entry) = state.keys.get(key_id) {
        xor_keystream(&mut kmm_body, algo_id, key_id, &entry.key, mi);
        0x01
    } else {
        MF_ID_UNENCRYPTED
    };
    let mut datagram = Vec::with_capacity(13 + kmm_body.len());
    datagram.push(mf_id);
    datagram.push(algo_id);
    datagram.extend_from_slice(&key_id.to_be_bytes());
    datagram.extend_from_slice(&mi);
    datagram.extend_from_slice(&kmm_body);
    socket.send_to(&datagram, addr).await?;
    Ok(())
}

/// Sweep timed-out peers and redistribute replicated metadata to registered
/// replica peers on the orchestration clock (spec §2, §5).
async fn orchestration_clock(state: Arc<FneState>, socket: Arc<UdpSocket>) {
    let clock_interval = Duration::from_millis(state.config.clock_interval_ms.max(1));
    let mut tick = tokio::time::interval(clock_interval);
    let ticks_per_update = ((state.config.update_lookup_time_secs * 1000) / clock_interval.as_millis().max(1) as u64).max(1);
    let mut ticks_since_update = 0u64;

    loop {
        tick.tick().await;

        for peer_id in state.peers.sweep_timeouts(&state.config) {
            warn!(peer_id, "peer ping timeout, disconnecting");
            handle_disconnect(&state, peer_id);
        }

        drive_pdu_egress(&state, &socket).await;

        ticks_since_update += 1;
        if ticks_since_update >= ticks_per_update {
            ticks_since_update = 0;
            redistribute_metadata(&state, &socket).await;
        }
    }
}

fn encode_ha_params(ha: &HaParameters) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(ha.entries().len() as u32).to_be_bytes());
    for e in ha.entries() {
        out.extend_from_slice(&e.peer_id.to_be_bytes());
        out.extend_from_slice(&u32::from(e.ipv4).to_be_bytes());
        out.extend_from_slice(&e.port.to_be_bytes());
    }
    out
}

/// HA-parameter redistribution (supplemented feature, SPEC_FULL §11). RID
/// and talkgroup redistribution follow the same `send_repl_payload` path
/// once the external ACL reloader hands this process fresh snapshots; this
/// clock cycle only has HA parameters to redistribute on its own.
async fn redistribute_metadata(state: &Arc<FneState>, socket: &Arc<UdpSocket>) {
    let snapshot = encode_ha_params(&state.ha_params.lock());
    send_repl_payload(state, socket, ReplSub::HaParams, &snapshot).await;
    debug!("metadata redistribution cycle complete");
}

/// Fragment `payload` via the packet buffer and ship each fragment to every
/// replica-participant peer, paced ~60ms per fragment (spec §5).
async fn send_repl_payload(state: &Arc<FneState>, socket: &Arc<UdpSocket>, sub: ReplSub, payload: &[u8]) {
    let fragments = packet_buffer::encode(payload);
    let targets: Vec<SocketAddr> = state.peers.snapshot_running().into_iter().filter(|(_, _, replica, _)| *replica).map(|(_, addr, _, _)| addr).collect();
    if targets.is_empty() {
        return;
    }
    for addr in targets {
        for fragment in &fragments {
            let rtp = RtpHeader { sequence: 0, timestamp: 0, ssrc: state.config.peer_id };
            let fne = FneHeader { function: Function::Repl, sub_function: sub as u8, peer_id: state.config.peer_id, stream_id: 0 };
            let out = Frame { rtp, fne, body: fragment.encode() };
            let _ = socket.send_to(&out.encode(), addr).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
    }
}

fn write_id24(out: &mut Vec<u8>, v: u32) {
    let b = v.to_be_bytes();
    out.extend_from_slice(&b[1..]);
}

fn read_id24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

async fn send_frame(socket: &UdpSocket, addr: SocketAddr, function: Function, sub_function: u8, peer_id: u32, stream_id: u32, body: Vec<u8>) -> anyhow::Result<()> {
    let frame = Frame { rtp: RtpHeader { sequence: 0, timestamp: 0, ssrc: peer_id }, fne: FneHeader { function, sub_function, peer_id, stream_id }, body };
    socket.send_to(&frame.encode(), addr).await?;
    Ok(())
}

async fn send_ack(socket: &UdpSocket, addr: SocketAddr, peer_id: u32, stream_id: u32, body: &[u8]) -> anyhow::Result<()> {
    send_frame(socket, addr, Function::Ack, 0, peer_id, stream_id, body.to_vec()).await
}

async fn send_nak(socket: &UdpSocket, addr: SocketAddr, peer_id: u32, stream_id: u32, reason: NakReason) -> anyhow::Result<()> {
    let mut body = peer_id.to_be_bytes().to_vec();
    body.extend_from_slice(&(reason as u16).to_be_bytes());
    send_frame(socket, addr, Function::Nak, 0, peer_id, stream_id, body).await
}

async fn send_net_tree_disc(socket: &UdpSocket, addr: SocketAddr, peer_id: u32, offending_peer_id: u32) -> anyhow::Result<()> {
    send_frame(socket, addr, Function::NetTree, NetTreeSub::Disc as u8, peer_id, 0, offending_peer_id.to_be_bytes().to_vec()).await
}

async fn send_incall_ctrl_reject(socket: &UdpSocket, state: &Arc<FneState>, target_peer_id: u32, dst_id: u32, slot: Option<u8>) -> anyhow::Result<()> {
    let Some((_, addr, _, _)) = state.peers.snapshot_running().into_iter().find(|(id, _, _, _)| *id == target_peer_id) else {
        return Ok(());
    };
    let mut body = Vec::with_capacity(9);
    body.extend_from_slice(&target_peer_id.to_be_bytes());
    body.push(INCALL_CTRL_REJECT_TRAFFIC);
    write_id24(&mut body, dst_id);
    body.push(slot.unwrap_or(0xFF));
    send_frame(socket, addr, Function::InCallCtrl, 0, state.config.peer_id, 0, body).await
}
