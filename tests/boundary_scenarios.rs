//! Crate-level acceptance tests exercising the boundary scenarios from
//! spec.md §8 end-to-end over real UDP sockets against a live [`Server`].
//!
//! Each test binds the traffic socket to `127.0.0.1:0`, spawns the worker
//! pools, and drives the engine with a plain `tokio::net::UdpSocket` client
//! the way a real repeater/peer would.

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use dvm_fne::config::FneConfig;
use dvm_fne::frame::{Frame, FneHeader, Function, ProtocolSub, RtpHeader};
use dvm_fne::server::Server;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const GLOBAL_PASSWORD: &str = "dvm123";

fn base_config() -> FneConfig {
    FneConfig {
        traffic_addr: "127.0.0.1:0".parse().unwrap(),
        otar_addr: "127.0.0.1:0".parse().unwrap(),
        peer_id: 900000,
        password: GLOBAL_PASSWORD.to_string(),
        soft_conn_limit: 10,
        worker_threads: 2,
        otar_worker_threads: 1,
        rid_acl_file: None,
        tg_rule_file: None,
        peer_acl_file: None,
        key_container_file: None,
        ha_params_file: None,
        tun_addr: "10.10.1.1".parse().unwrap(),
        update_lookup_time_secs: 3600,
        clock_interval_ms: 50,
        disallow_u2u: false,
        restrict_pv_call_to_reg_only: false,
        in_call_control_enabled: true,
        dump_packet_data: false,
        ping_time_ms: 5000,
        max_missed_pings: 3,
        call_collision_timeout_secs: 2,
        max_missed_acl_updates: 3,
        mask_outbound_peer_id: false,
        mask_outbound_peer_id_for_non_pl: false,
        reject_unknown_rid: false,
        sndcp_start_addr: "10.10.1.1".parse().unwrap(),
        sndcp_end_addr: "10.10.1.254".parse().unwrap(),
        verbose_packet_data: false,
        disable_packet_data: false,
        allow_no_ukek_rekey: false,
        config_file: None,
    }
}

/// Write a one-entry active talkgroup-rule TOML file and return it (kept
/// alive by the caller for the file's lifetime).
fn active_tg_rule_file(tg_id: u32) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "[[talkgroups]]\nid = {tg_id}\nactive = true\n").unwrap();
    f
}

/// Bind and spawn a live server, returning its bound traffic-socket address.
async fn spawn_server(config: FneConfig) -> SocketAddr {
    let mut server = Server::new(config);
    let (state, traffic_socket, otar_socket) = server.bind().await.expect("bind");
    let addr = traffic_socket.local_addr().unwrap();
    server.spawn_workers(state, traffic_socket, otar_socket);
    addr
}

async fn client() -> UdpSocket {
    let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    s
}

async fn send_frame(socket: &UdpSocket, to: SocketAddr, function: Function, sub: u8, peer_id: u32, stream_id: u32, body: Vec<u8>) {
    let frame = Frame { rtp: RtpHeader { sequence: 0, timestamp: 0, ssrc: peer_id }, fne: FneHeader { function, sub_function: sub, peer_id, stream_id }, body };
    socket.send_to(&frame.encode(), to).await.unwrap();
}

async fn recv_frame(socket: &UdpSocket) -> Frame {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await.expect("recv timed out").unwrap();
    Frame::decode(&buf[..len]).unwrap()
}

async fn recv_none(socket: &UdpSocket, within: Duration) {
    let mut buf = vec![0u8; 2048];
    let result = timeout(within, socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "expected no datagram but received one");
}

/// Drive a peer through RPTL -> RPTK -> RPTC, asserting each ACK, and leave
/// it RUNNING. Returns nothing; the socket is left ready for PROTOCOL/PING.
async fn login_peer(socket: &UdpSocket, fne_addr: SocketAddr, peer_id: u32, identity: &str, extra_json: &str) {
    send_frame(socket, fne_addr, Function::Rptl, 0, peer_id, 0, vec![]).await;
    let ack = recv_frame(socket).await;
    assert_eq!(ack.fne.function, Function::Ack);
    let salt = ack.body.clone();
    assert_eq!(salt.len(), 4);

    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(GLOBAL_PASSWORD.as_bytes());
    let digest = hasher.finalize();
    send_frame(socket, fne_addr, Function::Rptk, 0, peer_id, 0, digest.to_vec()).await;
    let ack = recv_frame(socket).await;
    assert_eq!(ack.fne.function, Function::Ack);

    let body = format!(r#"{{"identity":"{identity}","rxFrequency":851000000,"txFrequency":806000000{extra_json}}}"#);
    send_frame(socket, fne_addr, Function::Rptc, 0, peer_id, 0, body.into_bytes()).await;
    let ack = recv_frame(socket).await;
    assert_eq!(ack.fne.function, Function::Ack, "RPTC should be ACKd");
}

fn protocol_body(dst_id: u32, src_id: u32, flags: u8, slot: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + payload.len());
    out.extend_from_slice(&dst_id.to_be_bytes());
    out.extend_from_slice(&src_id.to_be_bytes());
    out.push(flags);
    out.push(slot);
    out.extend_from_slice(payload);
    out
}

const FLAG_TERMINATOR: u8 = 0x01;
const FLAG_CALL_PRIORITY: u8 = 0x04;

/// Scenario 1: login-auth-config-ping happy path (spec §8 #1).
#[tokio::test]
async fn login_auth_config_ping_happy_path() {
    let fne_addr = spawn_server(base_config()).await;
    let peer = client().await;
    login_peer(&peer, fne_addr, 1, "UNIT-1", "").await;

    send_frame(&peer, fne_addr, Function::Ping, 0, 1, 0, vec![]).await;
    let pong = recv_frame(&peer).await;
    assert_eq!(pong.fne.function, Function::Pong);
    assert_eq!(pong.body.len(), 8, "PONG carries an 8-byte monotonic timestamp");
}

/// Scenario 2: call collision rejected (spec §8 #2).
#[tokio::test]
async fn call_collision_is_rejected() {
    let tg_file = active_tg_rule_file(1000);
    let mut config = base_config();
    config.tg_rule_file = Some(tg_file.path().to_path_buf());
    let fne_addr = spawn_server(config).await;

    let peer_a = client().await;
    let peer_b = client().await;
    login_peer(&peer_a, fne_addr, 10, "SITE-A", "").await;
    login_peer(&peer_b, fne_addr, 11, "SITE-B", "").await;

    // A originates a P25 LDU1 to dstId=1000 on stream 0xAAAA.
    let body_a = protocol_body(1000, 5000, 0, 0xFF, b"ldu1-a");
    send_frame(&peer_a, fne_addr, Function::Protocol, ProtocolSub::P25 as u8, 10, 0xAAAA, body_a).await;
    // B fans out A's frame.
    let fanned = recv_frame(&peer_b).await;
    assert_eq!(fanned.fne.function, Function::Protocol);

    // B attempts a concurrent call to the same destination on a different stream.
    let body_b = protocol_body(1000, 6000, 0, 0xFF, b"ldu1-b");
    send_frame(&peer_b, fne_addr, Function::Protocol, ProtocolSub::P25 as u8, 11, 0xBBBB, body_b).await;

    // The collision is silently dropped: A never sees B's frame.
    recv_none(&peer_a, Duration::from_millis(500)).await;
}

/// Scenario 3: call takeover by priority (spec §8 #3).
#[tokio::test]
async fn priority_peer_takes_over_and_sends_reject_traffic() {
    let tg_file = active_tg_rule_file(1000);
    let mut config = base_config();
    config.tg_rule_file = Some(tg_file.path().to_path_buf());
    let fne_addr = spawn_server(config).await;

    let peer_a = client().await;
    let peer_b = client().await;
    login_peer(&peer_a, fne_addr, 20, "SITE-A", "").await;
    login_peer(&peer_b, fne_addr, 21, "SITE-B", "").await;

    let body_a = protocol_body(1000, 5000, 0, 0xFF, b"ldu1-a");
    send_frame(&peer_a, fne_addr, Function::Protocol, ProtocolSub::P25 as u8, 20, 0xAAAA, body_a).await;
    let _ = recv_frame(&peer_b).await; // B sees A's fanned-out frame.

    // B's frame carries the call-priority hint; it should preempt A.
    let body_b = protocol_body(1000, 6000, FLAG_CALL_PRIORITY, 0xFF, b"ldu1-b");
    send_frame(&peer_b, fne_addr, Function::Protocol, ProtocolSub::P25 as u8, 21, 0xBBBB, body_b).await;

    // A receives an In-Call Control REJECT_TRAFFIC naming dstId=1000.
    let ctrl = recv_frame(&peer_a).await;
    assert_eq!(ctrl.fne.function, Function::InCallCtrl);
    let dst_id = u32::from_be_bytes([0, ctrl.body[5], ctrl.body[6], ctrl.body[7]]);
    assert_eq!(dst_id, 1000);
    assert_eq!(ctrl.body[4], 0x01, "command byte is REJECT_TRAFFIC");

    // A's subsequent frame on the old stream is now rejected (B owns the call).
    let body_a2 = protocol_body(1000, 5000, 0, 0xFF, b"ldu1-a-again");
    send_frame(&peer_a, fne_addr, Function::Protocol, ProtocolSub::P25 as u8, 20, 0xAAAA, body_a2).await;
    recv_none(&peer_b, Duration::from_millis(500)).await;
}

/// Scenario 6: spanning-tree loop break on duplicate master ID (spec §8 #6).
#[tokio::test]
async fn duplicate_neighbour_master_id_is_rejected_and_disconnect_notified() {
    let fne_addr = spawn_server(base_config()).await;

    let neighbour_5 = client().await;
    login_peer(&neighbour_5, fne_addr, 5, "NEIGHBOUR-5", r#","externalPeer":true,"masterPeerId":5"#).await;

    // Peer 2 logs in claiming masterPeerId=5, already owned by peer 5's node.
    let neighbour_2 = client().await;
    send_frame(&neighbour_2, fne_addr, Function::Rptl, 0, 2, 0, vec![]).await;
    let ack = recv_frame(&neighbour_2).await;
    let salt = ack.body.clone();
    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(GLOBAL_PASSWORD.as_bytes());
    send_frame(&neighbour_2, fne_addr, Function::Rptk, 0, 2, 0, hasher.finalize().to_vec()).await;
    let _ = recv_frame(&neighbour_2).await;

    let body = r#"{"identity":"NEIGHBOUR-2","rxFrequency":851000000,"txFrequency":806000000,"externalPeer":true,"masterPeerId":5}"#;
    send_frame(&neighbour_2, fne_addr, Function::Rptc, 0, 2, 0, body.as_bytes().to_vec()).await;

    let nak = recv_frame(&neighbour_2).await;
    assert_eq!(nak.fne.function, Function::Nak, "duplicate masterPeerId must be NAK'd");

    // Peer 5 receives the NET_TREE_DISC naming the offending peer (2).
    let disc = recv_frame(&neighbour_5).await;
    assert_eq!(disc.fne.function, Function::NetTree);
    let offending = u32::from_be_bytes(disc.body[0..4].try_into().unwrap());
    assert_eq!(offending, 2);
}
