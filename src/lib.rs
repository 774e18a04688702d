//! Converged FNE core: peer session engine, per-stream router, multi-protocol
//! call handlers, P25 PDU engine, OTAR/KMM service, federation spanning tree
//! and the block-cipher/voice-keystream primitives that back them.

pub mod acl;
pub mod affiliation;
pub mod callhandler;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod otar;
pub mod packet_buffer;
pub mod peer;
pub mod router;
pub mod server;
pub mod spanning_tree;
pub mod tun;
