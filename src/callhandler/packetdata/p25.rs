//! P25-specific PDU SAP dispatch: the header already parsed by
//! [`super::PduAssembler`] is routed here by SAP once reassembly completes
//! (spec §4.7 "SAPs handled locally").

use std::net::Ipv4Addr;

use super::{ArpTable, ConvDataRegTable, Sap, SndcpError, SndcpPool};

/// `CONV_DATA_REG` control value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvDataRegCmd {
    Connect,
    Disconnect,
}

/// `SNDCP_CTRL_DATA` control value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SndcpCtrl {
    ActTdsCtx,
    DeactTdsCtxReq,
}

/// Outcome of dispatching one reassembled P25 PDU by SAP.
#[derive(Debug, Clone)]
pub enum SapOutcome {
    /// Reply to the sender's LLID with the FNE's own WUID.
    ArpReplyFneWuid,
    /// Reply to the sender's LLID with a resolved target LLID.
    ArpReplyLlid(u32),
    /// No ARP mapping known for the requested target address; no reply sent.
    ArpUnresolved,
    /// Accepted packet data: write `payload` to the TUN device and ACK the sender.
    PacketDataAccept { payload: Vec<u8>, broadcast: bool },
    /// Out-of-sequence packet data: NACK with the expected N(S).
    PacketDataNack { expected_ns: u8 },
    ConvDataRegHandled,
    SndcpAccept { ip: Ipv4Addr },
    SndcpReject(SndcpError),
    SndcpDisconnected,
    /// Hand the decrypted body to the KMM service (spec §4.8).
    Kmm { body: Vec<u8> },
}

/// Dispatch a reassembled PDU by SAP. `target_proto_addr` is the ARP
/// target protocol address (for `Sap::Arp`); `fne_tun_addr` is this FNE's
/// own TUN IPv4 address.
pub fn dispatch_arp(target_proto_addr: Ipv4Addr, fne_tun_addr: Ipv4Addr, arp: &ArpTable, static_rid_ip: impl Fn(Ipv4Addr) -> Option<u32>) -> SapOutcome {
    if target_proto_addr == fne_tun_addr {
        return SapOutcome::ArpReplyFneWuid;
    }
    if let Some(llid) = arp.resolve(target_proto_addr) {
        return SapOutcome::ArpReplyLlid(llid);
    }
    if let Some(llid) = static_rid_ip(target_proto_addr) {
        arp.learn(target_proto_addr, llid);
        return SapOutcome::ArpReplyLlid(llid);
    }
    SapOutcome::ArpUnresolved
}

/// Learn a sender's `(ip, llid)` mapping opportunistically, as `Sap::Arp`
/// requests pass through (spec §4.7 "Opportunistically cache sender mappings").
pub fn learn_sender(arp: &ArpTable, sender_ip: Ipv4Addr, sender_llid: u32) {
    arp.learn(sender_ip, sender_llid);
}

pub fn dispatch_conv_data_reg(table: &ConvDataRegTable, cmd: ConvDataRegCmd, llid: u32, ip: Ipv4Addr) -> SapOutcome {
    match cmd {
        ConvDataRegCmd::Connect => table.connect(llid, ip),
        ConvDataRegCmd::Disconnect => table.disconnect(llid),
    }
    SapOutcome::ConvDataRegHandled
}

/// `SNDCP_CTRL_DATA` dispatch: static IP from the RID table takes
/// precedence over dynamic allocation (spec §4.7 "SNDCP_CTRL_DATA").
pub fn dispatch_sndcp(ctrl: SndcpCtrl, llid: u32, static_ip: Option<Ipv4Addr>, provisioned: bool, pool: &SndcpPool, arp: &ArpTable) -> SapOutcome {
    match ctrl {
        SndcpCtrl::DeactTdsCtxReq => {
            arp.forget_llid(llid);
            SapOutcome::SndcpDisconnected
        }
        SndcpCtrl::ActTdsCtx => {
            if !provisioned {
                return SapOutcome::SndcpReject(SndcpError::SuNotProvisioned);
            }
            if let Some(ip) = static_ip {
                arp.learn(ip, llid);
                return SapOutcome::SndcpAccept { ip };
            }
            match pool.allocate(llid, arp) {
                Ok(ip) => SapOutcome::SndcpAccept { ip },
                Err(e) => SapOutcome::SndcpReject(e),
            }
        }
    }
}

/// Identify whether a P25 SAP requires KMM dispatch (spec §4.7
/// `UNENC_KMM`/`ENC_KMM`).
pub fn is_kmm(sap: Sap) -> bool {
    matches!(sap, Sap::UnencKmm | Sap::EncKmm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callhandler::packetdata::{ArpTable, SndcpPool};

    #[test]
    fn arp_request_for_fne_addr_gets_wuid_reply() {
        let arp = ArpTable::new();
        let fne_addr: Ipv4Addr = "10.10.1.1".parse().unwrap();
        let outcome = dispatch_arp(fne_addr, fne_addr, &arp, |_| None);
        assert!(matches!(outcome, SapOutcome::ArpReplyFneWuid));
    }

    #[test]
    fn arp_request_resolves_via_static_table_and_caches() {
        let arp = ArpTable::new();
        let fne_addr: Ipv4Addr = "10.10.1.1".parse().unwrap();
        let target: Ipv4Addr = "10.10.1.42".parse().unwrap();
        let outcome = dispatch_arp(target, fne_addr, &arp, |ip| if ip == target { Some(4242) } else { None });
        assert!(matches!(outcome, SapOutcome::ArpReplyLlid(4242)));
        assert_eq!(arp.resolve(target), Some(4242));
    }

    #[test]
    fn sndcp_rejects_unprovisioned_subscriber() {
        let pool = SndcpPool::new("10.10.1.1".parse().unwrap(), "10.10.1.2".parse().unwrap());
        let arp = ArpTable::new();
        let outcome = dispatch_sndcp(SndcpCtrl::ActTdsCtx, 1, None, false, &pool, &arp);
        assert!(matches!(outcome, SapOutcome::SndcpReject(SndcpError::SuNotProvisioned)));
    }
}
