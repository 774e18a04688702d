//! Per-stream packet router: collision/takeover/priority, validation and
//! peer-permit rules, route rewrite, and batched fan-out (spec §4.3-§4.6).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::acl::{RidAcl, TalkgroupRules, TgRule};
use crate::affiliation::AffiliationTable;

/// Every this-many enqueued destinations, the fan-out queue is flushed to
/// the socket (spec §4.3).
pub const MAX_QUEUED_PEER_MSGS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Dmr,
    P25,
    Nxdn,
    Analog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub protocol: Protocol,
    pub dst_id: u32,
}

/// Per-destination, per-protocol call status (spec §3).
#[derive(Debug, Clone)]
pub struct CallStatus {
    pub call_start: Instant,
    pub last_packet: Instant,
    pub src_id: u32,
    pub peer_id: u32,
    pub ssrc: u32,
    pub stream_id: u32,
    pub active_call: bool,
    pub call_takeover: bool,
    pub slot: Option<u8>,
    pub dest_peer_id: Option<u32>,
}

impl CallStatus {
    fn begin(src_id: u32, peer_id: u32, ssrc: u32, stream_id: u32, slot: Option<u8>) -> Self {
        let now = Instant::now();
        CallStatus {
            call_start: now,
            last_packet: now,
            src_id,
            peer_id,
            ssrc,
            stream_id,
            active_call: true,
            call_takeover: false,
            slot,
            dest_peer_id: None,
        }
    }
}

/// Outcome of the collision/takeover/priority engine for one inbound frame
/// (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionOutcome {
    NewCall,
    SameCall,
    Takeover,
    SwitchOver,
    /// The arriving peer preempted the current owner; that peer must
    /// receive an In-Call Control `REJECT_TRAFFIC`.
    Preempt { preempted_peer_id: u32 },
    Reject,
    TerminatorEnd,
}

/// Inputs describing one inbound frame's call-relevant attributes.
pub struct FrameCallAttrs {
    pub src_id: u32,
    pub peer_id: u32,
    pub ssrc: u32,
    pub stream_id: u32,
    pub slot: Option<u8>,
    pub is_terminator: bool,
    pub switch_over: bool,
    pub in_call_control_takeover: bool,
    pub has_call_priority: bool,
    pub in_call_control_enabled: bool,
}

#[derive(Default)]
pub struct CallStatusTable {
    calls: parking_lot::Mutex<HashMap<CallKey, CallStatus>>,
    call_collision_timeout: Duration,
}

impl CallStatusTable {
    pub fn new(call_collision_timeout: Duration) -> Self {
        CallStatusTable { calls: parking_lot::Mutex::new(HashMap::new()), call_collision_timeout }
    }

    /// Snapshot a call's current owner/stream, if active.
    pub fn snapshot(&self, key: CallKey) -> Option<CallStatus> {
        self.calls.lock().get(&key).cloned()
    }

    /// Apply one inbound frame to the call-status table, producing the
    /// routing decision per spec §4.6.
    pub fn apply_frame(&self, key: CallKey, attrs: FrameCallAttrs) -> CollisionOutcome {
        let mut calls = self.calls.lock();

        if attrs.is_terminator {
            if let Some(status) = calls.get(&key) {
                if status.stream_id == attrs.stream_id || status.src_id == attrs.src_id {
                    calls.remove(&key);
                    return CollisionOutcome::TerminatorEnd;
                }
            }
            return CollisionOutcome::TerminatorEnd;
        }

        match calls.get_mut(&key) {
            None => {
                calls.insert(key, CallStatus::begin(attrs.src_id, attrs.peer_id, attrs.ssrc, attrs.stream_id, attrs.slot));
                CollisionOutcome::NewCall
            }
            Some(status) => {
                if status.stream_id == attrs.stream_id {
                    status.last_packet = Instant::now();
                    return CollisionOutcome::SameCall;
                }

                if attrs.switch_over || status.src_id == attrs.src_id {
                    status.src_id = attrs.src_id;
                    status.ssrc = attrs.ssrc;
                    status.stream_id = attrs.stream_id;
                    status.peer_id = attrs.peer_id;
                    status.last_packet = Instant::now();
                    return CollisionOutcome::SwitchOver;
                }

                if status.call_takeover {
                    status.src_id = attrs.src_id;
                    status.ssrc = attrs.ssrc;
                    status.stream_id = attrs.stream_id;
                    status.peer_id = attrs.peer_id;
                    status.call_takeover = false;
                    status.last_packet = Instant::now();
                    return CollisionOutcome::Takeover;
                }

                let elapsed = Instant::now().duration_since(status.last_packet);
                if elapsed > self.call_collision_timeout {
                    status.src_id = attrs.src_id;
                    status.ssrc = attrs.ssrc;
                    status.stream_id = attrs.stream_id;
                    status.peer_id = attrs.peer_id;
                    status.last_packet = Instant::now();
                    return CollisionOutcome::Takeover;
                }

                if attrs.has_call_priority && attrs.in_call_control_enabled {
                    let preempted = status.peer_id;
                    status.src_id = attrs.src_id;
                    status.ssrc = attrs.ssrc;
                    status.stream_id = attrs.stream_id;
                    status.peer_id = attrs.peer_id;
                    status.last_packet = Instant::now();
                    return CollisionOutcome::Preempt { preempted_peer_id: preempted };
                }

                CollisionOutcome::Reject
            }
        }
    }

    /// Flag the active call at `key` for takeover on the next differing
    /// stream, set by an inbound In-Call Control event.
    pub fn mark_takeover(&self, key: CallKey) {
        if let Some(status) = self.calls.lock().get_mut(&key) {
            status.call_takeover = true;
        }
    }
}

/// Validation failure reasons (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReject {
    DisabledSrcRid,
    RejectUnknownBadCall,
    DisabledDstRid,
    InvalidOrInactiveTg,
}

pub struct ValidationContext<'a> {
    pub rid_acl: &'a RidAcl,
    pub tg_rules: &'a TalkgroupRules,
    pub reject_unknown_rid: bool,
}

/// Per-stream, per-frame validation (spec §4.5 "Validation").
pub fn validate_frame(ctx: &ValidationContext, src_rid: u32, dst_is_private_call: bool, dst_rid: Option<u32>, tg_id: Option<u32>, peer_id: u32) -> Result<(), ValidationReject> {
    let mut bad_call = false;

    if let Some(entry) = ctx.rid_acl.lookup(src_rid) {
        if !entry.enabled {
            return Err(ValidationReject::DisabledSrcRid);
        }
    } else if ctx.reject_unknown_rid {
        // Marked, not enforced yet: the group-addressed path below is the
        // only one that acts on it, and only unless `alwaysSend` applies.
        bad_call = true;
    }

    if dst_is_private_call {
        if let Some(dst) = dst_rid {
            if !ctx.rid_acl.is_enabled(dst) {
                return Err(ValidationReject::DisabledDstRid);
            }
        }
        return Ok(());
    }

    if let Some(tg) = tg_id {
        match ctx.tg_rules.lookup(tg) {
            None => return Err(ValidationReject::InvalidOrInactiveTg),
            Some(rule) => {
                if !rule.active {
                    return Err(ValidationReject::InvalidOrInactiveTg);
                }
                if rule.always_send.contains(&peer_id) {
                    bad_call = false;
                } else if !rule.permitted_rids.is_empty() && !rule.permitted_rids.contains(&src_rid) {
                    bad_call = true;
                }
                if bad_call {
                    return Err(ValidationReject::RejectUnknownBadCall);
                }
            }
        }
    }
    Ok(())
}

/// Per-destination-peer, per-frame permit context (spec §4.5 "Peer-permit").
pub struct PermitContext<'a> {
    pub affiliations: &'a AffiliationTable,
    pub disallow_u2u: bool,
    pub drop_u2u_peer_table: &'a [u32],
    pub restrict_pv_call_to_reg_only: bool,
}

pub fn peer_permit_group(ctx: &PermitContext, rule: &TgRule, tg_id: u32, dest_peer_id: u32, dest_peer_is_replica: bool, dest_peer_is_conventional: bool, dest_peer_is_sysview: bool, from_upstream: bool) -> bool {
    if dest_peer_is_replica {
        return true;
    }
    if !rule.inclusion.is_empty() && !rule.inclusion.contains(&dest_peer_id) {
        return false;
    }
    if rule.exclusion.contains(&dest_peer_id) {
        return false;
    }
    if rule.always_send.contains(&dest_peer_id) {
        return true;
    }
    if rule.affiliation_required && !dest_peer_is_conventional && !dest_peer_is_sysview && !from_upstream {
        return ctx.affiliations.has_group_affiliation(dest_peer_id, tg_id);
    }
    true
}

pub fn peer_permit_private(ctx: &PermitContext, dest_peer_id: u32, dest_rid: u32) -> bool {
    if ctx.disallow_u2u || ctx.drop_u2u_peer_table.contains(&dest_peer_id) {
        return false;
    }
    if ctx.restrict_pv_call_to_reg_only {
        return ctx.affiliations.peer_for_unit_registration(dest_rid) == Some(dest_peer_id);
    }
    true
}

/// Outbound route-rewrite: replace the destination TGID in the frame with
/// the rewrite target declared for `peer_id`, if any (spec §4.4).
pub fn rewrite_outbound_tg(rule: Option<&TgRule>, peer_id: u32, tg_id: u32) -> u32 {
    rule.and_then(|r| r.outbound_rewrite_for(peer_id)).unwrap_or(tg_id)
}

/// Inbound route-rewrite: replace the destination with the canonical
/// source TGID (spec §4.4).
pub fn rewrite_inbound_tg(rule: Option<&TgRule>, peer_id: u32, canonical_tg_id: u32) -> u32 {
    rule.and_then(|r| r.inbound_canonical_for(peer_id, canonical_tg_id)).unwrap_or(canonical_tg_id)
}

/// Batches outbound `(addr, bytes)` fan-out, flushing every
/// [`MAX_QUEUED_PEER_MSGS`] enqueued destinations.
pub struct FanOutBatcher<'a, F: FnMut(&[(SocketAddr, Vec<u8>)])> {
    queue: Vec<(SocketAddr, Vec<u8>)>,
    flush: F,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a, F: FnMut(&[(SocketAddr, Vec<u8>)])> FanOutBatcher<'a, F> {
    pub fn new(flush: F) -> Self {
        FanOutBatcher { queue: Vec::with_capacity(MAX_QUEUED_PEER_MSGS), flush, _marker: std::marker::PhantomData }
    }

    pub fn enqueue(&mut self, addr: SocketAddr, bytes: Vec<u8>) {
        self.queue.push((addr, bytes));
        if self.queue.len() >= MAX_QUEUED_PEER_MSGS {
            self.flush_now();
        }
    }

    pub fn flush_now(&mut self) {
        if !self.queue.is_empty() {
            (self.flush)(&self.queue);
            self.queue.clear();
        }
    }
}

impl<'a, F: FnMut(&[(SocketAddr, Vec<u8>)])> Drop for FanOutBatcher<'a, F> {
    fn drop(&mut self) {
        self.flush_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(src_id: u32, peer_id: u32, stream_id: u32) -> FrameCallAttrs {
        FrameCallAttrs {
            src_id,
            peer_id,
            ssrc: peer_id,
            stream_id,
            slot: None,
            is_terminator: false,
            switch_over: false,
            in_call_control_takeover: false,
            has_call_priority: false,
            in_call_control_enabled: true,
        }
    }

    #[test]
    fn second_concurrent_stream_is_rejected() {
        let table = CallStatusTable::new(Duration::from_secs(2));
        let key = CallKey { protocol: Protocol::P25, dst_id: 1000 };
        assert_eq!(table.apply_frame(key, attrs(100, 1, 0xAAAA)), CollisionOutcome::NewCall);
        assert_eq!(table.apply_frame(key, attrs(200, 2, 0xBBBB)), CollisionOutcome::Reject);
    }

    #[test]
    fn priority_peer_preempts_current_owner() {
        let table = CallStatusTable::new(Duration::from_secs(2));
        let key = CallKey { protocol: Protocol::P25, dst_id: 1000 };
        table.apply_frame(key, attrs(100, 1, 0xAAAA));
        let mut b = attrs(200, 2, 0xBBBB);
        b.has_call_priority = true;
        match table.apply_frame(key, b) {
            CollisionOutcome::Preempt { preempted_peer_id } => assert_eq!(preempted_peer_id, 1),
            other => panic!("expected preempt, got {other:?}"),
        }
    }

    #[test]
    fn explicit_takeover_flag_overwrites_owner() {
        let table = CallStatusTable::new(Duration::from_secs(2));
        let key = CallKey { protocol: Protocol::P25, dst_id: 1000 };
        table.apply_frame(key, attrs(100, 1, 0xAAAA));
        table.mark_takeover(key);
        assert_eq!(table.apply_frame(key, attrs(200, 2, 0xBBBB)), CollisionOutcome::Takeover);
    }

    #[test]
    fn fan_out_flushes_every_five() {
        let flushed = std::cell::RefCell::new(0usize);
        {
            let mut batcher = FanOutBatcher::new(|batch| *flushed.borrow_mut() += batch.len());
            for i in 0..12u16 {
                batcher.enqueue("127.0.0.1:0".parse().unwrap(), vec![i as u8]);
            }
        }
        assert_eq!(*flushed.borrow(), 12);
    }
}
