//! Multi-protocol call handlers: per-protocol stream lifecycle sitting on
//! top of the router core, plus parrot record/playback shared across DMR,
//! P25 and analog (spec §4.3, §4.6).

pub mod analog;
pub mod dmr;
pub mod p25;
pub mod packetdata;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::acl::TalkgroupRules;
use crate::router::{CallKey, CallStatusTable, CollisionOutcome, FrameCallAttrs, Protocol};

/// One recorded frame for parrot playback, with its original arrival
/// spacing preserved via `recorded_at`.
#[derive(Debug, Clone)]
pub struct ParrotFrame {
    pub recorded_at: Instant,
    pub src_id: u32,
    pub payload: Vec<u8>,
}

/// Per-TGID parrot recording buffer. A recording is opened on the first
/// frame of a parrot-tagged call and closed (queued for playback) on the
/// terminator (spec §4.6 "Parrot").
#[derive(Default)]
pub struct ParrotRecorder {
    active: parking_lot::Mutex<HashMap<(Protocol, u32), VecDeque<ParrotFrame>>>,
}

impl ParrotRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, protocol: Protocol, tg_id: u32, src_id: u32, payload: Vec<u8>) {
        let mut active = self.active.lock();
        active.entry((protocol, tg_id)).or_default().push_back(ParrotFrame { recorded_at: Instant::now(), src_id, payload });
    }

    /// Take ownership of the recorded frames for `tg_id`, leaving the slot
    /// empty for the next recording.
    pub fn take(&self, protocol: Protocol, tg_id: u32) -> Vec<ParrotFrame> {
        self.active.lock().remove(&(protocol, tg_id)).map(|d| d.into_iter().collect()).unwrap_or_default()
    }
}

/// Inter-packet pacing used during parrot playback and buffered ACL
/// transmission (spec §4.6, §5).
pub fn playback_pacing(protocol: Protocol) -> Duration {
    match protocol {
        Protocol::P25 => Duration::from_millis(180),
        _ => Duration::from_millis(60),
    }
}

/// One inbound protocol frame's call-relevant attributes, shared across
/// the three protocol handlers.
pub struct StreamFrame {
    pub protocol: Protocol,
    pub dst_id: u32,
    pub src_id: u32,
    pub peer_id: u32,
    pub peer_addr: SocketAddr,
    pub ssrc: u32,
    pub stream_id: u32,
    pub slot: Option<u8>,
    pub is_terminator: bool,
    pub switch_over: bool,
    pub has_call_priority: bool,
    pub in_call_control_enabled: bool,
    pub is_private_call: bool,
    pub payload: Vec<u8>,
}

/// The result of running one frame through the shared call-status/parrot
/// pipeline, before route-rewrite and peer-permit are applied by the
/// router for fan-out (spec §4.3 steps 1-5).
pub enum HandlerDecision {
    Forward,
    Reject,
    /// The previous owner (`preempted_peer_id`) must receive an In-Call
    /// Control `REJECT_TRAFFIC`.
    Preempt { preempted_peer_id: u32 },
    /// A parrot-tagged call just ended; `frames` is ready for playback.
    PlaybackReady { frames: Vec<ParrotFrame> },
}

/// Run one frame through call-status update and parrot recording, common
/// to all three protocol handlers (spec §4.3 steps 4-5, §4.6).
pub fn drive_call_status(calls: &CallStatusTable, parrot: &ParrotRecorder, tg_rules: &TalkgroupRules, frame: &StreamFrame) -> HandlerDecision {
    let key = CallKey { protocol: frame.protocol, dst_id: frame.dst_id };
    let attrs = FrameCallAttrs {
        src_id: frame.src_id,
        peer_id: frame.peer_id,
        ssrc: frame.ssrc,
        stream_id: frame.stream_id,
        slot: frame.slot,
        is_terminator: frame.is_terminator,
        switch_over: frame.switch_over,
        in_call_control_takeover: false,
        has_call_priority: frame.has_call_priority,
        in_call_control_enabled: frame.in_call_control_enabled,
    };
    let outcome = calls.apply_frame(key, attrs);

    let is_parrot = !frame.is_private_call && tg_rules.lookup(frame.dst_id).map(|r| r.parrot).unwrap_or(false);
    let parrot_only_originating = tg_rules.lookup(frame.dst_id).map(|r| r.parrot_only_originating).unwrap_or(false);

    if is_parrot && !frame.is_terminator && matches!(outcome, CollisionOutcome::NewCall | CollisionOutcome::SameCall | CollisionOutcome::SwitchOver | CollisionOutcome::Takeover) {
        parrot.record(frame.protocol, frame.dst_id, frame.src_id, frame.payload.clone());
    }

    match outcome {
        CollisionOutcome::Reject => HandlerDecision::Reject,
        CollisionOutcome::Preempt { preempted_peer_id } => HandlerDecision::Preempt { preempted_peer_id },
        CollisionOutcome::TerminatorEnd if is_parrot => {
            let frames = parrot.take(frame.protocol, frame.dst_id);
            if parrot_only_originating && frames.is_empty() {
                HandlerDecision::Forward
            } else {
                HandlerDecision::PlaybackReady { frames }
            }
        }
        _ => HandlerDecision::Forward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::TgRule;
    use std::time::Duration;

    fn frame(dst_id: u32, src_id: u32, stream_id: u32, is_terminator: bool) -> StreamFrame {
        StreamFrame {
            protocol: Protocol::Dmr,
            dst_id,
            src_id,
            peer_id: src_id,
            peer_addr: "127.0.0.1:5000".parse().unwrap(),
            ssrc: src_id,
            stream_id,
            slot: Some(1),
            is_terminator,
            switch_over: false,
            has_call_priority: false,
            in_call_control_enabled: true,
            is_private_call: false,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn parrot_call_buffers_then_plays_back_on_terminator() {
        let calls = CallStatusTable::new(Duration::from_secs(2));
        let parrot = ParrotRecorder::new();
        let mut rules = TalkgroupRules::new();
        rules.insert(9000, TgRule { active: true, parrot: true, ..Default::default() });

        drive_call_status(&calls, &parrot, &rules, &frame(9000, 100, 1, false));
        match drive_call_status(&calls, &parrot, &rules, &frame(9000, 100, 1, true)) {
            HandlerDecision::PlaybackReady { frames } => assert_eq!(frames.len(), 1),
            _ => panic!("expected playback ready"),
        }
    }

    #[test]
    fn non_parrot_terminator_just_forwards() {
        let calls = CallStatusTable::new(Duration::from_secs(2));
        let parrot = ParrotRecorder::new();
        let rules = TalkgroupRules::new();
        drive_call_status(&calls, &parrot, &rules, &frame(9001, 100, 1, false));
        assert!(matches!(drive_call_status(&calls, &parrot, &rules, &frame(9001, 100, 1, true)), HandlerDecision::Forward));
    }
}
