//! DMR call handler: data-sync terminator detection and per-slot call
//! status (spec §3, §4.6).

/// DMR data-sync magic identifying a voice/data terminator frame.
pub const DMR_DATA_SYNC_TERMINATOR: u8 = 0x0F;

/// DMR slot number, 1 or 2.
pub fn is_valid_slot(slot: u8) -> bool {
    slot == 1 || slot == 2
}

/// Minimal DMR frame header the handler needs to classify a frame before
/// handing it to [`super::drive_call_status`]: sync type and FLCO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmrFlco {
    GroupVoice,
    PrivateVoice,
}

pub fn is_terminator(sync_type: u8) -> bool {
    sync_type == DMR_DATA_SYNC_TERMINATOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_sync_is_recognised() {
        assert!(is_terminator(DMR_DATA_SYNC_TERMINATOR));
        assert!(!is_terminator(0x01));
    }

    #[test]
    fn slot_validation() {
        assert!(is_valid_slot(1));
        assert!(is_valid_slot(2));
        assert!(!is_valid_slot(3));
    }
}
