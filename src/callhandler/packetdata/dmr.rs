//! DMR packet-data wiring. Spec §4.7 names only the P25 SAP table
//! explicitly; DMR data calls feed the same [`super::PduAssembler`],
//! [`super::ArpTable`] and [`super::SndcpPool`] used by the P25 side,
//! distinguished only by the DMR data-header's response-requested bit
//! standing in for P25's confirmed/unconfirmed format.

use super::PduFormat;

/// DMR data-header "response requested" bit, mapped onto the shared
/// [`PduFormat`] the assembler/ARQ logic already understands.
pub fn format_from_response_requested(response_requested: bool) -> PduFormat {
    if response_requested { PduFormat::Confirmed } else { PduFormat::Unconfirmed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_requested_maps_to_confirmed() {
        assert_eq!(format_from_response_requested(true), PduFormat::Confirmed);
        assert_eq!(format_from_response_requested(false), PduFormat::Unconfirmed);
    }
}
