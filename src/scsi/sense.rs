//! Decoding of SCSI sense buffers, both the fixed (0x70/0x71) and
//! descriptor (0x72/0x73) formats.

use super::{
    Category, SK_ABORTED_COMMAND, SK_BLANK_CHECK, SK_COPY_ABORTED, SK_DATA_PROTECT,
    SK_HARDWARE_ERROR, SK_ILLEGAL_REQUEST, SK_MEDIUM_ERROR, SK_MISCOMPARE, SK_NOT_READY,
    SK_NO_SENSE, SK_RECOVERED_ERROR, SK_UNIT_ATTENTION,
};

/// The fields common to both sense formats, pulled out of the raw buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenseHeader {
    pub response_code: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub additional_length: u8,
    pub sdat_ovfl: bool,
}

impl SenseHeader {
    /// Decode `sb` into its common fields. Returns `None` when the buffer is
    /// empty or the response code is not one of 0x70..=0x73 (after masking
    /// off the vendor bit). Fields beyond the end of a short buffer read as
    /// zero.
    pub fn normalize(sb: &[u8]) -> Option<SenseHeader> {
        let response_code = 0x7f & *sb.first()?;
        if !(0x70..=0x73).contains(&response_code) {
            return None;
        }
        let at = |i: usize| sb.get(i).copied().unwrap_or(0);

        let mut h = SenseHeader {
            response_code,
            ..SenseHeader::default()
        };
        if response_code >= 0x72 {
            // descriptor format
            h.sense_key = 0xf & at(1);
            h.asc = at(2);
            h.ascq = at(3);
            h.additional_length = at(7);
            h.sdat_ovfl = at(4) & 0x80 != 0;
        } else {
            // fixed format; the additional-length byte bounds where the
            // ASC/ASCQ may validly sit
            h.sense_key = 0xf & at(2);
            h.sdat_ovfl = at(2) & 0x10 != 0;
            h.additional_length = at(7);
            if sb.len() > 7 {
                let eff_len = sb.len().min(usize::from(sb[7]) + 8);
                if eff_len > 12 {
                    h.asc = sb[12];
                }
                if eff_len > 13 {
                    h.ascq = sb[13];
                }
            }
        }
        Some(h)
    }
}

/// Find the first descriptor of `desc_type` in a descriptor-format sense
/// buffer. Descriptors are `[type, additional_len, payload...]`, packed
/// from offset 8.
pub fn descriptor_find(sb: &[u8], desc_type: u8) -> Option<&[u8]> {
    if sb.len() < 8 || sb[7] == 0 {
        return None;
    }
    if !(0x72..=0x73).contains(&(sb[0] & 0x7f)) {
        return None;
    }
    let add_len = usize::from(sb[7]).min(sb.len() - 8);
    let mut k = 0;
    while k < add_len {
        let descp = &sb[8 + k..];
        if descp[0] == desc_type {
            return Some(descp);
        }
        if k + 1 >= add_len {
            // truncated descriptor
            return None;
        }
        k += usize::from(descp[1]) + 2;
    }
    None
}

/// Progress field (0..=0xffff, scale by 100/65536 for percent), available
/// when the device reports an operation in progress.
pub fn progress_indication(sb: &[u8]) -> Option<u16> {
    if sb.len() < 7 {
        return None;
    }
    match sb[0] & 0x7f {
        0x70 | 0x71 => {
            let sk = sb[2] & 0xf;
            if sb.len() < 18 || (sk != SK_NO_SENSE && sk != SK_NOT_READY) {
                return None;
            }
            if sb[15] & 0x80 != 0 {
                // SKSV set
                Some(u16::from_be_bytes([sb[16], sb[17]]))
            } else {
                None
            }
        }
        0x72 | 0x73 => {
            let sk = sb[1] & 0xf;
            let sk_pr = sk == SK_NO_SENSE || sk == SK_NOT_READY;
            if sk_pr {
                if let Some(bp) = descriptor_find(sb, 0x2) {
                    if bp.len() >= 7 && bp[1] == 0x6 && bp[4] & 0x80 != 0 {
                        return Some(u16::from_be_bytes([bp[5], bp[6]]));
                    }
                }
            }
            match descriptor_find(sb, 0xa) {
                Some(bp) if bp.len() >= 8 && bp[1] == 0x6 => {
                    Some(u16::from_be_bytes([bp[6], bp[7]]))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Map a sense buffer to a result category. Undecodable buffers and the
/// rarer sense keys collapse to `Category::Sense`.
pub fn category(sb: &[u8]) -> Category {
    let h = match SenseHeader::normalize(sb) {
        Some(h) if sb.len() > 2 => h,
        _ => return Category::Sense,
    };
    match h.sense_key {
        SK_NO_SENSE => Category::NoSense,
        SK_RECOVERED_ERROR => Category::RecoveredError,
        SK_NOT_READY => Category::NotReady,
        SK_MEDIUM_ERROR | SK_HARDWARE_ERROR | SK_BLANK_CHECK => Category::MediumHard,
        SK_UNIT_ATTENTION => Category::UnitAttention,
        SK_ILLEGAL_REQUEST => match (h.asc, h.ascq) {
            (0x20, 0x00) => Category::InvalidOpcode,
            (0x21, 0x00) => Category::OutOfRange,
            _ => Category::IllegalRequest,
        },
        SK_ABORTED_COMMAND => {
            if h.asc == 0x10 {
                Category::Protection
            } else {
                Category::AbortedCommand
            }
        }
        SK_MISCOMPARE => Category::Miscompare,
        SK_DATA_PROTECT => Category::DataProtect,
        SK_COPY_ABORTED => Category::CopyAborted,
        _ => Category::Sense,
    }
}
