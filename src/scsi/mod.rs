pub mod pt;
pub mod sense;

use std::fmt::Write as _;

/// All the vendor commands use 10-byte CDBs.
pub const CDB_LEN: usize = 10;
/// Largest single transfer any of them needs (one handy-store block).
pub const MAX_XFER: usize = 512;

pub const SAM_STAT_GOOD: u8 = 0x00;
pub const SAM_STAT_CHECK_CONDITION: u8 = 0x02;
pub const SAM_STAT_RESERVATION_CONFLICT: u8 = 0x18;
pub const SAM_STAT_COMMAND_TERMINATED: u8 = 0x22; // obsolete in SAM-3

pub const SK_NO_SENSE: u8 = 0x0;
pub const SK_RECOVERED_ERROR: u8 = 0x1;
pub const SK_NOT_READY: u8 = 0x2;
pub const SK_MEDIUM_ERROR: u8 = 0x3;
pub const SK_HARDWARE_ERROR: u8 = 0x4;
pub const SK_ILLEGAL_REQUEST: u8 = 0x5;
pub const SK_UNIT_ATTENTION: u8 = 0x6;
pub const SK_DATA_PROTECT: u8 = 0x7;
pub const SK_BLANK_CHECK: u8 = 0x8;
pub const SK_COPY_ABORTED: u8 = 0xa;
pub const SK_ABORTED_COMMAND: u8 = 0xb;
pub const SK_MISCOMPARE: u8 = 0xe;

/// Outcome of a completed command, after folding together the SCSI status,
/// the transport-level status bytes and any sense data.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Category {
    Good,
    NoSense,
    RecoveredError,
    NotReady,
    MediumHard,
    IllegalRequest,
    InvalidOpcode,
    OutOfRange,
    UnitAttention,
    DataProtect,
    Protection,
    AbortedCommand,
    CopyAborted,
    Miscompare,
    ReservationConflict,
    /// Sense data present but not in one of the recognized shapes.
    Sense,
    Timeout,
    /// Host adapter or driver reported a failure.
    Transport,
    Other,
}

impl Category {
    /// Process exit code for this outcome, following the sg3_utils
    /// convention so scripts can tell failure classes apart.
    pub fn exit_code(self) -> i32 {
        match self {
            Category::Good | Category::NoSense | Category::RecoveredError => 0,
            Category::NotReady => 2,
            Category::MediumHard => 3,
            Category::IllegalRequest => 5,
            Category::InvalidOpcode => 9,
            Category::ReservationConflict => 24,
            Category::Timeout => 33,
            _ => 99,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::Good => "good",
            Category::NoSense => "no sense",
            Category::RecoveredError => "recovered error",
            Category::NotReady => "not ready",
            Category::MediumHard => "medium or hardware error",
            Category::IllegalRequest => "illegal request",
            Category::InvalidOpcode => "invalid operation code",
            Category::OutOfRange => "logical block address out of range",
            Category::UnitAttention => "unit attention",
            Category::DataProtect => "data protect",
            Category::Protection => "protection information error",
            Category::AbortedCommand => "aborted command",
            Category::CopyAborted => "copy aborted",
            Category::Miscompare => "miscompare",
            Category::ReservationConflict => "reservation conflict",
            Category::Sense => "sense data",
            Category::Timeout => "timeout",
            Category::Transport => "transport error",
            Category::Other => "unexpected status",
        }
    }
}

/// Direction and buffer for a command's data phase. The vendor protocol has
/// no bidirectional commands, and this makes them unrepresentable.
pub enum DataTransfer<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Raw completion of one pass-through command, as reported by the kernel.
#[derive(Debug, Default, Clone)]
pub struct Completion {
    pub status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub sense: Vec<u8>,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub duration_ms: u32,
}

// Linux host/driver byte values we act on.
const DID_TIME_OUT: u16 = 0x03;
const DRIVER_MASK: u16 = 0x0f;
const DRIVER_SENSE: u16 = 0x08;

impl Completion {
    /// Classify this completion. Ordering matters: a host-level failure
    /// invalidates the status byte, and a CHECK CONDITION invalidates
    /// anything a stale status might suggest.
    pub fn category(&self) -> Category {
        let dr_st = self.driver_status & DRIVER_MASK;
        let scsi_st = self.status & 0x7e;
        if self.host_status != 0 {
            if self.host_status == DID_TIME_OUT {
                Category::Timeout
            } else {
                Category::Transport
            }
        } else if dr_st != 0 && dr_st != DRIVER_SENSE {
            Category::Transport
        } else if dr_st == DRIVER_SENSE
            || scsi_st == SAM_STAT_CHECK_CONDITION
            || scsi_st == SAM_STAT_COMMAND_TERMINATED
        {
            sense::category(&self.sense)
        } else if scsi_st != SAM_STAT_GOOD {
            if scsi_st == SAM_STAT_RESERVATION_CONFLICT {
                Category::ReservationConflict
            } else {
                Category::Other
            }
        } else {
            Category::Good
        }
    }
}

/// The seam between the security engine and the kernel: anything that can
/// ship a CDB plus one data buffer and report how it completed.
pub trait PassThrough {
    fn execute(
        &mut self,
        cdb: &[u8; CDB_LEN],
        xfer: DataTransfer<'_>,
    ) -> Result<Completion, pt::PtError>;
}

// (opcode, cdb[1]) -> name, for log lines. Linear search is fine at this
// size.
const COMMAND_NAMES: &[((u8, u8), &str)] = &[
    ((0xc0, 0x45), "GET ENCRYPTION STATUS"),
    ((0xc1, 0xe1), "UNLOCK"),
    ((0xc1, 0xe2), "CHANGE PASSWORD"),
    ((0xc1, 0xe3), "SECURE ERASE"),
    ((0xd8, 0x00), "READ HANDY STORE"),
    ((0xda, 0x00), "WRITE HANDY STORE"),
];

pub fn command_name(cdb: &[u8]) -> &'static str {
    if cdb.len() < 2 {
        return "(short cdb)";
    }
    COMMAND_NAMES
        .iter()
        .find(|(key, _)| *key == (cdb[0], cdb[1]))
        .map_or("(vendor specific)", |(_, name)| name)
}

pub fn cdb_to_string(cdb: &[u8]) -> String {
    let mut s = String::from(command_name(cdb));
    s.push_str(" [");
    for (i, b) in cdb.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        let _ = write!(s, "{:02x}", b);
    }
    s.push(']');
    s
}
