//! SCSI pass-through over the Linux sg/bsg drivers.
//!
//! Requests are always prepared as a v4 (`struct sg_io_v4`) header. Whether
//! they are submitted as v4 depends on the device node: a bsg node, or an sg
//! node whose driver is at least 4.0.0, takes v4 directly; anything else
//! gets the header translated to the v3 `struct sg_io_hdr` and the results
//! copied back.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use thiserror::Error;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;

use super::{cdb_to_string, Completion, DataTransfer, PassThrough, CDB_LEN};

const SG_IO: libc::c_ulong = 0x2285;
const SG_GET_VERSION_NUM: libc::c_ulong = 0x2282;

const SCSI_GENERIC_MAJOR: u32 = 21;
// sg driver version at which the v4 interface appeared (4.0.0).
const SG_VER_V4_BASE: i32 = 40_000;

const SG_DXFER_TO_DEV: i32 = -2;
const SG_DXFER_FROM_DEV: i32 = -3;
const SG_DXFER_NONE: i32 = -1;

const SENSE_BUF_LEN: usize = 32;
const TIMEOUT_MS: u32 = 20_000;

#[derive(Debug, Error)]
pub enum PtError {
    #[error("opening {}: {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },
    #[error("stat on device node: {0}")]
    Stat(io::Error),
    #[error("SG_IO ioctl: {0}")]
    Ioctl(io::Error),
    #[error("SG_IO setup rejected: {0}")]
    BadParams(&'static str),
}

/// What the opened node supports, decided once at open time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub is_sg: bool,
    pub is_bsg: bool,
    /// sg driver version as major*10000 + minor*100 + rev; 0 if unknown.
    pub sg_version: i32,
}

impl Capabilities {
    pub fn prefer_v4(&self) -> bool {
        (self.is_sg && self.sg_version >= SG_VER_V4_BASE) || self.is_bsg
    }
}

/// `struct sg_io_v4` from <linux/bsg.h>.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SgIoV4 {
    pub guard: i32,
    pub protocol: u32,
    pub subprotocol: u32,
    pub request_len: u32,
    pub request: u64,
    pub request_tag: u64,
    pub request_attr: u32,
    pub request_priority: u32,
    pub request_extra: u32,
    pub max_response_len: u32,
    pub response: u64,
    pub dout_iovec_count: u32,
    pub dout_xfer_len: u32,
    pub din_iovec_count: u32,
    pub din_xfer_len: u32,
    pub dout_xferp: u64,
    pub din_xferp: u64,
    pub timeout: u32,
    pub flags: u32,
    pub usr_ptr: u64,
    pub spare_in: u32,
    pub driver_status: u32,
    pub transport_status: u32,
    pub device_status: u32,
    pub retry_delay: u32,
    pub info: u32,
    pub duration: u32,
    pub response_len: u32,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub generated_tag: u64,
    pub spare_out: u32,
    pub padding: u32,
}

/// `struct sg_io_hdr` from <scsi/sg.h>.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SgIoHdr {
    pub interface_id: i32,
    pub dxfer_direction: i32,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: u16,
    pub dxfer_len: u32,
    pub dxferp: u64,
    pub cmdp: u64,
    pub sbp: u64,
    pub timeout: u32,
    pub flags: u32,
    pub pack_id: i32,
    pub usr_ptr: u64,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: i32,
    pub duration: u32,
    pub info: u32,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        Self {
            interface_id: i32::from(b'S'),
            dxfer_direction: SG_DXFER_NONE,
            cmd_len: 0,
            mx_sb_len: 0,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: 0,
            cmdp: 0,
            sbp: 0,
            timeout: 0,
            flags: 0,
            pack_id: 0,
            usr_ptr: 0,
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }
}

/// Translate a prepared v4 header into a v3 one. Fails without touching
/// the device if the request is something v3 cannot carry.
pub(crate) fn v4_to_v3(io: &SgIoV4) -> Result<SgIoHdr, PtError> {
    if io.request == 0 {
        return Err(PtError::BadParams("no cdb given"));
    }
    let mut v3 = SgIoHdr {
        cmdp: io.request,
        cmd_len: io.request_len as u8,
        ..SgIoHdr::default()
    };
    if io.din_xfer_len > 0 {
        if io.dout_xfer_len > 0 {
            return Err(PtError::BadParams("sg v3 doesn't support bidi"));
        }
        v3.dxferp = io.din_xferp;
        v3.dxfer_len = io.din_xfer_len;
        v3.dxfer_direction = SG_DXFER_FROM_DEV;
    } else if io.dout_xfer_len > 0 {
        v3.dxferp = io.dout_xferp;
        v3.dxfer_len = io.dout_xfer_len;
        v3.dxfer_direction = SG_DXFER_TO_DEV;
    }
    if io.response != 0 && io.max_response_len > 0 {
        v3.sbp = io.response;
        v3.mx_sb_len = io.max_response_len as u8;
    }
    v3.pack_id = io.request_extra as i32;
    v3.timeout = io.timeout;
    Ok(v3)
}

/// Copy a completed v3 header's results back into the canonical v4 one.
pub(crate) fn v3_results_to_v4(v3: &SgIoHdr, io: &mut SgIoV4) {
    io.device_status = u32::from(v3.status);
    io.driver_status = u32::from(v3.driver_status);
    io.transport_status = u32::from(v3.host_status);
    io.response_len = u32::from(v3.sb_len_wr);
    io.duration = v3.duration;
    // v3 has one resid; hand it back on whichever side the data moved
    if io.dout_xfer_len > 0 {
        io.dout_resid = v3.resid;
    } else {
        io.din_resid = v3.resid;
    }
}

/// Parse the "Character devices" section of /proc/devices for the bsg
/// major. Parsing stops at the first line that isn't "major name".
pub(crate) fn parse_bsg_major<R: BufRead>(reader: R) -> Option<u32> {
    let mut lines = reader.lines().filter_map(Result::ok);
    lines.by_ref().find(|l| l.starts_with("Character"))?;
    for line in lines {
        let mut fields = line.split_whitespace();
        let major = match fields.next().and_then(|f| f.parse::<u32>().ok()) {
            Some(n) => n,
            None => break,
        };
        match fields.next() {
            Some(name) if name == "bsg" => return Some(major),
            Some(_) => {}
            None => break,
        }
    }
    None
}

fn bsg_char_major() -> Option<u32> {
    let f = File::open("/proc/devices").ok()?;
    parse_bsg_major(BufReader::new(f))
}

// Linux dev_t encoding.
fn dev_major(dev: u64) -> u32 {
    (((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)) as u32
}

pub struct SgDevice {
    file: File,
    caps: Capabilities,
}

impl SgDevice {
    /// Open `path` and probe what kind of pass-through node it is.
    pub fn open(path: &Path) -> Result<Self, PtError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| PtError::Open {
                path: path.to_owned(),
                source,
            })?;

        let meta = file.metadata().map_err(PtError::Stat)?;
        let mut caps = Capabilities::default();
        if meta.st_mode() & libc::S_IFMT == libc::S_IFCHR {
            let major = dev_major(meta.st_rdev());
            if major == SCSI_GENERIC_MAJOR {
                caps.is_sg = true;
            } else if Some(major) == bsg_char_major() {
                caps.is_bsg = true;
            }
        }
        if caps.is_sg {
            let mut version: libc::c_int = 0;
            // SAFETY: SG_GET_VERSION_NUM writes a single int for sg nodes.
            let ret = unsafe { ioctl_with_mut_ref(&file, SG_GET_VERSION_NUM, &mut version) };
            if ret >= 0 {
                caps.sg_version = version;
            }
        }
        debug!(
            "opened {}: is_sg={} is_bsg={} sg_version={}",
            path.display(),
            caps.is_sg,
            caps.is_bsg,
            caps.sg_version
        );
        Ok(Self { file, caps })
    }

    fn submit_v4(&mut self, io: &mut SgIoV4) -> Result<(), PtError> {
        // SAFETY: io and the buffers it points at outlive the ioctl.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, SG_IO, io) };
        if ret < 0 {
            return Err(PtError::Ioctl(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn submit_v3(&mut self, io: &mut SgIoV4) -> Result<(), PtError> {
        let mut v3 = v4_to_v3(io)?;
        // SAFETY: v3 and the buffers it points at outlive the ioctl.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, SG_IO, &mut v3) };
        if ret < 0 {
            return Err(PtError::Ioctl(io::Error::last_os_error()));
        }
        v3_results_to_v4(&v3, io);
        Ok(())
    }
}

impl PassThrough for SgDevice {
    fn execute(
        &mut self,
        cdb: &[u8; CDB_LEN],
        mut xfer: DataTransfer<'_>,
    ) -> Result<Completion, PtError> {
        let mut sense = [0_u8; SENSE_BUF_LEN];
        let mut io = SgIoV4 {
            guard: i32::from(b'Q'),
            request: cdb.as_ptr() as u64,
            request_len: CDB_LEN as u32,
            response: sense.as_mut_ptr() as u64,
            max_response_len: SENSE_BUF_LEN as u32,
            timeout: TIMEOUT_MS,
            ..SgIoV4::default()
        };
        match &mut xfer {
            DataTransfer::In(buf) => {
                io.din_xferp = buf.as_mut_ptr() as u64;
                io.din_xfer_len = buf.len() as u32;
            }
            DataTransfer::Out(buf) => {
                io.dout_xferp = buf.as_ptr() as u64;
                io.dout_xfer_len = buf.len() as u32;
            }
        }
        debug!("sending {}", cdb_to_string(cdb));

        if self.caps.prefer_v4() {
            self.submit_v4(&mut io)?;
        } else {
            self.submit_v3(&mut io)?;
        }

        let sense_len = (io.response_len as usize).min(SENSE_BUF_LEN);
        let completion = Completion {
            status: io.device_status as u8,
            host_status: io.transport_status as u16,
            driver_status: io.driver_status as u16,
            sense: sense[..sense_len].to_vec(),
            din_resid: io.din_resid,
            dout_resid: io.dout_resid,
            duration_ms: io.duration,
        };
        trace!(
            "completion: status=0x{:02x} {} duration={}ms",
            completion.status,
            transport_err_str(&completion),
            completion.duration_ms
        );
        Ok(completion)
    }
}

const HOST_BYTE_NAMES: &[&str] = &[
    "DID_OK",
    "DID_NO_CONNECT",
    "DID_BUS_BUSY",
    "DID_TIME_OUT",
    "DID_BAD_TARGET",
    "DID_ABORT",
    "DID_PARITY",
    "DID_ERROR",
    "DID_RESET",
    "DID_BAD_INTR",
    "DID_PASSTHROUGH",
    "DID_SOFT_ERROR",
    "DID_IMM_RETRY",
    "DID_REQUEUE",
    "DID_TRANSPORT_DISRUPTED",
    "DID_TRANSPORT_FAILFAST",
    "DID_TARGET_FAILURE",
    "DID_NEXUS_FAILURE (reservation conflict)",
    "DID_ALLOC_FAILURE",
    "DID_MEDIUM_ERROR",
];

const DRIVER_BYTE_NAMES: &[&str] = &[
    "DRIVER_OK",
    "DRIVER_BUSY",
    "DRIVER_SOFT",
    "DRIVER_MEDIA",
    "DRIVER_ERROR",
    "DRIVER_INVALID",
    "DRIVER_TIMEOUT",
    "DRIVER_HARD",
    "DRIVER_SENSE",
];

/// Host and driver bytes of a completion, with their kernel names.
pub fn transport_err_str(c: &Completion) -> String {
    let host = HOST_BYTE_NAMES
        .get(c.host_status as usize)
        .unwrap_or(&"invalid");
    let driver = DRIVER_BYTE_NAMES
        .get((c.driver_status & 0x0f) as usize)
        .unwrap_or(&"invalid");
    format!(
        "host_status=0x{:02x} [{}] driver_status=0x{:02x} [{}]",
        c.host_status, host, c.driver_status, driver
    )
}
