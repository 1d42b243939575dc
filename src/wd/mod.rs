//! The Western Digital Passport security protocol: vendor-specific commands
//! for querying lock state, unlocking, password management and secure erase,
//! plus the "handy store" pages holding the salt, hint and label.

mod tests;

use log::debug;
use num_enum::FromPrimitive;
use rand::{thread_rng, Rng};
use thiserror::Error;

use crate::scsi::pt::{transport_err_str, PtError};
use crate::scsi::{sense, Category, Completion, DataTransfer, PassThrough, CDB_LEN, MAX_XFER};
use crate::sha256::{sha256, DIGEST_LEN};

const STATUS_LEN: usize = 48;
const STATUS_SIGNATURE: u8 = 0x45;
const PAGE_LEN: usize = MAX_XFER;

pub const MAX_PASSWORD_CHARS: usize = 64;
pub const MAX_HINT_CHARS: usize = 101;
pub const MAX_LABEL_CHARS: usize = 32;

// We generate 1..=8; WD's own tools have used up to 1000. Anything far
// beyond that is a corrupt record, not a derivation parameter.
const MAX_ITERATIONS: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum WdError {
    #[error(transparent)]
    Transport(#[from] PtError),
    #[error("{name} failed: {}", .category.description())]
    Device {
        name: &'static str,
        category: Category,
    },
    #[error("device did not return a usable encryption status page")]
    StatusUnavailable,
    #[error("device reports password block length {0}, expected 16 to 32")]
    BadPasswordLength(u16),
    #[error("handy store page {0} is missing or corrupt")]
    HandyStore(u8),
    #[error("salt record carries hash iteration count {0}, expected 1 to 1000000")]
    BadIterationCount(u32),
    #[error("drive must be {required} for this operation, but is {}", .actual.describe())]
    WrongState {
        required: &'static str,
        actual: SecurityStatus,
    },
}

impl WdError {
    /// Exit-code category carried by this error, if any.
    pub fn category(&self) -> Option<Category> {
        match self {
            WdError::Device { category, .. } => Some(*category),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SecurityStatus {
    NoLock = 0x00,
    Locked = 0x01,
    Unlocked = 0x02,
    UnlockBlocked = 0x06,
    NoKeys = 0x07,
    #[num_enum(default)]
    Unknown = 0xff,
}

impl SecurityStatus {
    pub fn describe(self) -> &'static str {
        match self {
            SecurityStatus::NoLock => "not locked",
            SecurityStatus::Locked => "locked",
            SecurityStatus::Unlocked => "unlocked",
            SecurityStatus::UnlockBlocked => "locked, unlock blocked",
            SecurityStatus::NoKeys => "no keys",
            SecurityStatus::Unknown => "unknown",
        }
    }
}

pub fn cipher_str(cipher_id: u8) -> String {
    match cipher_id {
        0x10 => "AES_128_ECB".to_string(),
        0x12 => "AES_128_CBC".to_string(),
        0x18 => "AES_128_XTS".to_string(),
        0x20 => "AES_256_ECB".to_string(),
        0x22 => "AES_256_CBC".to_string(),
        0x28 => "AES_256_XTS".to_string(),
        0x30 => "Full Disk Encryption".to_string(),
        other => format!("Unknown ({:02X})", other),
    }
}

/// Decoded GET ENCRYPTION STATUS reply.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionStatus {
    pub security: SecurityStatus,
    pub cipher_id: u8,
    /// Length in bytes of the password blocks the drive expects.
    pub password_block_len: u16,
    pub key_reset_enabler: u32,
}

impl EncryptionStatus {
    /// Fail with `WrongState` unless the drive is in `required`. Callers
    /// that are about to prompt or write check this up front, before any
    /// handy store traffic.
    pub fn require(
        &self,
        required: SecurityStatus,
        required_str: &'static str,
    ) -> Result<(), WdError> {
        if self.security == required {
            Ok(())
        } else {
            Err(WdError::WrongState {
                required: required_str,
                actual: self.security,
            })
        }
    }

    /// The password block length, validated against the range every known
    /// drive uses. A value outside it means the status page can't be
    /// trusted for keying material.
    fn checked_password_len(&self) -> Result<usize, WdError> {
        if (16..=32).contains(&self.password_block_len) {
            Ok(usize::from(self.password_block_len))
        } else {
            Err(WdError::BadPasswordLength(self.password_block_len))
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum PasswordAction {
    Change = 0,
    Set = 1,
    Disable = 16,
}

fn vendor_cdb(opcode: u8, sub: u8) -> [u8; CDB_LEN] {
    let mut cdb = [0_u8; CDB_LEN];
    cdb[0] = opcode;
    cdb[1] = sub;
    cdb
}

fn put_be16(buf: &mut [u8], val: u16) {
    buf[..2].copy_from_slice(&val.to_be_bytes());
}

fn put_be32(buf: &mut [u8], val: u32) {
    buf[..4].copy_from_slice(&val.to_be_bytes());
}

fn get_be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn get_be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Derive the password block the drive expects: the 8 raw salt bytes
/// followed by the password widened to UCS-2, hashed, then the raw digest
/// re-hashed until `iterations` hashes have been applied in total.
pub fn derive_password_block(
    salt: &[u8; 8],
    password: &str,
    iterations: u32,
    block_len: usize,
) -> Vec<u8> {
    let mut buf = [0_u8; 8 + 2 * MAX_PASSWORD_CHARS];
    buf[..8].copy_from_slice(salt);
    let mut len = 8;
    for &b in password.as_bytes().iter().take(MAX_PASSWORD_CHARS) {
        if b < b' ' {
            break;
        }
        buf[len] = b;
        len += 2;
    }

    let mut digest = [0_u8; DIGEST_LEN];
    for _ in 0..iterations {
        digest = sha256(&buf[..len]);
        buf[..DIGEST_LEN].copy_from_slice(&digest);
        len = DIGEST_LEN;
    }
    digest[..block_len].to_vec()
}

/// Read characters stored as little-endian-ish UCS-2 (low byte meaningful,
/// high byte dropped), two bytes per character, NUL terminated.
fn decode_ucs2(page: &[u8], offset: usize, max_chars: usize) -> String {
    let mut out = String::new();
    for i in 0..max_chars {
        let b = page[offset + 2 * i];
        if b == 0 {
            break;
        }
        out.push(char::from(b));
    }
    out
}

/// Iteration count and raw salt bytes from a validated page 1. A checksum
/// can be valid around a nonsense iteration count, so that is range-checked
/// here rather than trusted.
fn parse_password_params(page: &[u8]) -> Result<(u32, [u8; 8]), WdError> {
    let iterations = get_be32(&page[8..]);
    if !(1..=MAX_ITERATIONS).contains(&iterations) {
        return Err(WdError::BadIterationCount(iterations));
    }
    let mut salt = [0_u8; 8];
    salt.copy_from_slice(&page[12..20]);
    Ok((iterations, salt))
}

fn encode_ucs2(page: &mut [u8], offset: usize, max_chars: usize, text: &str) {
    for (i, &b) in text.as_bytes().iter().take(max_chars).enumerate() {
        if b < b' ' {
            break;
        }
        page[offset + 2 * i] = b;
    }
}

/// A WD Passport drive, driven over any pass-through transport.
pub struct Passport<T: PassThrough> {
    pt: T,
}

impl<T: PassThrough> Passport<T> {
    pub fn new(pt: T) -> Self {
        Self { pt }
    }

    fn command(
        &mut self,
        name: &'static str,
        cdb: &[u8; CDB_LEN],
        xfer: DataTransfer<'_>,
    ) -> Result<Completion, WdError> {
        let completion = self.pt.execute(cdb, xfer)?;
        match completion.category() {
            Category::Good => Ok(completion),
            // the command completed; the drive just had something to say
            Category::NoSense | Category::RecoveredError => {
                debug!("{}: {}", name, transport_err_str(&completion));
                Ok(completion)
            }
            category => {
                debug!("{}: {}", name, transport_err_str(&completion));
                if let Some(progress) = sense::progress_indication(&completion.sense) {
                    debug!(
                        "{}: operation in progress, {}% done",
                        name,
                        u32::from(progress) * 100 / 65536
                    );
                }
                Err(WdError::Device { name, category })
            }
        }
    }

    /// GET ENCRYPTION STATUS. Always hits the device; state-changing
    /// operations call this themselves rather than trusting earlier
    /// replies.
    pub fn encryption_status(&mut self) -> Result<EncryptionStatus, WdError> {
        let mut reply = [0_u8; STATUS_LEN];
        let mut cdb = vendor_cdb(0xc0, 0x45);
        put_be16(&mut cdb[7..], STATUS_LEN as u16);
        self.command(
            "GET ENCRYPTION STATUS",
            &cdb,
            DataTransfer::In(&mut reply),
        )?;
        if reply[0] != STATUS_SIGNATURE {
            return Err(WdError::StatusUnavailable);
        }
        Ok(EncryptionStatus {
            security: SecurityStatus::from(reply[3]),
            cipher_id: reply[4],
            password_block_len: get_be16(&reply[6..]),
            key_reset_enabler: get_be32(&reply[8..]),
        })
    }

    fn require_state(
        &mut self,
        required: SecurityStatus,
        required_str: &'static str,
    ) -> Result<EncryptionStatus, WdError> {
        let status = self.encryption_status()?;
        status.require(required, required_str)?;
        Ok(status)
    }

    /// Read one handy store page. `Ok(None)` means the device answered but
    /// the page doesn't carry a valid WD record (bad tag or checksum).
    fn read_page(&mut self, page: u8) -> Result<Option<[u8; PAGE_LEN]>, WdError> {
        let mut reply = [0_u8; PAGE_LEN];
        let mut cdb = vendor_cdb(0xd8, 0x00);
        put_be32(&mut cdb[2..], u32::from(page));
        put_be16(&mut cdb[7..], 1); // one 512-byte block
        self.command("READ HANDY STORE", &cdb, DataTransfer::In(&mut reply))?;

        let tag_ok = reply[0] == 0 && reply[1] == page && reply[2] == b'W' && reply[3] == b'D';
        let sum = reply.iter().fold(0_u8, |acc, &b| acc.wrapping_add(b));
        if tag_ok && sum == 0 {
            Ok(Some(reply))
        } else {
            debug!(
                "handy store page {} invalid (tag_ok={}, sum={:#04x})",
                page, tag_ok, sum
            );
            Ok(None)
        }
    }

    fn write_page(&mut self, page: u8, data: &mut [u8; PAGE_LEN]) -> Result<(), WdError> {
        data[0] = 0;
        data[1] = page;
        data[2] = b'W';
        data[3] = b'D';
        data[PAGE_LEN - 1] = 0;
        let sum = data.iter().fold(0_u8, |acc, &b| acc.wrapping_add(b));
        data[PAGE_LEN - 1] = sum.wrapping_neg();

        let mut cdb = vendor_cdb(0xda, 0x00);
        put_be32(&mut cdb[2..], u32::from(page));
        put_be16(&mut cdb[7..], 1);
        self.command("WRITE HANDY STORE", &cdb, DataTransfer::Out(&data[..]))?;
        Ok(())
    }

    /// Rewrite page 1, preserving the salt/iteration record unless
    /// `new_salt` is set or no valid record exists, and preserving the hint
    /// unless a new one is given.
    fn write_page1(&mut self, new_salt: bool, hint: Option<&str>) -> Result<(), WdError> {
        let old = self.read_page(1)?;
        let mut page = [0_u8; PAGE_LEN];

        match (&old, new_salt) {
            (Some(old), false) => page[8..20].copy_from_slice(&old[8..20]),
            _ => {
                let mut rng = thread_rng();
                // iteration count 1..=8, big-endian at offset 8
                page[11] = (rng.gen::<u8>() & 7) + 1;
                for i in 0..4 {
                    // 4 printable UCS-2 salt characters
                    let mut c = rng.gen::<u8>() & 0x7f;
                    if c < b'#' {
                        c += b'#';
                    }
                    if c > b'z' {
                        c -= 5;
                    }
                    page[12 + 2 * i] = c;
                }
            }
        }

        match (hint, &old) {
            (Some(hint), _) => encode_ucs2(&mut page, 24, MAX_HINT_CHARS, hint),
            (None, Some(old)) => {
                let old_hint = decode_ucs2(old, 24, MAX_HINT_CHARS);
                encode_ucs2(&mut page, 24, MAX_HINT_CHARS, &old_hint);
            }
            (None, None) => {}
        }

        self.write_page(1, &mut page)
    }

    /// Make sure a salt/iteration record exists, generating one when it
    /// doesn't. Returns true if a fresh record was written, meaning the
    /// drive was still keyed with the factory password.
    pub fn ensure_password_params(&mut self) -> Result<bool, WdError> {
        if self.read_page(1)?.is_some() {
            return Ok(false);
        }
        self.write_page1(true, None)?;
        Ok(true)
    }

    /// Iterations and raw salt from page 1, which must exist.
    fn password_params(&mut self) -> Result<(u32, [u8; 8]), WdError> {
        let page = self.read_page(1)?.ok_or(WdError::HandyStore(1))?;
        parse_password_params(&page)
    }

    pub fn read_hint(&mut self) -> Result<Option<String>, WdError> {
        Ok(self
            .read_page(1)?
            .map(|page| decode_ucs2(&page, 24, MAX_HINT_CHARS)))
    }

    pub fn write_hint(&mut self, hint: &str) -> Result<(), WdError> {
        self.write_page1(false, Some(hint))
    }

    pub fn read_label(&mut self) -> Result<Option<String>, WdError> {
        Ok(self
            .read_page(2)?
            .map(|page| decode_ucs2(&page, 8, MAX_LABEL_CHARS)))
    }

    pub fn write_label(&mut self, label: &str) -> Result<(), WdError> {
        let mut page = [0_u8; PAGE_LEN];
        encode_ucs2(&mut page, 8, MAX_LABEL_CHARS, label);
        self.write_page(2, &mut page)
    }

    /// Generate and store a fresh salt/iteration record. Only meaningful
    /// while no password is set.
    pub fn new_salt(&mut self) -> Result<(), WdError> {
        self.require_state(SecurityStatus::NoLock, "not locked")?;
        self.write_page1(true, None)
    }

    pub fn unlock(&mut self, password: &str) -> Result<(), WdError> {
        let status = self.require_state(SecurityStatus::Locked, "locked")?;
        let block_len = status.checked_password_len()?;
        let (iterations, salt) = self.password_params()?;
        let block = derive_password_block(&salt, password, iterations, block_len);

        let mut payload = vec![0_u8; 8 + block_len];
        payload[0] = STATUS_SIGNATURE;
        put_be16(&mut payload[6..], block_len as u16);
        payload[8..].copy_from_slice(&block);

        let mut cdb = vendor_cdb(0xc1, 0xe1);
        put_be16(&mut cdb[7..], payload.len() as u16);
        self.command("UNLOCK", &cdb, DataTransfer::Out(&payload))?;
        Ok(())
    }

    pub fn set_password(&mut self, new: &str) -> Result<(), WdError> {
        self.password_op(PasswordAction::Set, None, Some(new))
    }

    pub fn change_password(&mut self, old: &str, new: &str) -> Result<(), WdError> {
        self.password_op(PasswordAction::Change, Some(old), Some(new))
    }

    pub fn disable_encryption(&mut self, old: &str) -> Result<(), WdError> {
        self.password_op(PasswordAction::Disable, Some(old), None)
    }

    fn password_op(
        &mut self,
        action: PasswordAction,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), WdError> {
        let status = match action {
            PasswordAction::Set => self.require_state(SecurityStatus::NoLock, "not locked")?,
            PasswordAction::Change | PasswordAction::Disable => {
                self.require_state(SecurityStatus::Unlocked, "unlocked")?
            }
        };
        let block_len = status.checked_password_len()?;
        let page = match self.read_page(1)? {
            Some(page) => page,
            None => {
                // no salt record yet; the factory password case
                self.write_page1(true, None)?;
                self.read_page(1)?.ok_or(WdError::HandyStore(1))?
            }
        };
        let (iterations, salt) = parse_password_params(&page)?;

        let mut payload = vec![0_u8; 8 + 2 * block_len];
        payload[0] = STATUS_SIGNATURE;
        payload[3] = action as u8;
        put_be16(&mut payload[6..], block_len as u16);
        if let Some(old) = old {
            payload[8..8 + block_len]
                .copy_from_slice(&derive_password_block(&salt, old, iterations, block_len));
        }
        if let Some(new) = new {
            payload[8 + block_len..]
                .copy_from_slice(&derive_password_block(&salt, new, iterations, block_len));
        }

        let mut cdb = vendor_cdb(0xc1, 0xe2);
        put_be16(&mut cdb[7..], payload.len() as u16);
        self.command("CHANGE PASSWORD", &cdb, DataTransfer::Out(&payload))?;
        Ok(())
    }

    /// Secure erase: keys the drive with fresh random material, destroying
    /// all data. Queries the drive's status itself so the key reset
    /// enabler and cipher are never stale.
    pub fn secure_erase(&mut self) -> Result<(), WdError> {
        let status = self.encryption_status()?;
        let block_len = status.checked_password_len()?;

        let mut payload = vec![0_u8; 8 + block_len];
        payload[0] = STATUS_SIGNATURE;
        payload[4] = status.cipher_id;
        thread_rng().fill(&mut payload[8..]);

        let mut cdb = vendor_cdb(0xc1, 0xe3);
        put_be32(&mut cdb[2..], status.key_reset_enabler);
        put_be16(&mut cdb[7..], payload.len() as u16);
        self.command("SECURE ERASE", &cdb, DataTransfer::Out(&payload))?;
        Ok(())
    }
}
