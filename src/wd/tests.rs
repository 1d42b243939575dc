#![cfg(test)]

use std::collections::VecDeque;

use super::{
    cipher_str, derive_password_block, EncryptionStatus, Passport, SecurityStatus, WdError,
};
use crate::scsi::pt::PtError;
use crate::scsi::{Category, Completion, DataTransfer, PassThrough, CDB_LEN};
use crate::sha256::sha256;

struct Exchange {
    /// Bytes copied into the data-in buffer, if the command reads.
    reply: Vec<u8>,
    completion: Completion,
}

impl Exchange {
    fn good(reply: Vec<u8>) -> Self {
        Self {
            reply,
            completion: Completion::default(),
        }
    }

    fn check_condition(sense: Vec<u8>) -> Self {
        Self {
            reply: Vec::new(),
            completion: Completion {
                status: 0x02,
                sense,
                ..Completion::default()
            },
        }
    }
}

/// Scripted stand-in for a drive: pops one canned exchange per command and
/// records what was sent.
#[derive(Default)]
struct FakeDrive {
    script: VecDeque<Exchange>,
    sent: Vec<([u8; CDB_LEN], Option<Vec<u8>>)>,
}

impl FakeDrive {
    fn scripted(script: Vec<Exchange>) -> Passport<FakeDrive> {
        Passport::new(FakeDrive {
            script: script.into(),
            sent: Vec::new(),
        })
    }
}

impl PassThrough for FakeDrive {
    fn execute(
        &mut self,
        cdb: &[u8; CDB_LEN],
        xfer: DataTransfer<'_>,
    ) -> Result<Completion, PtError> {
        let exchange = self.script.pop_front().expect("unscripted command sent");
        let mut data_out = None;
        match xfer {
            DataTransfer::In(buf) => {
                let n = exchange.reply.len().min(buf.len());
                buf[..n].copy_from_slice(&exchange.reply[..n]);
            }
            DataTransfer::Out(buf) => data_out = Some(buf.to_vec()),
        }
        self.sent.push((*cdb, data_out));
        Ok(exchange.completion)
    }
}

fn status_reply(security: u8, cipher: u8, block_len: u16, key_reset: u32) -> Vec<u8> {
    let mut reply = vec![0_u8; 48];
    reply[0] = 0x45;
    reply[3] = security;
    reply[4] = cipher;
    reply[6..8].copy_from_slice(&block_len.to_be_bytes());
    reply[8..12].copy_from_slice(&key_reset.to_be_bytes());
    reply
}

/// A sealed handy store page: tag bytes plus a valid trailing checksum.
fn sealed_page(page_no: u8, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let mut page = vec![0_u8; 512];
    page[1] = page_no;
    page[2] = b'W';
    page[3] = b'D';
    fill(&mut page);
    let sum = page.iter().fold(0_u8, |acc, &b| acc.wrapping_add(b));
    page[511] = page[511].wrapping_add(sum.wrapping_neg());
    page
}

fn page1(iterations: u32, salt: &[u8; 4], hint: &str) -> Vec<u8> {
    sealed_page(1, |page| {
        page[8..12].copy_from_slice(&iterations.to_be_bytes());
        for (i, &c) in salt.iter().enumerate() {
            page[12 + 2 * i] = c;
        }
        for (i, &b) in hint.as_bytes().iter().enumerate() {
            page[24 + 2 * i] = b;
        }
    })
}

fn not_ready_sense() -> Vec<u8> {
    let mut sb = vec![0_u8; 18];
    sb[0] = 0x70;
    sb[2] = 0x02;
    sb[7] = 10;
    sb[12] = 0x04;
    sb
}

#[test]
fn status_decodes() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_reply(
        0x01, 0x28, 32, 0xdead_beef,
    ))]);
    let status = drive.encryption_status().unwrap();
    assert_eq!(status.security, SecurityStatus::Locked);
    assert_eq!(status.cipher_id, 0x28);
    assert_eq!(status.password_block_len, 32);
    assert_eq!(status.key_reset_enabler, 0xdead_beef);

    let (cdb, out) = &drive.pt.sent[0];
    assert_eq!(
        cdb,
        &[
            0xc0, 0x45, // GET ENCRYPTION STATUS
            0, 0, 0, 0, 0, // reserved
            0, 48, // allocation length
            0,
        ]
    );
    assert!(out.is_none());
}

#[test]
fn status_rejects_bad_signature() {
    let mut reply = status_reply(0x01, 0x28, 32, 0);
    reply[0] = 0x00;
    let mut drive = FakeDrive::scripted(vec![Exchange::good(reply)]);
    assert!(matches!(
        drive.encryption_status(),
        Err(WdError::StatusUnavailable)
    ));
}

#[test]
fn status_unknown_security_byte() {
    let status_bytes = status_reply(0x42, 0x30, 32, 0);
    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_bytes)]);
    let status = drive.encryption_status().unwrap();
    assert_eq!(status.security, SecurityStatus::Unknown);
    assert_eq!(status.security.describe(), "unknown");
}

#[test]
fn device_error_carries_category() {
    let mut drive = FakeDrive::scripted(vec![Exchange::check_condition(not_ready_sense())]);
    match drive.encryption_status() {
        Err(WdError::Device { category, .. }) => {
            assert_eq!(category, Category::NotReady);
            assert_eq!(category.exit_code(), 2);
        }
        other => panic!("expected device error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn recovered_error_completion_is_success() {
    // a CHECK CONDITION with a benign sense key still carries good data
    let mut sb = vec![0_u8; 18];
    sb[0] = 0x70;
    sb[2] = 0x01; // RECOVERED ERROR
    sb[7] = 10;
    sb[12] = 0x17;
    let mut drive = FakeDrive::scripted(vec![Exchange {
        reply: status_reply(0x02, 0x28, 32, 0),
        completion: Completion {
            status: 0x02,
            sense: sb,
            ..Completion::default()
        },
    }]);
    let status = drive.encryption_status().unwrap();
    assert_eq!(status.security, SecurityStatus::Unlocked);

    let mut drive = FakeDrive::scripted(vec![Exchange {
        reply: status_reply(0x01, 0x28, 32, 0),
        completion: Completion {
            status: 0x02,
            sense: not_ready_sense(), // NOT READY still fails
            ..Completion::default()
        },
    }]);
    assert!(drive.encryption_status().is_err());
}

#[test]
fn status_require_checks_state_without_io() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_reply(0x01, 0x28, 32, 0))]);
    let status = drive.encryption_status().unwrap();
    assert!(status.require(SecurityStatus::Locked, "locked").is_ok());
    assert!(matches!(
        status.require(SecurityStatus::NoLock, "not locked"),
        Err(WdError::WrongState {
            actual: SecurityStatus::Locked,
            ..
        })
    ));
    // the check itself sends nothing
    assert_eq!(drive.pt.sent.len(), 1);
}

#[test]
fn unlock_guard_stops_before_any_vendor_command() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_reply(0x00, 0x28, 32, 0))]);
    assert!(matches!(
        drive.unlock("secret"),
        Err(WdError::WrongState {
            actual: SecurityStatus::NoLock,
            ..
        })
    ));
    // only the status query went out
    assert_eq!(drive.pt.sent.len(), 1);
}

#[test]
fn set_password_requires_unprotected_drive() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_reply(0x02, 0x28, 32, 0))]);
    assert!(matches!(
        drive.set_password("secret"),
        Err(WdError::WrongState { .. })
    ));
    assert_eq!(drive.pt.sent.len(), 1);
}

#[test]
fn bad_password_block_length_is_rejected() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_reply(0x01, 0x28, 64, 0))]);
    assert!(matches!(
        drive.unlock("secret"),
        Err(WdError::BadPasswordLength(64))
    ));
    assert_eq!(drive.pt.sent.len(), 1);

    let mut drive = FakeDrive::scripted(vec![Exchange::good(status_reply(0x02, 0x28, 0, 0))]);
    assert!(matches!(
        drive.secure_erase(),
        Err(WdError::BadPasswordLength(0))
    ));
}

#[test]
fn unlock_sends_derived_password_block() {
    let salt = [b'A', b'B', b'C', b'D'];
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x01, 0x28, 32, 0)),
        Exchange::good(page1(1, &salt, "")),
        Exchange::good(Vec::new()),
    ]);
    drive.unlock("abc").unwrap();

    let (cdb, out) = &drive.pt.sent[2];
    assert_eq!(
        cdb,
        &[
            0xc1, 0xe1, // UNLOCK
            0, 0, 0, 0, 0, // reserved
            0, 40, // parameter list length: 8 + 32
            0,
        ]
    );
    let payload = out.as_ref().unwrap();
    assert_eq!(payload.len(), 40);
    assert_eq!(payload[0], 0x45);
    assert_eq!(&payload[6..8], &[0, 32]);

    // one iteration: sha256 of raw salt plus widened password
    let mut expect_input = vec![b'A', 0, b'B', 0, b'C', 0, b'D', 0];
    expect_input.extend_from_slice(&[b'a', 0, b'b', 0, b'c', 0]);
    assert_eq!(&payload[8..], &sha256(&expect_input)[..]);
}

#[test]
fn derivation_rehashes_raw_digest() {
    let salt = [b'A', 0, b'B', 0, b'C', 0, b'D', 0];
    let mut input = salt.to_vec();
    input.extend_from_slice(&[b'a', 0, b'b', 0, b'c', 0]);
    let expected = sha256(&sha256(&sha256(&input)));

    let block = derive_password_block(&salt, "abc", 3, 32);
    assert_eq!(block, expected.to_vec());

    // a different iteration count gives different material
    assert_ne!(derive_password_block(&salt, "abc", 2, 32), block);
}

#[test]
fn degenerate_iteration_counts_are_rejected() {
    // a page can checksum correctly around a nonsense iteration count;
    // zero would hand out a constant token, huge values never finish
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x01, 0x28, 32, 0)),
        Exchange::good(page1(0, &[b'a'; 4], "")),
    ]);
    assert!(matches!(
        drive.unlock("pw"),
        Err(WdError::BadIterationCount(0))
    ));
    assert_eq!(drive.pt.sent.len(), 2);

    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x02, 0x28, 32, 0)),
        Exchange::good(page1(0x8000_0000, &[b'a'; 4], "")),
    ]);
    assert!(matches!(
        drive.change_password("old", "new"),
        Err(WdError::BadIterationCount(0x8000_0000))
    ));
    assert_eq!(drive.pt.sent.len(), 2);
}

#[test]
fn derivation_stops_at_control_characters() {
    let salt = [0_u8; 8];
    assert_eq!(
        derive_password_block(&salt, "ab\tcd", 1, 32),
        derive_password_block(&salt, "ab", 1, 32)
    );
    assert_ne!(
        derive_password_block(&salt, "ab", 1, 32),
        derive_password_block(&salt, "abc", 1, 32)
    );
}

#[test]
fn derivation_truncates_block() {
    let salt = [0_u8; 8];
    let long = derive_password_block(&salt, "pw", 1, 32);
    let short = derive_password_block(&salt, "pw", 1, 16);
    assert_eq!(&long[..16], &short[..]);
}

#[test]
fn read_label_roundtrip_and_corruption() {
    let page = sealed_page(2, |p| {
        for (i, &b) in b"backups".iter().enumerate() {
            p[8 + 2 * i] = b;
        }
    });

    let mut drive = FakeDrive::scripted(vec![Exchange::good(page.clone())]);
    assert_eq!(drive.read_label().unwrap(), Some("backups".to_string()));

    // flipping any byte breaks the whole-page checksum
    let mut corrupt = page;
    corrupt[100] ^= 0x01;
    let mut drive = FakeDrive::scripted(vec![Exchange::good(corrupt)]);
    assert_eq!(drive.read_label().unwrap(), None);
}

#[test]
fn read_label_uninitialized_page() {
    // all zeroes: checksum passes, tag doesn't
    let mut drive = FakeDrive::scripted(vec![Exchange::good(vec![0_u8; 512])]);
    assert_eq!(drive.read_label().unwrap(), None);
}

#[test]
fn write_label_seals_page() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(Vec::new())]);
    drive.write_label("media").unwrap();

    let (cdb, out) = &drive.pt.sent[0];
    assert_eq!(cdb[0], 0xda);
    assert_eq!(&cdb[2..6], &[0, 0, 0, 2]); // page 2
    assert_eq!(&cdb[7..9], &[0, 1]); // one block

    let page = out.as_ref().unwrap();
    assert_eq!(page.len(), 512);
    assert_eq!(&page[..4], &[0, 2, b'W', b'D']);
    assert_eq!(page[8], b'm');
    assert_eq!(page[9], 0);
    let sum = page.iter().fold(0_u8, |acc, &b| acc.wrapping_add(b));
    assert_eq!(sum, 0);
}

#[test]
fn write_hint_preserves_salt_record() {
    let existing = page1(5, &[b'Q', b'R', b'S', b'T'], "old hint");
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(existing.clone()),
        Exchange::good(Vec::new()),
    ]);
    drive.write_hint("new hint").unwrap();

    let (_, out) = &drive.pt.sent[1];
    let page = out.as_ref().unwrap();
    assert_eq!(&page[8..20], &existing[8..20]);
    assert_eq!(page[24], b'n');
    assert_eq!(page[26], b'e');
    let sum = page.iter().fold(0_u8, |acc, &b| acc.wrapping_add(b));
    assert_eq!(sum, 0);
}

#[test]
fn fresh_salt_record_is_well_formed() {
    // no valid page 1 on the drive; a fresh record gets generated
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x00, 0x28, 32, 0)),
        Exchange::good(vec![0_u8; 512]), // read inside write_page1
        Exchange::good(Vec::new()),      // the write
    ]);
    drive.new_salt().unwrap();

    let (_, out) = &drive.pt.sent[2];
    let page = out.as_ref().unwrap();
    // iteration count 1..=8, stored big-endian
    assert_eq!(&page[8..11], &[0, 0, 0]);
    assert!((1..=8).contains(&page[11]));
    for i in 0..4 {
        let c = page[12 + 2 * i];
        assert!((b'#'..=b'z').contains(&c), "salt byte {:#x}", c);
        assert_eq!(page[13 + 2 * i], 0);
    }
    let sum = page.iter().fold(0_u8, |acc, &b| acc.wrapping_add(b));
    assert_eq!(sum, 0);
}

#[test]
fn ensure_password_params_reports_fresh_record() {
    let mut drive = FakeDrive::scripted(vec![Exchange::good(page1(3, &[b'a'; 4], ""))]);
    assert!(!drive.ensure_password_params().unwrap());
    assert_eq!(drive.pt.sent.len(), 1);

    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(vec![0_u8; 512]), // probe fails
        Exchange::good(vec![0_u8; 512]), // read inside write_page1
        Exchange::good(Vec::new()),      // fresh page written
    ]);
    assert!(drive.ensure_password_params().unwrap());
    assert_eq!(drive.pt.sent.len(), 3);
}

#[test]
fn change_password_payload_layout() {
    let salt = [b'W', b'X', b'Y', b'Z'];
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x02, 0x28, 32, 0)),
        Exchange::good(page1(2, &salt, "")),
        Exchange::good(Vec::new()),
    ]);
    drive.change_password("oldpw", "newpw").unwrap();

    let (cdb, out) = &drive.pt.sent[2];
    assert_eq!(cdb[0], 0xc1);
    assert_eq!(cdb[1], 0xe2);
    assert_eq!(&cdb[7..9], &[0, 72]); // 8 + 2 * 32

    let payload = out.as_ref().unwrap();
    assert_eq!(payload.len(), 72);
    assert_eq!(payload[0], 0x45);
    assert_eq!(payload[3], 0); // change
    assert_eq!(&payload[6..8], &[0, 32]);

    let raw_salt = [b'W', 0, b'X', 0, b'Y', 0, b'Z', 0];
    assert_eq!(
        &payload[8..40],
        &derive_password_block(&raw_salt, "oldpw", 2, 32)[..]
    );
    assert_eq!(
        &payload[40..72],
        &derive_password_block(&raw_salt, "newpw", 2, 32)[..]
    );
}

#[test]
fn set_password_leaves_old_block_zeroed() {
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x00, 0x28, 32, 0)),
        Exchange::good(page1(1, &[b'a'; 4], "")),
        Exchange::good(Vec::new()),
    ]);
    drive.set_password("newpw").unwrap();

    let (_, out) = &drive.pt.sent[2];
    let payload = out.as_ref().unwrap();
    assert_eq!(payload[3], 1); // set
    assert_eq!(&payload[8..40], &[0_u8; 32]);
    assert_ne!(&payload[40..72], &[0_u8; 32]);
}

#[test]
fn disable_encryption_leaves_new_block_zeroed() {
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x02, 0x28, 32, 0)),
        Exchange::good(page1(1, &[b'a'; 4], "")),
        Exchange::good(Vec::new()),
    ]);
    drive.disable_encryption("oldpw").unwrap();

    let (_, out) = &drive.pt.sent[2];
    let payload = out.as_ref().unwrap();
    assert_eq!(payload[3], 16); // disable
    assert_ne!(&payload[8..40], &[0_u8; 32]);
    assert_eq!(&payload[40..72], &[0_u8; 32]);
}

#[test]
fn secure_erase_uses_fresh_status() {
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x07, 0x28, 32, 0x1122_3344)),
        Exchange::good(Vec::new()),
    ]);
    drive.secure_erase().unwrap();

    let (cdb, out) = &drive.pt.sent[1];
    assert_eq!(cdb[0], 0xc1);
    assert_eq!(cdb[1], 0xe3);
    assert_eq!(&cdb[2..6], &[0x11, 0x22, 0x33, 0x44]);
    assert_eq!(&cdb[7..9], &[0, 40]);

    let payload = out.as_ref().unwrap();
    assert_eq!(payload.len(), 40);
    assert_eq!(payload[0], 0x45);
    assert_eq!(payload[4], 0x28); // cipher copied from the fresh status
    assert_ne!(&payload[8..], &[0_u8; 32]); // random keying material
}

#[test]
fn unlock_end_to_end_state_change() {
    // unlock, then a fresh status query shows the drive unlocked
    let salt = [b'A', b'B', b'C', b'D'];
    let mut drive = FakeDrive::scripted(vec![
        Exchange::good(status_reply(0x01, 0x28, 32, 0)),
        Exchange::good(page1(1, &salt, "")),
        Exchange::good(Vec::new()),
        Exchange::good(status_reply(0x02, 0x28, 32, 0)),
    ]);
    drive.unlock("correct horse").unwrap();
    let status = drive.encryption_status().unwrap();
    assert_eq!(status.security, SecurityStatus::Unlocked);
    assert_eq!(drive.pt.sent.len(), 4);
}

#[test]
fn cipher_rendering() {
    assert_eq!(cipher_str(0x28), "AES_256_XTS");
    assert_eq!(cipher_str(0x30), "Full Disk Encryption");
    assert_eq!(cipher_str(0x99), "Unknown (99)");
}

// keeps the struct exercised without a device
#[test]
fn encryption_status_is_copy() {
    let status = EncryptionStatus {
        security: SecurityStatus::NoLock,
        cipher_id: 0x28,
        password_block_len: 32,
        key_reset_enabler: 0,
    };
    let copy = status;
    assert_eq!(copy.security, status.security);
}
