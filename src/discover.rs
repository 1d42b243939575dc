//! Finding the Passport drive: walk the SCSI bus in sysfs and match on the
//! vendor/model strings, then resolve the matching LU to a /dev node.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

const SCSI_DEVICES: &str = "/sys/bus/scsi/devices";

fn sysfs_value(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim_end().to_string())
}

/// The drive's block node (preferred) or its sg node.
fn dev_node(dir: &Path) -> Option<PathBuf> {
    for class in &["block", "scsi_generic"] {
        if let Ok(entries) = fs::read_dir(dir.join(class)) {
            for entry in entries.flatten() {
                let node = Path::new("/dev").join(entry.file_name());
                if node.exists() {
                    return Some(node);
                }
            }
        }
    }
    None
}

fn is_passport(dir: &Path) -> bool {
    let vendor = match sysfs_value(dir, "vendor") {
        Some(v) => v,
        None => return false,
    };
    if !vendor.starts_with("WD") {
        return false;
    }
    matches!(sysfs_value(dir, "model"), Some(m) if m.contains("Passport"))
}

/// First WD Passport logical unit on the SCSI bus, if any.
pub fn find_passport_device() -> Option<PathBuf> {
    let entries = fs::read_dir(SCSI_DEVICES).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        if !is_passport(&dir) {
            continue;
        }
        debug!("WD Passport LU at {}", dir.display());
        if let Some(node) = dev_node(&dir) {
            return Some(node);
        }
    }
    None
}
