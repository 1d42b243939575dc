#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

mod discover;
mod prompt;
mod scsi;
mod sha256;
mod wd;

use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use crate::scsi::pt::SgDevice;
use crate::scsi::Category;
use crate::wd::{
    cipher_str, Passport, SecurityStatus, WdError, MAX_HINT_CHARS, MAX_LABEL_CHARS,
    MAX_PASSWORD_CHARS,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "wd-passport",
    about = "Manage the hardware encryption of WD My Passport drives"
)]
struct Opt {
    /// Print the drive's security status and cipher
    #[structopt(short, long)]
    status: bool,

    /// Unlock the drive with the current password
    #[structopt(short, long)]
    unlock: bool,

    /// Print the disk label stored on the drive
    #[structopt(short = "l", long)]
    get_disk_label: bool,

    /// Store a new disk label on the drive
    #[structopt(short = "L", long)]
    set_disk_label: bool,

    /// Print the password hint stored on the drive
    #[structopt(short = "i", long)]
    get_passwd_hint: bool,

    /// Store a new password hint on the drive
    #[structopt(short = "I", long)]
    set_passwd_hint: bool,

    /// Generate and store a new password salt (drive must be unprotected)
    #[structopt(short = "a", long)]
    set_new_salt: bool,

    /// Set a password (drive must be unprotected)
    #[structopt(short = "p", long)]
    set_new_passwd: bool,

    /// Change the current password (drive must be unlocked)
    #[structopt(short = "c", long)]
    change_passwd: bool,

    /// Remove the password (drive must be unlocked)
    #[structopt(short = "d", long)]
    disable_encryption: bool,

    /// Secure erase: generate a new encryption key, destroying all data
    #[structopt(short = "e", long)]
    erase_reset_key: bool,

    /// Device node to use instead of scanning for one
    #[structopt(long, parse(from_os_str))]
    device: Option<PathBuf>,

    /// More output; repeat for even more
    #[structopt(short, parse(from_occurrences))]
    verbose: u8,
}

impl Opt {
    fn any_operation(&self) -> bool {
        self.status
            || self.unlock
            || self.get_disk_label
            || self.set_disk_label
            || self.get_passwd_hint
            || self.set_passwd_hint
            || self.set_new_salt
            || self.set_new_passwd
            || self.change_passwd
            || self.disable_encryption
            || self.erase_reset_key
    }
}

const FACTORY_PASSWORD_WARNING: &str = "!!! WARNING !!!\n\
If this is the first time you set a password,\n\
make sure you change it at least once.\n\
Otherwise the factory password can be used to\n\
decrypt your data!!!";

fn report(err: &WdError) -> i32 {
    eprintln!("{}", err);
    err.category().map_or(99, Category::exit_code)
}

fn prompt_new_password() -> Option<String> {
    let new = prompt::read_passphrase("Please enter new disk password: ", MAX_PASSWORD_CHARS)?;
    let again = prompt::read_passphrase("Retype new disk password: ", MAX_PASSWORD_CHARS)?;
    if new != again {
        println!("Passwords don't match");
        return None;
    }
    Some(new)
}

#[allow(clippy::too_many_lines)]
fn run(opt: &Opt) -> i32 {
    let device = match opt.device.clone().or_else(discover::find_passport_device) {
        Some(device) => device,
        None => {
            eprintln!("No WD Passport device found.");
            return 99;
        }
    };
    println!("WD Passport device: {}", device.display());

    let sg = match SgDevice::open(&device) {
        Ok(sg) => sg,
        Err(err) => return report(&WdError::Transport(err)),
    };
    let mut drive = Passport::new(sg);

    // every operation needs a working status query first
    let status = match drive.encryption_status() {
        Ok(status) => status,
        Err(err) => {
            eprintln!("Cannot get encryption status.");
            return report(&err);
        }
    };

    if opt.status {
        println!("Security: {}", status.security.describe());
        println!("Cipher: {}", cipher_str(status.cipher_id));
        return 0;
    }

    if opt.unlock {
        let password = match prompt::read_passphrase(
            "Please enter current disk password: ",
            MAX_PASSWORD_CHARS,
        ) {
            Some(p) => p,
            None => return 0,
        };
        return match drive.unlock(&password) {
            Ok(()) => {
                println!("Drive unlocked successfully.");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.get_disk_label {
        return match drive.read_label() {
            Ok(Some(label)) => {
                println!("Disk label: {}", label);
                0
            }
            Ok(None) => {
                println!("Disk label was not yet set");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.set_disk_label {
        let label = match prompt::read_line("Please enter new disk label: ", MAX_LABEL_CHARS) {
            Some(l) => l,
            None => return 0,
        };
        return match drive.write_label(&label) {
            Ok(()) => {
                println!("Disk label was set");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.get_passwd_hint {
        return match drive.read_hint() {
            Ok(Some(hint)) => {
                println!("Password hint: {}", hint);
                0
            }
            Ok(None) => {
                println!("Password hint was not yet set");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.set_passwd_hint {
        let hint = match prompt::read_line("Please enter a password hint: ", MAX_HINT_CHARS) {
            Some(h) => h,
            None => return 0,
        };
        return match drive.write_hint(&hint) {
            Ok(()) => {
                println!("Password hint was set");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.set_new_salt {
        return match drive.new_salt() {
            Ok(()) => {
                println!("Generating and storing new salt.");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.set_new_passwd {
        // don't touch the handy store on a drive in the wrong state
        if let Err(err) = status.require(SecurityStatus::NoLock, "not locked") {
            return report(&err);
        }
        match drive.ensure_password_params() {
            Ok(true) => println!("{}", FACTORY_PASSWORD_WARNING),
            Ok(false) => {}
            Err(err) => return report(&err),
        }
        let new = match prompt_new_password() {
            Some(p) => p,
            None => return 1,
        };
        return match drive.set_password(&new) {
            Ok(()) => {
                println!("Password was set successfully.");
                0
            }
            Err(err) => {
                eprintln!("Error setting new password.");
                report(&err)
            }
        };
    }

    if opt.change_passwd {
        if let Err(err) = status.require(SecurityStatus::Unlocked, "unlocked") {
            return report(&err);
        }
        match drive.ensure_password_params() {
            Ok(true) => println!("{}", FACTORY_PASSWORD_WARNING),
            Ok(false) => {}
            Err(err) => return report(&err),
        }
        let old = match prompt::read_passphrase(
            "Please enter current disk password: ",
            MAX_PASSWORD_CHARS,
        ) {
            Some(p) => p,
            None => return 0,
        };
        let new = match prompt_new_password() {
            Some(p) => p,
            None => return 1,
        };
        return match drive.change_password(&old, &new) {
            Ok(()) => {
                println!("Password changed successfully.");
                0
            }
            Err(err) => {
                eprintln!("Error changing password.");
                report(&err)
            }
        };
    }

    if opt.disable_encryption {
        let old = match prompt::read_passphrase(
            "Please enter current disk password: ",
            MAX_PASSWORD_CHARS,
        ) {
            Some(p) => p,
            None => return 0,
        };
        return match drive.disable_encryption(&old) {
            Ok(()) => {
                println!("Security is disabled (no password).");
                0
            }
            Err(err) => report(&err),
        };
    }

    if opt.erase_reset_key {
        println!("!!! All data on {} will be lost !!!", device.display());
        if !prompt::confirm("Are you sure you want to continue? [y/N] ") {
            println!("Ok, nevermind.");
            return 0;
        }
        return match drive.secure_erase() {
            Ok(()) => {
                println!("Device erased. You need to create a new partition on the device.");
                0
            }
            Err(err) => report(&err),
        };
    }

    0
}

fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if !opt.any_operation() {
        let _ = Opt::clap().print_long_help();
        println!();
        process::exit(1);
    }

    process::exit(run(&opt));
}

#[cfg(test)]
mod tests {
    use super::*;

    // exit code 1 is for command-line errors only; engine failures without
    // a device category all land on 99
    #[test]
    fn wrong_state_exits_like_other_engine_failures() {
        let err = WdError::WrongState {
            required: "unlocked",
            actual: SecurityStatus::Locked,
        };
        assert_eq!(report(&err), 99);
        assert_eq!(report(&WdError::StatusUnavailable), 99);
    }
}
