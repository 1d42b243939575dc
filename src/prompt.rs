//! Interactive prompts. Passwords are read with terminal echo suppressed;
//! EOF anywhere means the user backed out, which callers treat as an abort
//! rather than an error.

use std::io::{self, BufRead, Write};

fn read_prompted(prompt: &str, echo: bool, max_chars: usize) -> Option<String> {
    let mut out = io::stdout();
    let _ = write!(out, "{}", prompt);
    let _ = out.flush();

    let fd = libc::STDIN_FILENO;
    let mut saved: libc::termios = unsafe { std::mem::zeroed() };
    // tcgetattr fails when stdin isn't a tty; then there is no echo to turn
    // off anyway
    let on_tty = unsafe { libc::tcgetattr(fd, &mut saved) } == 0;
    if on_tty && !echo {
        let mut quiet = saved;
        quiet.c_lflag &= !libc::ECHO;
        quiet.c_lflag |= libc::ECHONL;
        unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &quiet) };
    }

    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line);

    if on_tty && !echo {
        unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &saved) };
    }

    match read {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let line = line.trim_end_matches(&['\r', '\n'][..]);
            Some(line.chars().take(max_chars).collect())
        }
    }
}

pub fn read_passphrase(prompt: &str, max_chars: usize) -> Option<String> {
    read_prompted(prompt, false, max_chars)
}

pub fn read_line(prompt: &str, max_chars: usize) -> Option<String> {
    read_prompted(prompt, true, max_chars)
}

/// y/N question, defaulting to no.
pub fn confirm(prompt: &str) -> bool {
    match read_prompted(prompt, true, 8) {
        Some(answer) => answer.chars().next().map_or(false, |c| {
            c.eq_ignore_ascii_case(&'y')
        }),
        None => false,
    }
}
