//! Interactive confirmation prompts.
//!
//! `TAKT_NO_TTY=1` forces non-interactive mode: prompts are skipped and
//! answer "yes", matching pipeline behavior where a blocked prompt would
//! hang forever.

use std::io::{BufRead, Write};

use crate::config::TaktConfig;

/// Ask a yes/no question, defaulting to "no". Returns true on `y`/`yes`.
pub fn confirm(prompt: &str) -> bool {
    if TaktConfig::no_tty() {
        return true;
    }

    print!("{prompt} [y/N] ");
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
