//! Terminal state capture and restoration.
//!
//! A guest login can leave the controlling terminal with echo disabled
//! (an interrupted password prompt, a crashed full-screen program). The
//! saved attributes are written back by the first cleanup action.

use crate::config::types::{EnterError, Result};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use std::io::IsTerminal;

/// Terminal attributes of stdin as they were at session start
pub struct TerminalState {
    saved: Option<Termios>,
}

impl TerminalState {
    /// Snapshot stdin's attributes; a non-terminal stdin yields an empty snapshot
    pub fn capture() -> Self {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Self { saved: None };
        }
        match termios::tcgetattr(&stdin) {
            Ok(attrs) => Self { saved: Some(attrs) },
            Err(e) => {
                log::debug!("Could not read terminal attributes: {}", e);
                Self { saved: None }
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.saved.is_some()
    }

    /// Write the snapshot back with echo forced on. No-op without a terminal.
    pub fn restore(&self) -> Result<()> {
        let Some(saved) = &self.saved else {
            return Ok(());
        };

        let mut attrs = saved.clone();
        attrs.local_flags.insert(LocalFlags::ECHO);
        termios::tcsetattr(std::io::stdin(), SetArg::TCSANOW, &attrs)
            .map_err(|e| EnterError::Process(format!("Failed to restore terminal: {}", e)))
    }
}
