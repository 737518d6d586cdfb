//! Terminal-mode control and shutdown signaling.
//!
//! When the firmware requests character-mode or echo-free input the monitor
//! reconfigures its own terminal to match, and restores it through an RAII
//! guard so a panic or early return cannot leave the shell raw. SIGINT and
//! SIGTERM set a single-shot flag the polling loop checks; the signal
//! handler itself does nothing else.

use std::io::stdin;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};

/// Restores the terminal attributes captured at construction when dropped.
pub struct TermGuard {
    saved: Option<Termios>,
}

impl TermGuard {
    /// Applies echo/canonical settings to stdin. On a non-tty stdin (pipe,
    /// redirect, CI) this is a no-op guard.
    pub fn configure(echo: bool, line_mode: bool) -> Self {
        let fd = stdin();
        let Ok(saved) = termios::tcgetattr(fd.as_fd()) else {
            return Self { saved: None };
        };

        let mut tty = saved.clone();
        tty.local_flags.set(LocalFlags::ECHO, echo);
        tty.local_flags.set(LocalFlags::ICANON, line_mode);
        if !line_mode {
            tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
            tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        }
        if termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &tty).is_err() {
            log::warn!("failed to reconfigure terminal input mode");
            return Self { saved: None };
        }
        Self { saved: Some(saved) }
    }
}

impl Drop for TermGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let fd = stdin();
            let _ = termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, saved);
        }
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs SIGINT/SIGTERM handlers that flip the shutdown flag.
pub fn install_shutdown_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)?;
        signal::sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Whether a shutdown signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
