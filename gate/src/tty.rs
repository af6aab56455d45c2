//! External TTY handoff.
//!
//! `set_tty` parks a terminal device so the broker can drive it: echo is
//! disabled and the device's foreground process group is stopped so nothing
//! can type or echo underneath. Restore reverses both. Unix-only.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;

use nix::libc;
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use nix::unistd::{getpgrp, tcgetpgrp, Pid};
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);

/// A parked terminal. Dropping it restores the device.
pub(crate) struct TtyHandoff {
    file: File,
    path: String,
    saved: Termios,
    stopped: Vec<Pid>,
    pub rows: u16,
    pub cols: u16,
}

impl TtyHandoff {
    /// Park the device at `path`: query its size, disable echo, and stop
    /// its foreground process group.
    pub fn install(path: &str) -> GateResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| GateError::Tty(format!("open {path}: {e}")))?;

        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: fd is a freshly opened terminal device and `size` is a
        // valid winsize out-parameter.
        unsafe { tiocgwinsz(file.as_raw_fd(), &mut size) }
            .map_err(|e| GateError::Tty(format!("winsize query on {path}: {e}")))?;

        let saved = tcgetattr(&file).map_err(|e| GateError::Tty(format!("tcgetattr: {e}")))?;
        let mut quiet = saved.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&file, SetArg::TCSANOW, &quiet)
            .map_err(|e| GateError::Tty(format!("tcsetattr: {e}")))?;

        let mut stopped = Vec::new();
        match tcgetpgrp(&file) {
            Ok(foreground) if foreground.as_raw() > 0 && foreground != getpgrp() => {
                match killpg(foreground, Signal::SIGTSTP) {
                    Ok(()) => stopped.push(foreground),
                    Err(e) => warn!(pgid = foreground.as_raw(), error = %e, "could not stop tty foreground group"),
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "no foreground group on tty"),
        }

        Ok(Self {
            file,
            path: path.to_string(),
            saved,
            stopped,
            rows: size.ws_row,
            cols: size.ws_col,
        })
    }

    /// Restore terminal attributes and resume anything that was stopped.
    pub fn restore(mut self) {
        self.restore_inner();
    }

    fn restore_inner(&mut self) {
        if let Err(e) = tcsetattr(&self.file, SetArg::TCSANOW, &self.saved) {
            warn!(path = %self.path, error = %e, "could not restore tty attributes");
        }
        for pgid in self.stopped.drain(..) {
            if let Err(e) = killpg(pgid, Signal::SIGCONT) {
                warn!(pgid = pgid.as_raw(), error = %e, "could not resume tty process group");
            }
        }
    }
}

impl Drop for TtyHandoff {
    fn drop(&mut self) {
        self.restore_inner();
    }
}
