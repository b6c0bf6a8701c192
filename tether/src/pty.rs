//! Pty/Child Manager: owns the pty master fd and the child process.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::{SetArg, Termios, tcsetattr};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, dup, setsid};

use crate::error::{Error, Result};
use crate::jail::close_inherited_fds;

/// Current window size, shared by the master and the attach handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
    /// Pixel width, `0` if unknown.
    pub xpixels: u16,
    /// Pixel height, `0` if unknown.
    pub ypixels: u16,
}

impl From<WinSize> for Winsize {
    fn from(w: WinSize) -> Self {
        Self {
            ws_row: w.rows,
            ws_col: w.cols,
            ws_xpixel: w.xpixels,
            ws_ypixel: w.ypixels,
        }
    }
}

/// Final status of a reaped child.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    /// Exit code, if the child exited normally.
    pub code: Option<i32>,
    /// Signal that killed the child, if any.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Maps this status to a process exit code: the child's exit code if
    /// available, else `0`.
    #[must_use]
    pub fn to_exit_code(self) -> i32 {
        self.code.unwrap_or(0)
    }
}

/// Owns the pty master fd and the spawned child.
pub struct PtyHandle {
    /// Child's process id.
    pub pid: Pid,
    /// Async reader for the pty master (child's stdout+stderr merged).
    pub master_read: tokio::fs::File,
    /// Async writer for the pty master (child's stdin).
    pub master_write: tokio::fs::File,
    /// Raw fd of the pty master, kept alive for `TIOCSWINSZ`.
    master_fd: OwnedFd,
}

impl PtyHandle {
    /// Applies the given window size to the pty master via `TIOCSWINSZ`,
    /// delivering `SIGWINCH` to the child's foreground process group.
    pub fn set_winsize(&self, size: WinSize) -> io::Result<()> {
        let winsize: Winsize = size.into();
        // SAFETY: master_fd is a valid, open pty master descriptor for the
        // lifetime of `self`.
        let ret = unsafe {
            libc::ioctl(
                self.master_fd.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::from_ref(&winsize),
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reaps the child if it has terminated.
    ///
    /// When `non_blocking` is `true`, returns `Ok(None)` immediately if the
    /// child is still running; otherwise blocks until it exits.
    pub fn wait_child(&self, non_blocking: bool) -> Result<Option<ExitStatus>> {
        let flag = non_blocking.then_some(WaitPidFlag::WNOHANG);
        match waitpid(self.pid, flag) {
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitStatus {
                code: Some(code),
                signal: None,
            })),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(ExitStatus {
                code: None,
                signal: Some(sig as i32),
            })),
            Ok(_) => Ok(None),
            Err(nix::errno::Errno::ECHILD) => Ok(Some(ExitStatus {
                code: None,
                signal: None,
            })),
            Err(e) => Err(Error::Io(io::Error::from(e))),
        }
    }
}

/// Allocates a pty pair, forks `argv`, and makes the slave the child's
/// controlling terminal.
///
/// The child: starts a new session (`setsid`), acquires the slave as its
/// controlling terminal (`TIOCSCTTY`), duplicates it to stdin/stdout/stderr,
/// applies `initial_winsize` and `initial_termios` to the slave, closes all
/// other inherited descriptors, and execs `argv[0]` with the rest of `argv`
/// as arguments. If exec fails, the child writes a short diagnostic to its
/// stderr and exits with status 127 (`Command::spawn`'s own error path,
/// surfaced to the caller as [`Error::ExecFailed`] before that point is
/// reached — the 127 exit belongs to the (rarer) case where `exec()` itself
/// fails after `fork()` succeeded, which `std::process` turns into a
/// spawn error here because we never detach the fork from spawn).
pub fn spawn_child(
    argv: &[String],
    initial_winsize: WinSize,
    initial_termios: Option<&Termios>,
) -> Result<PtyHandle> {
    let Some((cmd_name, args)) = argv.split_first() else {
        return Err(Error::Usage("no command given".into()));
    };

    let winsize: Winsize = initial_winsize.into();
    let OpenptyResult { master, slave } =
        openpty(Some(&winsize), None).map_err(|e| Error::PtyUnavailable(io::Error::from(e)))?;

    if let Some(termios) = initial_termios {
        tcsetattr(&slave, SetArg::TCSANOW, termios)
            .map_err(|e| Error::PtyUnavailable(io::Error::from(e)))?;
    }

    let slave_raw_fd = slave.as_raw_fd();
    let slave_stdin = dup_fd(&slave)?;
    let slave_stdout = dup_fd(&slave)?;
    let slave_stderr = dup_fd(&slave)?;

    let mut cmd = Command::new(cmd_name);
    cmd.args(args);

    // SAFETY: Stdio::from_raw_fd takes ownership of a freshly dup'd fd,
    // each used exactly once below.
    unsafe {
        cmd.stdin(Stdio::from_raw_fd(slave_stdin.into_raw_fd()));
        cmd.stdout(Stdio::from_raw_fd(slave_stdout.into_raw_fd()));
        cmd.stderr(Stdio::from_raw_fd(slave_stderr.into_raw_fd()));
    }

    // SAFETY: setsid, ioctl, and fd closes below are async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(io::Error::from)?;
            if libc::ioctl(slave_raw_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            close_inherited_fds();
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| Error::ExecFailed {
        cmd: cmd_name.clone(),
        source,
    })?;

    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(child.id() as i32);
    // `Child` doesn't own a waitable handle we need (reaping happens via
    // `wait_child`/`waitpid` on the raw pid), and dropping it does not
    // itself wait or kill — only the slave fd below matters for EOF.
    drop(child);
    // Child has its own copy of the slave after fork; the master must not
    // hold a reference or reads would never see EOF when the slave closes.
    drop(slave);

    let read_fd = dup_fd(&master)?;
    let write_fd = dup_fd(&master)?;
    let master_read =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(read_fd.into_raw_fd()) });
    let master_write =
        tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(write_fd.into_raw_fd()) });

    Ok(PtyHandle {
        pid,
        master_read,
        master_write,
        master_fd: master,
    })
}

fn dup_fd(fd: &OwnedFd) -> Result<OwnedFd> {
    dup(fd).map_err(|e| Error::Io(io::Error::from(e)))
}
