//! Attach Client: connects to a master's session socket, puts the local
//! terminal into raw mode, and bridges stdio to the socket until detach,
//! disconnect, or session end.

use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
    tcgetattr, tcsetattr,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use tether_proto::{AttachAck, AttachHello, ClientFrame, MasterFrame, RedrawMethod};

use crate::config::AttachConfig;
use crate::error::{Error, Result};

const READ_CHUNK: usize = 4096;

/// Captures the original termios of `fd` (if it is a terminal) and
/// guarantees restoration on drop: restoration is tied to scoped
/// acquisition, not to any single exit path.
pub struct TerminalGuard<'fd> {
    fd: BorrowedFd<'fd>,
    original: Termios,
    restored: bool,
}

impl<'fd> TerminalGuard<'fd> {
    /// Captures the current termios of `fd` without modifying it.
    pub fn capture(fd: BorrowedFd<'fd>) -> Result<Self> {
        let original = tcgetattr(fd).map_err(|e| Error::Io(std::io::Error::from(e)))?;
        Ok(Self {
            fd,
            original,
            restored: false,
        })
    }

    /// Returns the originally captured settings, e.g. to propagate to a
    /// newly spawned child's pty slave.
    #[must_use]
    pub const fn original(&self) -> &Termios {
        &self.original
    }

    /// Switches `fd` into raw mode: no canonical processing, no echo, no
    /// signal generation, byte-at-a-time reads, 8-bit clean.
    pub fn enter_raw_mode(&self) -> Result<()> {
        let mut raw = self.original.clone();
        raw.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON);
        raw.output_flags &= !OutputFlags::OPOST;
        raw.local_flags &=
            !(LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
        raw.control_flags |= ControlFlags::CS8;
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(self.fd, SetArg::TCSAFLUSH, &raw).map_err(|e| Error::Io(std::io::Error::from(e)))
    }

    /// Restores the originally captured settings. Safe to call more than
    /// once; subsequent calls are no-ops.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        tcsetattr(self.fd, SetArg::TCSAFLUSH, &self.original)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for TerminalGuard<'_> {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// Queries the current window size of fd 0 via `TIOCGWINSZ`.
fn query_winsize() -> (u16, u16, u16, u16) {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: fd 0 is valid for the process lifetime; `ws` is
    // appropriately sized for TIOCGWINSZ.
    let ret = unsafe { libc::ioctl(0, libc::TIOCGWINSZ, std::ptr::from_mut(&mut ws)) };
    if ret != 0 {
        return (24, 80, 0, 0);
    }
    (ws.ws_row, ws.ws_col, ws.ws_xpixel, ws.ws_ypixel)
}

/// Resolves `Unspecified` against `$TERM`: `screen*`/`tmux*` get `Winch`,
/// everything else gets `CtrlL`.
fn resolve_redraw_method(requested: RedrawMethod) -> RedrawMethod {
    if requested != RedrawMethod::Unspecified {
        return requested;
    }
    let term = std::env::var("TERM").unwrap_or_default();
    if term.starts_with("screen") || term.starts_with("tmux") {
        RedrawMethod::Winch
    } else {
        RedrawMethod::CtrlL
    }
}

/// Connects to the master's socket, raw-modes the local terminal, and runs
/// the copy loop until detach, disconnect, or session end.
///
/// On `ECONNREFUSED`/`ENOENT`, returns [`Error::SocketRefused`] /
/// [`Error::SocketMissing`] so mode `A` can fall back to creating a new
/// master, unless `config.no_error_if_missing` silences that by the
/// caller's own choice of how to react to the error.
pub async fn attach_main(config: &AttachConfig) -> Result<i32> {
    let stdin_fd = std::io::stdin();
    let is_tty = nix::unistd::isatty(stdin_fd.as_fd()).unwrap_or(false);
    let mut guard = if is_tty {
        Some(TerminalGuard::capture(stdin_fd.as_fd())?)
    } else {
        None
    };

    let stream = connect(&config.socket_path).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (rows, cols, xpixels, ypixels) = query_winsize();
    let redraw_method = resolve_redraw_method(config.redraw_method);
    let hello = AttachHello {
        protocol_version: tether_proto::PROTOCOL_VERSION,
        redraw_method,
        rows,
        cols,
        xpixels,
        ypixels,
    };
    tether_proto::send(&mut writer, &hello).await?;
    match tether_proto::recv::<AttachAck>(&mut reader).await? {
        AttachAck::Accepted => {}
        AttachAck::Error(info) => return Err(Error::Protocol(info)),
    }

    if let Some(g) = guard.as_ref() {
        g.enter_raw_mode()?;
    }

    let exit_code = copy_loop(reader, writer, config, redraw_method, guard.as_mut()).await;

    drop(guard); // restores termios, if captured, before returning.
    exit_code
}

async fn connect(path: &std::path::Path) -> Result<UnixStream> {
    UnixStream::connect(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::ConnectionRefused => Error::SocketRefused {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::NotFound => Error::SocketMissing {
            path: path.to_path_buf(),
        },
        _ => Error::Io(e),
    })
}

/// One control byte found while scanning a chunk of stdin, plus the bytes
/// immediately before and after it: the buffer is split at the first
/// control character found.
enum Scan {
    /// No control character in this chunk; forward it whole.
    Forward(Vec<u8>),
    /// A detach or suspend character was found at `before.len()`.
    Control {
        before: Vec<u8>,
        kind: ControlKind,
        after: Vec<u8>,
    },
}

enum ControlKind {
    Detach,
    Suspend,
}

fn scan_input(buf: &[u8], detach_char: Option<u8>, suspend_enabled: bool) -> Scan {
    for (i, &b) in buf.iter().enumerate() {
        let kind = if Some(b) == detach_char {
            Some(ControlKind::Detach)
        } else if suspend_enabled && b == DEFAULT_SUSPEND_CHAR {
            Some(ControlKind::Suspend)
        } else {
            None
        };
        if let Some(kind) = kind {
            return Scan::Control {
                before: buf[..i].to_vec(),
                kind,
                after: buf[i + 1..].to_vec(),
            };
        }
    }
    Scan::Forward(buf.to_vec())
}

/// Default `stty susp` character, `^Z` (0x1A).
const DEFAULT_SUSPEND_CHAR: u8 = 0x1A;

async fn copy_loop(
    mut reader: tokio::io::ReadHalf<UnixStream>,
    mut writer: tokio::io::WriteHalf<UnixStream>,
    config: &AttachConfig,
    redraw_method: RedrawMethod,
    mut guard: Option<&mut TerminalGuard<'_>>,
) -> Result<i32> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let mut sigwinch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        .map_err(Error::Io)?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .map_err(Error::Io)?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(Error::Io)?;
    let mut sigcont = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::from_raw(
        libc::SIGCONT,
    ))
    .map_err(Error::Io)?;

    let mut stdin_buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            n = stdin.read(&mut stdin_buf) => {
                match n {
                    Ok(0) | Err(_) => return Ok(0),
                    Ok(n) => {
                        match scan_input(&stdin_buf[..n], config.detach_char, config.suspend_enabled) {
                            Scan::Forward(data) => {
                                tether_proto::send(&mut writer, &ClientFrame::Data(data)).await?;
                            }
                            Scan::Control { before, kind, after } => {
                                if !before.is_empty() {
                                    tether_proto::send(&mut writer, &ClientFrame::Data(before)).await?;
                                }
                                match kind {
                                    ControlKind::Detach => {
                                        debug!("detach key received");
                                        return Ok(0);
                                    }
                                    ControlKind::Suspend => {
                                        debug!("suspend key received");
                                        if let Some(g) = &mut guard {
                                            g.restore()?;
                                        }
                                        suspend_self();
                                        // Resumed: put the terminal back into
                                        // raw mode before doing anything
                                        // else, then re-send the current
                                        // winsize and request a redraw per
                                        // the negotiated policy.
                                        if let Some(g) = &mut guard {
                                            g.enter_raw_mode()?;
                                        }
                                        send_resize(&mut writer).await?;
                                        request_redraw(&mut writer, redraw_method).await?;
                                    }
                                }
                                if !after.is_empty() {
                                    tether_proto::send(&mut writer, &ClientFrame::Data(after)).await?;
                                }
                            }
                        }
                    }
                }
            }
            frame = tether_proto::recv::<MasterFrame>(&mut reader) => {
                match frame {
                    Ok(MasterFrame::Replay(data) | MasterFrame::Data(data)) => {
                        if stdout.write_all(&data).await.is_err() {
                            return Ok(0);
                        }
                        let _ = stdout.flush().await;
                    }
                    Ok(MasterFrame::SessionEnded { exit_code }) => {
                        return Ok(exit_code.unwrap_or(0));
                    }
                    Err(_) => return Ok(0),
                }
            }
            _ = sigwinch.recv() => {
                send_resize(&mut writer).await?;
            }
            _ = sighup.recv() => {
                debug!("SIGHUP received, treating as detach");
                return Ok(0);
            }
            _ = sigterm.recv() => {
                debug!("SIGTERM received, treating as detach");
                return Ok(0);
            }
            _ = sigcont.recv() => {
                if let Some(g) = &mut guard {
                    g.enter_raw_mode()?;
                }
                send_resize(&mut writer).await?;
                request_redraw(&mut writer, redraw_method).await?;
            }
        }
    }
}

/// Applies the negotiated redraw policy on resume from suspend.
///
/// `Winch` is already satisfied by [`send_resize`] (the master re-applies
/// the winsize unconditionally, which raises `SIGWINCH` in the child
/// regardless of whether the size actually changed); `CtrlL` forwards a
/// literal `^L` toward the child as ordinary data; `None`/`Unspecified` do
/// nothing (by construction `redraw_method` here is never `Unspecified`,
/// since [`resolve_redraw_method`] resolves it before the hello is sent).
async fn request_redraw(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    redraw_method: RedrawMethod,
) -> Result<()> {
    if redraw_method == RedrawMethod::CtrlL {
        tether_proto::send(writer, &ClientFrame::Data(vec![0x0c])).await?;
    }
    Ok(())
}

async fn send_resize(writer: &mut (impl tokio::io::AsyncWrite + Unpin)) -> Result<()> {
    let (rows, cols, xpixels, ypixels) = query_winsize();
    tether_proto::send(
        writer,
        &ClientFrame::Resize {
            rows,
            cols,
            xpixels,
            ypixels,
        },
    )
    .await?;
    Ok(())
}

/// Raises `SIGTSTP` on self and blocks until `SIGCONT` is delivered.
///
/// Callers must restore the original termios before calling this and
/// re-enter raw mode afterwards: the terminal is left in whatever state the
/// caller set it to while the process is stopped, and the foreground shell
/// (or whoever resumes this job) otherwise inherits raw mode. This relies on
/// the default disposition stopping the process the way a shell's job
/// control expects; the resuming `SIGCONT` is also observed by the copy
/// loop's own signal stream, which re-applies raw mode defensively for
/// resumes this function didn't itself trigger.
fn suspend_self() {
    // SAFETY: raise is async-signal-safe and always succeeds for a valid signal number.
    unsafe {
        libc::raise(libc::SIGTSTP);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use nix::pty::OpenptyResult;

    use super::*;

    fn assert_forward(scan: Scan, expected: &[u8]) {
        match scan {
            Scan::Forward(data) => assert_eq!(data, expected),
            Scan::Control { .. } => panic!("expected Scan::Forward"),
        }
    }

    #[test]
    fn scan_forwards_plain_input_unchanged() {
        assert_forward(scan_input(b"hello\n", Some(0x1C), true), b"hello\n");
    }

    #[test]
    fn scan_splits_on_detach_character() {
        match scan_input(b"ab\x1Ccd", Some(0x1C), true) {
            Scan::Control { before, kind: ControlKind::Detach, after } => {
                assert_eq!(before, b"ab");
                assert_eq!(after, b"cd");
            }
            _ => panic!("expected a detach split"),
        }
    }

    #[test]
    fn scan_splits_on_suspend_character_when_enabled() {
        match scan_input(b"x\x1Ay", None, true) {
            Scan::Control { before, kind: ControlKind::Suspend, after } => {
                assert_eq!(before, b"x");
                assert_eq!(after, b"y");
            }
            _ => panic!("expected a suspend split"),
        }
    }

    #[test]
    fn scan_ignores_suspend_character_when_disabled() {
        assert_forward(scan_input(b"x\x1Ay", None, false), b"x\x1Ay");
    }

    #[test]
    fn scan_disabled_detach_char_never_matches() {
        // `-E` is represented as `detach_char: None`; no input byte,
        // including the default `^\`, should split on it.
        assert_forward(scan_input(b"a\x1Cb", None, false), b"a\x1Cb");
    }

    #[test]
    fn scan_detach_takes_priority_at_same_position() {
        // A byte can't be both characters at once, but if a detach char is
        // met first in the scan it must win even when suspend is enabled.
        match scan_input(b"\x1C", Some(0x1C), true) {
            Scan::Control { kind: ControlKind::Detach, before, after } => {
                assert!(before.is_empty());
                assert!(after.is_empty());
            }
            _ => panic!("expected a detach split"),
        }
    }

    #[test]
    fn redraw_resolves_unspecified_by_term() {
        // SAFETY: test runs single-threaded w.r.t. this variable within
        // this process's test harness.
        unsafe { std::env::set_var("TERM", "xterm-256color") };
        assert_eq!(resolve_redraw_method(RedrawMethod::Unspecified), RedrawMethod::CtrlL);
        unsafe { std::env::set_var("TERM", "screen-256color") };
        assert_eq!(resolve_redraw_method(RedrawMethod::Unspecified), RedrawMethod::Winch);
        unsafe { std::env::set_var("TERM", "tmux-256color") };
        assert_eq!(resolve_redraw_method(RedrawMethod::Unspecified), RedrawMethod::Winch);
        unsafe { std::env::remove_var("TERM") };
    }

    #[test]
    fn redraw_explicit_choice_is_never_overridden() {
        unsafe { std::env::set_var("TERM", "screen") };
        assert_eq!(resolve_redraw_method(RedrawMethod::None), RedrawMethod::None);
        assert_eq!(resolve_redraw_method(RedrawMethod::CtrlL), RedrawMethod::CtrlL);
        unsafe { std::env::remove_var("TERM") };
    }

    #[test]
    fn terminal_guard_restores_original_settings_on_drop() {
        let OpenptyResult { master: _master, slave } =
            nix::pty::openpty(None, None).expect("openpty");
        let original = tcgetattr(slave.as_fd()).expect("tcgetattr");

        {
            let guard = TerminalGuard::capture(slave.as_fd()).expect("capture");
            guard.enter_raw_mode().expect("enter raw mode");
            let raw = tcgetattr(slave.as_fd()).expect("tcgetattr after raw");
            assert_ne!(raw.local_flags, original.local_flags);
        }

        let restored = tcgetattr(slave.as_fd()).expect("tcgetattr after drop");
        assert_eq!(restored.local_flags, original.local_flags);
        assert_eq!(restored.input_flags, original.input_flags);
    }

    #[test]
    fn terminal_guard_restore_is_idempotent() {
        let OpenptyResult { master: _master, slave } =
            nix::pty::openpty(None, None).expect("openpty");
        let mut guard = TerminalGuard::capture(slave.as_fd()).expect("capture");
        guard.enter_raw_mode().expect("enter raw mode");
        guard.restore().expect("first restore");
        guard.restore().expect("second restore is a no-op");
    }
}
