//! FD cleanup applied after `fork()` but before `exec()` in the pty child.

/// Closes all file descriptors `>= 3`.
///
/// FDs 0 (stdin), 1 (stdout), 2 (stderr) are preserved — they have already
/// been redirected to the pty slave by the caller. Must only be called
/// between `fork()` and `exec()`: every operation here is async-signal-safe.
pub fn close_inherited_fds() {
    // Try close_range(3, u32::MAX, 0) — available on Linux 5.9+.
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range is an async-signal-safe syscall.
        let ret = unsafe { libc::syscall(libc::SYS_close_range, 3_u32, u32::MAX, 0_u32) };
        if ret == 0 {
            return;
        }
    }

    // Fallback: close up to sysconf(_SC_OPEN_MAX).
    // SAFETY: sysconf and close are async-signal-safe.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if max_fd > 0 { max_fd } else { 1024 };
    for fd in 3..limit as i32 {
        unsafe { libc::close(fd) };
    }
}
