//! Pre-exec hardening applied to the pty child between `fork()` and `exec()`.

mod pre_exec;

pub use pre_exec::close_inherited_fds;
