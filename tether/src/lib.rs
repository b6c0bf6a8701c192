//! Core library behind the `tether` terminal session detacher.
//!
//! A [`session::master_main`] owns a pty and a child process, and
//! multiplexes bytes between the child and any number of
//! [`attach::attach_main`] clients connected over a local Unix socket.
//! Both entry points take a value-typed configuration record
//! ([`config::MasterConfig`] / [`config::AttachConfig`]) built once by the
//! CLI front-end; neither reads global state.

#[cfg(unix)]
pub mod attach;
pub mod config;
pub mod error;
#[cfg(unix)]
mod jail;
#[cfg(unix)]
pub mod pty;
#[cfg(unix)]
pub mod session;

#[cfg(unix)]
pub use attach::{TerminalGuard, attach_main};
pub use config::{AttachConfig, MasterConfig};
pub use error::{Error, Result};
#[cfg(unix)]
pub use pty::{ExitStatus, PtyHandle, WinSize};
#[cfg(unix)]
pub use session::master_main;
