//! Protocol message types exchanged between an attacher and a master over
//! the session socket.
//!
//! The first message on a new connection is always [`AttachHello`]. After
//! that, the connection carries a [`ClientFrame`] stream one way and a
//! [`MasterFrame`] stream the other, until either side closes it.

use serde::{Deserialize, Serialize};

/// Wire protocol version. Bumped on every incompatible change.
pub const PROTOCOL_VERSION: u8 = 1;

/// How the attacher would like the child to repaint on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedrawMethod {
    /// Do nothing.
    None,
    /// Send a single `^L` byte toward the child.
    CtrlL,
    /// Ask the master to re-apply the current winsize, triggering SIGWINCH.
    Winch,
    /// Let the master pick, based on `$TERM` (`screen*`/`tmux*` → `Winch`,
    /// otherwise `CtrlL`).
    Unspecified,
}

/// First message on every new connection, sent by the attacher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttachHello {
    /// Protocol version the attacher speaks.
    pub protocol_version: u8,
    /// Redraw method requested for this attach.
    pub redraw_method: RedrawMethod,
    /// Terminal height in rows at connect time.
    pub rows: u16,
    /// Terminal width in columns at connect time.
    pub cols: u16,
    /// Pixel width, `0` if unknown.
    pub xpixels: u16,
    /// Pixel height, `0` if unknown.
    pub ypixels: u16,
}

/// Master's acknowledgment after receiving [`AttachHello`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttachAck {
    /// Handshake accepted; the client is now `Active`.
    Accepted,
    /// Handshake rejected (protocol mismatch).
    Error(ErrorInfo),
}

/// Attacher → master messages once a connection is `Active`.
#[derive(Debug, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Raw bytes typed by the user, to be written to the pty master.
    Data(Vec<u8>),
    /// The attacher's local window size changed.
    Resize {
        /// New terminal height in rows.
        rows: u16,
        /// New terminal width in columns.
        cols: u16,
        /// New pixel width, `0` if unknown.
        xpixels: u16,
        /// New pixel height, `0` if unknown.
        ypixels: u16,
    },
}

/// Master → attacher messages once a connection is `Active`.
#[derive(Debug, Serialize, Deserialize)]
pub enum MasterFrame {
    /// A slice of the replay buffer, sent once immediately after the
    /// handshake completes.
    Replay(Vec<u8>),
    /// A chunk of bytes read from the pty master.
    Data(Vec<u8>),
    /// The child has exited; no further frames follow on this connection.
    SessionEnded {
        /// The child's exit code, if it exited normally.
        exit_code: Option<i32>,
    },
}

/// Structured error with a machine-readable code and a human-readable
/// message, used for handshake rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error classification.
    pub code: ErrorCode,
    /// Human-readable error description.
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a version-mismatch error.
    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::VersionMismatch, message)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Protocol version mismatch between attacher and master.
    VersionMismatch,
    /// Malformed or out-of-sequence message.
    InvalidRequest,
    /// Internal master error.
    Internal,
}
