//! Error types for tether's master and attach client operations.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the CLI front-end or propagated within a session.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad arguments, bad mode, or a missing socket/command.
    #[error("usage error: {0}")]
    Usage(String),

    /// Attach or create-and-attach requested but stdin is not a tty.
    #[error("stdin is not a terminal")]
    NoTerminal,

    /// The target socket does not exist.
    #[error("no master listening at {path}")]
    SocketMissing {
        /// The socket path that was probed.
        path: std::path::PathBuf,
    },

    /// The target socket exists but refused the connection.
    #[error("connection to {path} refused")]
    SocketRefused {
        /// The socket path that was probed.
        path: std::path::PathBuf,
    },

    /// Create-mode (`-c`/`-n`) hit an existing live socket.
    #[error("a master is already listening at {path}")]
    SocketInUse {
        /// The socket path already in use.
        path: std::path::PathBuf,
    },

    /// The pty allocation primitive failed.
    #[error("failed to allocate a pty: {0}")]
    PtyUnavailable(#[source] std::io::Error),

    /// `fork()` failed.
    #[error("failed to fork child process: {0}")]
    ForkFailed(#[source] std::io::Error),

    /// The child process failed to exec its argv.
    #[error("failed to exec {cmd}: {source}")]
    ExecFailed {
        /// The command that could not be executed.
        cmd: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// `$TETHER_DIR` exists and is not a directory.
    #[error("${env} ({path}) exists and is not a directory", env = "TETHER_DIR")]
    TetherDirInvalid {
        /// The offending path.
        path: std::path::PathBuf,
    },

    /// An I/O error not covered by a more specific variant above.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A protocol-level error reported by the peer.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ErrorInfo),
}

impl Error {
    /// Maps this error to the process exit code the CLI should use.
    ///
    /// Startup failures (usage, missing terminal, socket trouble, pty/fork
    /// failures) exit `1`; everything else also exits `1` since a
    /// successfully-run session reports its own exit code separately.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }
}
