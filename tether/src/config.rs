//! Value-typed configuration records, built once by the CLI front-end and
//! passed by reference into the component that needs them.

use std::path::{Path, PathBuf};

use nix::sys::termios::Termios;
use tether_proto::RedrawMethod;

use crate::error::{Error, Result};

/// Configuration for a master process, built once at startup.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Resolved path of the session socket.
    pub socket_path: PathBuf,
    /// The program to run under the pty (`argv[0]` and the rest).
    pub command: Vec<String>,
    /// If `true`, fail with [`Error::SocketInUse`] rather than reusing an
    /// existing live master.
    pub require_new: bool,
    /// Original terminal settings captured before the master was launched,
    /// if a controlling terminal was present at startup.
    pub initial_termios: Option<Termios>,
}

/// Configuration for an attach client, built once at startup.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Resolved path of the session socket.
    pub socket_path: PathBuf,
    /// Detach character. `None` means the detach key is disabled (`-E`).
    pub detach_char: Option<u8>,
    /// Redraw method requested on attach.
    pub redraw_method: RedrawMethod,
    /// Whether `^Z` should locally suspend the attacher (disabled by `-z`).
    pub suspend_enabled: bool,
    /// If `true`, a missing or refusing socket is not an error (used by
    /// mode `A` to fall back silently to master creation).
    pub no_error_if_missing: bool,
}

/// Default detach character: `^\` (0x1C).
pub const DEFAULT_DETACH_CHAR: u8 = 0x1C;

/// Parses a `-e <char>` argument into a raw byte.
///
/// Accepts a literal single byte, `^X` meaning `X & 0x1F`, or `^?` meaning
/// DEL (`0x7F`).
pub fn parse_detach_char(spec: &str) -> Result<u8> {
    let bytes = spec.as_bytes();
    match bytes {
        [b'^', b'?'] => Ok(0x7F),
        [b'^', x] => Ok(x & 0x1F),
        [single] => Ok(*single),
        _ => Err(Error::Usage(format!(
            "invalid detach character spec: {spec:?}"
        ))),
    }
}

/// Resolves the effective socket path from a user-supplied name and the
/// `$TETHER_DIR` environment variable.
///
/// `$TETHER_DIR` only redirects the path when `name` does not begin with
/// `/`, does not begin with `./`, and does not contain `..`. When it
/// applies, the directory is created (mode `0755`) if missing; if it
/// exists and is not a directory, resolution fails.
pub fn resolve_socket_path(name: &str) -> Result<PathBuf> {
    let Ok(dir) = std::env::var("TETHER_DIR") else {
        return Ok(PathBuf::from(name));
    };
    if name.starts_with('/') || name.starts_with("./") || name.contains("..") {
        return Ok(PathBuf::from(name));
    }

    let dir_path = Path::new(&dir);
    match std::fs::metadata(dir_path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::TetherDirInvalid {
                path: dir_path.to_path_buf(),
            });
        }
        Err(_) => {
            std::fs::create_dir(dir_path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir_path, std::fs::Permissions::from_mode(0o755))?;
            }
        }
    }

    Ok(dir_path.join(name))
}
