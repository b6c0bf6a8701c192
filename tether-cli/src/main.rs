//! CLI front-end for `tether`, a minimal terminal session detacher.

#![allow(clippy::print_stderr)]

use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use clap::{ArgGroup, Parser, ValueEnum};
use tether::config::{self, AttachConfig, DEFAULT_DETACH_CHAR, MasterConfig, parse_detach_char};
use tether_proto::RedrawMethod;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Run a program under a pty and attach to it from any terminal",
    group(ArgGroup::new("mode").required(true).args(["attach", "attach_or_create", "create", "create_detached"])),
)]
struct Cli {
    /// Attach to an existing master. No command.
    #[arg(short = 'a', value_name = "socket")]
    attach: Option<String>,

    /// Attach if possible; otherwise create a new master running <command>.
    #[arg(short = 'A', value_name = "socket")]
    attach_or_create: Option<String>,

    /// Create a new master running <command>, then attach.
    #[arg(short = 'c', value_name = "socket")]
    create: Option<String>,

    /// Create a new master running <command>, do not attach.
    #[arg(short = 'n', value_name = "socket")]
    create_detached: Option<String>,

    /// Detach character: a literal byte, `^X` (meaning X & 0x1F), or `^?` (DEL).
    #[arg(short = 'e', value_name = "char")]
    detach_char: Option<String>,

    /// Disable the detach character entirely.
    #[arg(short = 'E', conflicts_with = "detach_char")]
    no_detach_char: bool,

    /// Redraw method used on attach.
    #[arg(short = 'r', value_enum)]
    redraw: Option<RedrawArg>,

    /// Disable local `^Z` suspend; forward it to the child instead.
    #[arg(short = 'z')]
    no_suspend: bool,

    /// Command and arguments to run (required for -A, -c, -n).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RedrawArg {
    None,
    CtrlL,
    Winch,
}

impl From<RedrawArg> for RedrawMethod {
    fn from(r: RedrawArg) -> Self {
        match r {
            RedrawArg::None => Self::None,
            RedrawArg::CtrlL => Self::CtrlL,
            RedrawArg::Winch => Self::Winch,
        }
    }
}

enum Mode {
    Attach { socket: String },
    AttachOrCreate { socket: String, command: Vec<String> },
    Create { socket: String, command: Vec<String> },
    CreateDetached { socket: String, command: Vec<String> },
}

impl Cli {
    fn mode(self) -> Result<Mode, tether::Error> {
        if let Some(socket) = self.attach {
            return Ok(Mode::Attach { socket });
        }
        if let Some(socket) = self.attach_or_create {
            return require_command(self.command).map(|command| Mode::AttachOrCreate { socket, command });
        }
        if let Some(socket) = self.create {
            return require_command(self.command).map(|command| Mode::Create { socket, command });
        }
        if let Some(socket) = self.create_detached {
            return require_command(self.command).map(|command| Mode::CreateDetached { socket, command });
        }
        unreachable!("clap enforces exactly one mode flag via the \"mode\" ArgGroup")
    }
}

fn require_command(command: Vec<String>) -> Result<Vec<String>, tether::Error> {
    if command.is_empty() {
        Err(tether::Error::Usage("missing command to run".into()))
    } else {
        Ok(command)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tether: {e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, tether::Error> {
    let cli = Cli::parse();
    let detach_char = resolve_detach_char(cli.detach_char.as_deref(), cli.no_detach_char)?;
    let redraw_method = cli.redraw.map_or(RedrawMethod::Unspecified, Into::into);
    let suspend_enabled = !cli.no_suspend;
    let mode = cli.mode()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(tether::Error::Io)?;

    match mode {
        Mode::Attach { socket } => {
            let config = attach_config(&socket, detach_char, redraw_method, suspend_enabled, false)?;
            runtime.block_on(tether::attach_main(&config))
        }
        Mode::AttachOrCreate { socket, command } => runtime.block_on(attach_or_create(
            &socket,
            command,
            detach_char,
            redraw_method,
            suspend_enabled,
        )),
        Mode::Create { socket, command } => {
            // -c requires a terminal: the detached master inherits this
            // process's stdin to capture it for the pty, but it's more
            // useful to fail here than inside the child.
            capture_termios_required()?;
            let attach = attach_config(&socket, detach_char, redraw_method, suspend_enabled, false)?;
            runtime.block_on(create_then_attach(&socket, &command, &attach))
        }
        Mode::CreateDetached { socket, command } => {
            let path = config::resolve_socket_path(&socket)?;
            // A detached start has no terminal to capture from; the child
            // gets the pty's own default line discipline (see config.rs).
            let initial_termios = capture_termios_optional();
            let master = MasterConfig {
                socket_path: path,
                command,
                require_new: true,
                initial_termios,
            };
            runtime.block_on(tether::master_main(&master))
        }
    }
}

/// Mode `A`: try attach first; on a missing or refused socket, start a new
/// master and attach to that instead.
async fn attach_or_create(
    socket: &str,
    command: Vec<String>,
    detach_char: Option<u8>,
    redraw_method: RedrawMethod,
    suspend_enabled: bool,
) -> Result<i32, tether::Error> {
    let attach = attach_config(socket, detach_char, redraw_method, suspend_enabled, true)?;
    match tether::attach_main(&attach).await {
        Ok(code) => return Ok(code),
        Err(tether::Error::SocketRefused { path }) => {
            let _ = std::fs::remove_file(&path);
        }
        Err(tether::Error::SocketMissing { .. }) => {}
        Err(e) => return Err(e),
    }

    capture_termios_required()?;
    let attach = attach_config(socket, detach_char, redraw_method, suspend_enabled, false)?;
    create_then_attach(socket, &command, &attach).await
}

/// Spawns a standalone master process running `command` on `socket` and
/// waits for it to start listening, then attaches to it in this process.
/// Used by modes `-c` and `-A`'s create fallback, so the session outlives
/// this process once the attacher later detaches.
async fn create_then_attach(
    socket: &str,
    command: &[String],
    attach: &AttachConfig,
) -> Result<i32, tether::Error> {
    let mut child = spawn_detached_master(socket, command)?;
    wait_for_master_socket(&attach.socket_path, &mut child).await?;
    tether::attach_main(attach).await
}

/// Re-invokes this binary in `-n` mode as a standalone daemon process:
/// `setsid`-ed into its own session, with stdout/stderr sent to
/// `/dev/null`. Stdin is left inherited rather than redirected, since the
/// `-n` master still needs to read the original terminal settings off fd 0
/// before the pty is spawned; `setsid` already drops the
/// controlling-terminal association, so inheriting the fd doesn't hand the
/// detached process a controlling terminal back.
fn spawn_detached_master(socket: &str, command: &[String]) -> Result<std::process::Child, tether::Error> {
    let exe = std::env::current_exe().map_err(tether::Error::Io)?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("-n").arg(socket).args(command);
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    // SAFETY: setsid is async-signal-safe and is called only between fork and exec.
    unsafe {
        cmd.pre_exec(|| nix::unistd::setsid().map(drop).map_err(std::io::Error::from));
    }
    cmd.spawn().map_err(tether::Error::ForkFailed)
}

/// Polls until the detached master's socket accepts a connection, or fails
/// fast if the child has already exited (its own stderr went to
/// `/dev/null`, so a startup failure would otherwise look like a silent
/// timeout here).
async fn wait_for_master_socket(
    path: &std::path::Path,
    child: &mut std::process::Child,
) -> Result<(), tether::Error> {
    for _ in 0..200 {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return Ok(());
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(tether::Error::Io(std::io::Error::other(format!(
                "detached master exited before creating its session ({status})"
            ))));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    Err(tether::Error::Io(std::io::Error::other(
        "timed out waiting for the detached master to create its session socket",
    )))
}

fn resolve_detach_char(spec: Option<&str>, disabled: bool) -> Result<Option<u8>, tether::Error> {
    if disabled {
        return Ok(None);
    }
    match spec {
        Some(s) => parse_detach_char(s).map(Some),
        None => Ok(Some(DEFAULT_DETACH_CHAR)),
    }
}

fn attach_config(
    socket: &str,
    detach_char: Option<u8>,
    redraw_method: RedrawMethod,
    suspend_enabled: bool,
    no_error_if_missing: bool,
) -> Result<AttachConfig, tether::Error> {
    Ok(AttachConfig {
        socket_path: config::resolve_socket_path(socket)?,
        detach_char,
        redraw_method,
        suspend_enabled,
        no_error_if_missing,
    })
}

/// Captures fd 0's termios, failing with [`tether::Error::NoTerminal`] if
/// fd 0 is not a tty. Used by modes that spawn a child expecting an
/// interactive line discipline (`-c`, and `-A`'s fallback).
fn capture_termios_required() -> Result<Option<nix::sys::termios::Termios>, tether::Error> {
    let stdin = std::io::stdin();
    if !nix::unistd::isatty(stdin.as_fd()).unwrap_or(false) {
        return Err(tether::Error::NoTerminal);
    }
    nix::sys::termios::tcgetattr(stdin.as_fd())
        .map(Some)
        .map_err(|e| tether::Error::Io(std::io::Error::from(e)))
}

/// Like [`capture_termios_required`] but tolerant of a missing terminal
/// (mode `-n`'s detached start).
fn capture_termios_optional() -> Option<nix::sys::termios::Termios> {
    let stdin = std::io::stdin();
    if !nix::unistd::isatty(stdin.as_fd()).unwrap_or(false) {
        return None;
    }
    nix::sys::termios::tcgetattr(stdin.as_fd()).ok()
}
