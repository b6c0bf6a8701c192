//! Master Server: binds the session socket, owns the pty/child, and fans
//! pty output out to every attached client.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use tether_proto::{AttachAck, AttachHello, ClientFrame, ErrorInfo, MasterFrame, RedrawMethod};

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::pty::{self, PtyHandle, WinSize};

/// Size of the replay ring buffer kept to repaint newly-attached clients.
const REPLAY_BUFFER_SIZE: usize = 4096;

/// Outbound queue bound (bytes) before a slow client is dropped so its own
/// backpressure never stalls the child or the other clients.
const CLIENT_QUEUE_BOUND: usize = 64 * 1024;

/// Read chunk size for pty and client socket reads.
const READ_CHUNK: usize = 8192;

/// Bounded ring of the most recent bytes emitted by the child.
struct ReplayBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl ReplayBuffer {
    const fn new(cap: usize) -> Self {
        Self { buf: Vec::new(), cap }
    }

    fn push(&mut self, data: &[u8]) {
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(0..overflow);
        }
        self.buf.extend_from_slice(data);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// Commands sent from client tasks to the single task that owns the pty
/// master's write half and resize ioctl.
enum PtyCommand {
    Write(Vec<u8>),
    Resize(WinSize),
}

/// A registered, `Active` client's outbound side.
struct ClientHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    queued: Arc<AtomicUsize>,
}

/// Replay buffer and client registry behind a single lock.
///
/// Both must move together: a byte read from the pty is pushed into the
/// replay buffer and fanned out to every registered client as one atomic
/// step, and a newly attaching client's replay snapshot is taken at the
/// same instant it is registered. Guarding them with separate locks would
/// open a window where an attaching client either double-receives a byte
/// (seen in both its snapshot and the live fan-out) or drops one (missed by
/// both) depending on how the two operations interleave.
struct Shared {
    replay: ReplayBuffer,
    clients: HashMap<u64, ClientHandle>,
}

type SharedState = Arc<Mutex<Shared>>;

/// Runs a master session to completion: binds the socket, spawns the
/// child, multiplexes pty output to clients and client input to the pty,
/// and returns the exit code to propagate once the child has been reaped
/// and the socket unlinked.
pub async fn master_main(config: &MasterConfig) -> Result<i32> {
    let listener = bind_or_reclaim(&config.socket_path, config.require_new).await?;
    // Socket files are private to the inviting user; only filesystem
    // permissions gate access.
    set_socket_permissions(&config.socket_path)?;

    let initial_winsize = WinSize {
        rows: 24,
        cols: 80,
        xpixels: 0,
        ypixels: 0,
    };
    let pty = pty::spawn_child(
        &config.command,
        initial_winsize,
        config.initial_termios.as_ref(),
    )?;

    let result = run_event_loop(listener, pty, &config.socket_path).await;
    let _ = std::fs::remove_file(&config.socket_path);
    result
}

/// Binds the session socket, reclaiming a stale socket file left behind by
/// a crashed master: if bind fails with "address in use", probe with a
/// connect; a live master fails with [`Error::SocketInUse`], a dead one is
/// unlinked and rebind is retried once.
async fn bind_or_reclaim(path: &Path, require_new: bool) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(Error::SocketInUse {
                    path: path.to_path_buf(),
                });
            }
            debug!(?path, require_new, "reclaiming stale socket file");
            let _ = std::fs::remove_file(path);
            UnixListener::bind(path).map_err(Error::Io)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

async fn run_event_loop(listener: UnixListener, pty: PtyHandle, socket_path: &Path) -> Result<i32> {
    let shared: SharedState = Arc::new(Mutex::new(Shared {
        replay: ReplayBuffer::new(REPLAY_BUFFER_SIZE),
        clients: HashMap::new(),
    }));
    let next_client_id = Arc::new(AtomicU64::new(0));
    let last_winsize = Arc::new(Mutex::new(WinSize {
        rows: 24,
        cols: 80,
        xpixels: 0,
        ypixels: 0,
    }));

    let (pty_cmd_tx, pty_cmd_rx) = mpsc::unbounded_channel::<PtyCommand>();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<()>();
    let session_exit_code: Arc<std::sync::Mutex<Option<i32>>> = Arc::new(std::sync::Mutex::new(None));

    let PtyHandle {
        pid,
        master_read,
        master_write,
        ..
    } = pty;
    let pty_for_resize = Arc::new(PtyResizeHandle { fd: master_write.try_clone().await.ok() });

    // Task owning the pty master's write half: serializes writes and
    // winsize changes requested by any client.
    let resize_handle = pty_for_resize.clone();
    tokio::spawn(pty_writer_task(master_write, pty_cmd_rx, resize_handle));

    // Task fanning pty master output out to every Active client.
    let fanout_shared = shared.clone();
    let fanout_ended = ended_tx.clone();
    tokio::spawn(pty_reader_task(master_read, fanout_shared, fanout_ended));

    drop(ended_tx);

    // Task reaping the child once it exits.
    let exit_status = tokio::task::spawn_blocking(move || {
        loop {
            if let Ok(Some(status)) = wait_blocking(pid) {
                return status;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    });

    // Accept loop, spawning one task per connection.
    let accept_shared = shared.clone();
    let accept_pty_cmd_tx = pty_cmd_tx;
    let accept_ids = next_client_id;
    let accept_exit_code = session_exit_code.clone();
    let accept_winsize = last_winsize;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let id = accept_ids.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(client_task(
                        id,
                        stream,
                        accept_shared.clone(),
                        accept_pty_cmd_tx.clone(),
                        accept_exit_code.clone(),
                        accept_winsize.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    });

    let status = tokio::select! {
        status = exit_status => status.map_err(|e| Error::Io(io::Error::other(e)))?,
        _ = ended_rx.recv() => {
            // Pty EOF observed before the blocking reaper returned;
            // still need the real status for the exit code.
            tokio::task::spawn_blocking(move || wait_blocking(pid))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))?
                .unwrap_or(None)
                .unwrap_or(pty::ExitStatus { code: Some(0), signal: None })
        }
    };

    info!(?socket_path, exit_code = status.to_exit_code(), "session ended");
    *session_exit_code.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = status.code;
    broadcast_session_ended(&shared).await;
    Ok(status.to_exit_code())
}

fn wait_blocking(pid: nix::unistd::Pid) -> Result<Option<pty::ExitStatus>> {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(pty::ExitStatus { code: Some(code), signal: None })),
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            Ok(Some(pty::ExitStatus { code: None, signal: Some(sig as i32) }))
        }
        Ok(_) => Ok(None),
        Err(nix::errno::Errno::ECHILD) => Ok(Some(pty::ExitStatus { code: Some(0), signal: None })),
        Err(e) => Err(Error::Io(io::Error::from(e))),
    }
}

/// Thin handle letting any client task request a winsize change without
/// owning the pty master fd directly.
struct PtyResizeHandle {
    fd: Option<tokio::fs::File>,
}

async fn pty_writer_task(
    mut master_write: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<PtyCommand>,
    resize: Arc<PtyResizeHandle>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PtyCommand::Write(data) => {
                if master_write.write_all(&data).await.is_err() {
                    break;
                }
            }
            PtyCommand::Resize(size) => {
                if let Some(fd) = resize.fd.as_ref() {
                    apply_winsize(fd, size);
                }
            }
        }
    }
}

fn apply_winsize(fd: &tokio::fs::File, size: WinSize) {
    use std::os::fd::AsRawFd;
    let winsize: nix::pty::Winsize = size.into();
    // SAFETY: fd is a valid pty master descriptor for the call's duration.
    unsafe {
        libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::from_ref(&winsize));
    }
}

async fn pty_reader_task(mut master_read: tokio::fs::File, shared: SharedState, ended: mpsc::UnboundedSender<()>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match master_read.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = ended.send(());
                return;
            }
            Ok(n) => {
                let chunk = &buf[..n];
                let mut guard = shared.lock().await;
                guard.replay.push(chunk);
                fan_out(&mut guard.clients, chunk);
            }
        }
    }
}

/// Writes `data` to every registered client, dropping any whose outbound
/// queue would exceed [`CLIENT_QUEUE_BOUND`] so a slow client can never stall
/// the others. Caller holds the [`Shared`] lock, so this runs atomically
/// with client registration.
fn fan_out(clients: &mut HashMap<u64, ClientHandle>, data: &[u8]) {
    let mut dead = Vec::new();
    for (&id, handle) in clients.iter() {
        let prior = handle.queued.load(Ordering::Relaxed);
        if prior + data.len() > CLIENT_QUEUE_BOUND || handle.tx.send(data.to_vec()).is_err() {
            dead.push(id);
            continue;
        }
        handle.queued.fetch_add(data.len(), Ordering::Relaxed);
    }
    for id in dead {
        clients.remove(&id);
        debug!(client_id = id, "dropping slow or disconnected client");
    }
}

/// Drops every client's outbound sender. Each client task observes the
/// resulting channel closure and sends its own `MasterFrame::SessionEnded`
/// before exiting.
async fn broadcast_session_ended(shared: &SharedState) {
    shared.lock().await.clients.drain();
}

/// Records the attaching client's winsize, applying it to the pty only if it
/// differs from the last known size, then honors the attach-time redraw
/// policy: `CtrlL` writes a literal `^L` into the pty; `Winch` re-applies the
/// winsize even when unchanged, forcing `SIGWINCH`; `None` does nothing
/// extra. `Unspecified` never reaches here — the attacher resolves it before
/// sending the hello.
async fn apply_attach_winsize_and_redraw(
    pty_cmd_tx: &mpsc::UnboundedSender<PtyCommand>,
    last_winsize: &Arc<Mutex<WinSize>>,
    reported: WinSize,
    redraw_method: RedrawMethod,
) {
    let changed = {
        let mut guard = last_winsize.lock().await;
        let changed = *guard != reported;
        *guard = reported;
        changed
    };
    match redraw_method {
        RedrawMethod::CtrlL => {
            let _ = pty_cmd_tx.send(PtyCommand::Write(vec![0x0c]));
        }
        RedrawMethod::Winch => {
            let _ = pty_cmd_tx.send(PtyCommand::Resize(reported));
        }
        RedrawMethod::None | RedrawMethod::Unspecified => {
            if changed {
                let _ = pty_cmd_tx.send(PtyCommand::Resize(reported));
            }
        }
    }
}

/// Per-connection task: performs the attach handshake, then bridges the
/// client's `ClientFrame` stream to the pty and the client's outbound
/// queue to `MasterFrame`s.
async fn client_task(
    id: u64,
    stream: UnixStream,
    shared: SharedState,
    pty_cmd_tx: mpsc::UnboundedSender<PtyCommand>,
    session_exit_code: Arc<std::sync::Mutex<Option<i32>>>,
    last_winsize: Arc<Mutex<WinSize>>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let hello: AttachHello = match tether_proto::recv(&mut reader).await {
        Ok(h) => h,
        Err(e) => {
            debug!(client_id = id, error = %e, "handshake read failed");
            return;
        }
    };

    if hello.protocol_version != tether_proto::PROTOCOL_VERSION {
        let _ = tether_proto::send(
            &mut writer,
            &AttachAck::Error(ErrorInfo::version_mismatch(format!(
                "master speaks protocol {}, attacher offered {}",
                tether_proto::PROTOCOL_VERSION,
                hello.protocol_version
            ))),
        )
        .await;
        return;
    }
    if tether_proto::send(&mut writer, &AttachAck::Accepted).await.is_err() {
        return;
    }

    let reported = WinSize {
        rows: hello.rows,
        cols: hello.cols,
        xpixels: hello.xpixels,
        ypixels: hello.ypixels,
    };
    apply_attach_winsize_and_redraw(&pty_cmd_tx, &last_winsize, reported, hello.redraw_method).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let queued = Arc::new(AtomicUsize::new(0));
    // Snapshot the replay buffer and register this client in the same
    // locked section: this is the instant "Active" begins, so no byte
    // fanned out after this point can be missed, and none fanned out
    // before it can be double-delivered.
    let snapshot = {
        let mut guard = shared.lock().await;
        let snapshot = guard.replay.snapshot();
        guard.clients.insert(
            id,
            ClientHandle {
                tx,
                queued: queued.clone(),
            },
        );
        snapshot
    };
    if !snapshot.is_empty()
        && tether_proto::send(&mut writer, &MasterFrame::Replay(snapshot))
            .await
            .is_err()
    {
        shared.lock().await.clients.remove(&id);
        return;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(data) => {
                        queued.fetch_sub(data.len(), Ordering::Relaxed);
                        if tether_proto::send(&mut writer, &MasterFrame::Data(data)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Channel closed: session ended or client was dropped.
                        let exit_code = *session_exit_code
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        let _ = tether_proto::send(&mut writer, &MasterFrame::SessionEnded { exit_code }).await;
                        break;
                    }
                }
            }
            frame = tether_proto::recv::<ClientFrame>(&mut reader) => {
                match frame {
                    Ok(ClientFrame::Data(data)) => {
                        if pty_cmd_tx.send(PtyCommand::Write(data)).is_err() {
                            break;
                        }
                    }
                    Ok(ClientFrame::Resize { rows, cols, xpixels, ypixels }) => {
                        let size = WinSize { rows, cols, xpixels, ypixels };
                        *last_winsize.lock().await = size;
                        let _ = pty_cmd_tx.send(PtyCommand::Resize(size));
                    }
                    Err(_) => break,
                }
            }
        }
    }

    shared.lock().await.clients.remove(&id);
    debug!(client_id = id, "client disconnected");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn replay_buffer_keeps_most_recent_bytes_within_cap() {
        let mut buf = ReplayBuffer::new(8);
        buf.push(b"1234");
        buf.push(b"5678");
        assert_eq!(buf.snapshot(), b"12345678");
        buf.push(b"9");
        assert_eq!(buf.snapshot(), b"23456789");
    }

    #[test]
    fn replay_buffer_single_push_larger_than_cap_keeps_tail() {
        let mut buf = ReplayBuffer::new(4);
        buf.push(b"abcdefgh");
        assert_eq!(buf.snapshot(), b"efgh");
    }

    #[test]
    fn replay_buffer_empty_snapshot_is_empty() {
        let buf = ReplayBuffer::new(16);
        assert!(buf.snapshot().is_empty());
    }

    fn test_client(cap: usize) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>, ClientHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            0,
            rx,
            ClientHandle {
                tx,
                queued: Arc::new(AtomicUsize::new(cap)),
            },
        )
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_client_in_order() {
        let mut clients = HashMap::new();
        let (id_a, mut rx_a, handle_a) = test_client(0);
        clients.insert(id_a, handle_a);
        let (_, mut rx_b, handle_b) = test_client(0);
        clients.insert(1, handle_b);

        fan_out(&mut clients, b"first");
        fan_out(&mut clients, b"second");

        assert_eq!(rx_a.recv().await.unwrap(), b"first");
        assert_eq!(rx_a.recv().await.unwrap(), b"second");
        assert_eq!(rx_b.recv().await.unwrap(), b"first");
        assert_eq!(rx_b.recv().await.unwrap(), b"second");
        assert_eq!(clients.len(), 2);
    }

    #[tokio::test]
    async fn fan_out_drops_client_once_queue_bound_exceeded() {
        let mut clients = HashMap::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        // Pretend this client's queue is already at the bound: the next
        // chunk, however small, must push it over and drop it.
        clients.insert(
            0,
            ClientHandle {
                tx,
                queued: Arc::new(AtomicUsize::new(CLIENT_QUEUE_BOUND)),
            },
        );
        fan_out(&mut clients, b"x");
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn fan_out_drops_client_whose_receiver_is_gone() {
        let mut clients = HashMap::new();
        let (id, rx, handle) = test_client(0);
        drop(rx);
        clients.insert(id, handle);
        fan_out(&mut clients, b"data");
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn attach_snapshot_and_registration_are_atomic() {
        let shared: SharedState = Arc::new(Mutex::new(Shared {
            replay: ReplayBuffer::new(REPLAY_BUFFER_SIZE),
            clients: HashMap::new(),
        }));
        shared.lock().await.replay.push(b"before attach");

        let snapshot = {
            let mut guard = shared.lock().await;
            let snapshot = guard.replay.snapshot();
            guard.clients.insert(0, test_client(0).2);
            snapshot
        };

        assert_eq!(snapshot, b"before attach");
        assert_eq!(shared.lock().await.clients.len(), 1);
    }
}
