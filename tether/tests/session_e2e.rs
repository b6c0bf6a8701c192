//! End-to-end scenarios driving a real master over a real Unix socket and
//! pty, using hand-rolled wire frames to play the attacher's role (a full
//! [`tether::attach_main`] needs a controlling terminal on fd 0, which a
//! test harness does not have).
#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use tempfile::tempdir;
use tether::config::MasterConfig;
use tether_proto::{AttachAck, AttachHello, ClientFrame, MasterFrame, RedrawMethod};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Connects to `path`, completes the attach handshake, and returns the
/// stream ready to exchange `ClientFrame`/`MasterFrame` messages.
async fn raw_attach(path: &std::path::Path) -> UnixStream {
    let mut stream = UnixStream::connect(path).await.expect("connect");
    tether_proto::send(
        &mut stream,
        &AttachHello {
            protocol_version: tether_proto::PROTOCOL_VERSION,
            redraw_method: RedrawMethod::None,
            rows: 24,
            cols: 80,
            xpixels: 0,
            ypixels: 0,
        },
    )
    .await
    .expect("send hello");
    match tether_proto::recv::<AttachAck>(&mut stream).await.expect("recv ack") {
        AttachAck::Accepted => {}
        AttachAck::Error(e) => panic!("handshake rejected: {e}"),
    }
    stream
}

/// Accumulates `MasterFrame::Data`/`Replay` payloads until `needle` appears
/// somewhere in the concatenated bytes, or the timeout elapses. Accumulating
/// rather than checking frame-by-frame avoids a false timeout when the pty
/// happens to split `needle` across two reads.
async fn recv_contains(stream: &mut UnixStream, needle: &[u8]) {
    timeout(Duration::from_secs(10), async {
        let mut acc = Vec::new();
        loop {
            let frame: MasterFrame = tether_proto::recv(stream).await.expect("recv frame");
            match frame {
                MasterFrame::Data(d) | MasterFrame::Replay(d) => acc.extend_from_slice(&d),
                MasterFrame::SessionEnded { .. } => {}
            }
            if acc.windows(needle.len()).any(|w| w == needle) {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", String::from_utf8_lossy(needle)));
}

/// Covers the master side of a create-and-echo round trip (the
/// pty-echo/detach-key portion is exercised by `attach::tests`): data
/// written by a client reaches `/bin/cat` and its echo comes back in order.
#[tokio::test]
async fn create_and_echo_round_trip() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("t.sock");

    let config = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec!["/bin/cat".into()],
        require_new: true,
        initial_termios: None,
    };
    let master = tokio::spawn(async move { tether::master_main(&config).await });

    wait_for_socket(&socket_path).await;
    let mut client = raw_attach(&socket_path).await;

    tether_proto::send(&mut client, &ClientFrame::Data(b"hello\n".to_vec()))
        .await
        .unwrap();

    recv_contains(&mut client, b"hello").await;

    drop(client);
    master.abort();
    let _ = std::fs::remove_file(&socket_path);
}

/// Two clients attached to the same child see the same bytes, in order.
#[tokio::test]
async fn multi_attach_fan_out_sees_same_bytes_in_order() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("fanout.sock");

    let config = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec![
            "/bin/sh".into(),
            "-c".into(),
            "while read -r l; do echo got:$l; done".into(),
        ],
        require_new: true,
        initial_termios: None,
    };
    let master = tokio::spawn(async move { tether::master_main(&config).await });

    wait_for_socket(&socket_path).await;
    let mut a = raw_attach(&socket_path).await;
    let mut b = raw_attach(&socket_path).await;

    tether_proto::send(&mut a, &ClientFrame::Data(b"foo\n".to_vec()))
        .await
        .unwrap();

    recv_contains(&mut a, b"got:foo").await;
    recv_contains(&mut b, b"got:foo").await;

    master.abort();
    let _ = std::fs::remove_file(&socket_path);
}

/// A client that never drains its outbound queue does not stall the
/// session for everyone else — client A keeps receiving `/bin/cat`'s echo of
/// a multi-megabyte burst while client B never reads a single byte.
#[tokio::test]
async fn slow_client_does_not_stall_session() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("slow.sock");

    let config = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec!["/bin/cat".into()],
        require_new: true,
        initial_termios: None,
    };
    let master = tokio::spawn(async move { tether::master_main(&config).await });

    wait_for_socket(&socket_path).await;
    let mut a = raw_attach(&socket_path).await;
    let _b = raw_attach(&socket_path).await; // never read from again

    // A few hundred KB, well past the per-client queue bound, so B's queue
    // overflows and it gets dropped while A keeps draining.
    for _ in 0..40 {
        tether_proto::send(&mut a, &ClientFrame::Data(vec![b'x'; 8192]))
            .await
            .unwrap();
    }
    tether_proto::send(&mut a, &ClientFrame::Data(b"END-OF-BURST".to_vec()))
        .await
        .unwrap();

    recv_contains(&mut a, b"END-OF-BURST").await;

    master.abort();
    let _ = std::fs::remove_file(&socket_path);
}

/// A second create-mode master on the same live socket path fails with
/// `SocketInUse` rather than producing two masters for one path.
#[tokio::test]
async fn second_master_on_live_socket_is_rejected() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("live.sock");

    let config = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec!["/bin/cat".into()],
        require_new: true,
        initial_termios: None,
    };
    let master = tokio::spawn(async move { tether::master_main(&config).await });
    wait_for_socket(&socket_path).await;

    let second = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec!["/bin/cat".into()],
        require_new: true,
        initial_termios: None,
    };
    let err = tether::master_main(&second).await.unwrap_err();
    assert!(matches!(err, tether::Error::SocketInUse { .. }));

    master.abort();
    let _ = std::fs::remove_file(&socket_path);
}

/// A stale regular file at the socket path is reclaimed rather than
/// treated as a live master.
#[tokio::test]
async fn stale_socket_file_is_reclaimed() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("stale.sock");
    std::fs::write(&socket_path, b"not a socket").unwrap();

    let config = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec!["/bin/cat".into()],
        require_new: true,
        initial_termios: None,
    };
    let master = tokio::spawn(async move { tether::master_main(&config).await });
    wait_for_socket(&socket_path).await;

    let mut client = raw_attach(&socket_path).await;
    tether_proto::send(&mut client, &ClientFrame::Data(b"ok\n".to_vec()))
        .await
        .unwrap();
    recv_contains(&mut client, b"ok").await;

    master.abort();
    let _ = std::fs::remove_file(&socket_path);
}

/// The socket file is removed after the child exits and the master
/// returns, even though no client ever attached.
#[tokio::test]
async fn socket_removed_on_clean_exit() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("cleanup.sock");

    let config = MasterConfig {
        socket_path: socket_path.clone(),
        command: vec!["/bin/true".into()],
        require_new: true,
        initial_termios: None,
    };
    let code = timeout(Duration::from_secs(5), tether::master_main(&config))
        .await
        .expect("master_main did not return")
        .expect("master_main failed");
    assert_eq!(code, 0);
    assert!(!socket_path.exists());
}

/// Polls until the listening socket file appears, or panics after a
/// generous timeout — avoids a fixed sleep racing a slow CI host.
async fn wait_for_socket(path: &std::path::Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {path:?} never appeared");
}
