// tests/socket_transport.rs

mod common;

use std::time::{Duration, Instant};

use common::{echo_bin, fast_settings, init_tracing, with_timeout};
use ipcrun::errors::{ErrorKind, IpcError};
use ipcrun::transport::{Communicator, CommunicatorEvent, LaunchSpec, SocketCommunicator};
use ipcrun::types::IpcMode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn launch(args: &[&str]) -> LaunchSpec {
    LaunchSpec {
        interpreter: echo_bin(),
        args: args.iter().map(|s| s.to_string()).collect(),
        mode: IpcMode::LocalSocket,
    }
}

fn communicator() -> (SocketCommunicator, mpsc::Receiver<CommunicatorEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (SocketCommunicator::new(fast_settings(), tx), rx)
}

async fn next_output(rx: &mut mpsc::Receiver<CommunicatorEvent>) -> String {
    loop {
        match rx.recv().await {
            Some(CommunicatorEvent::Output(line)) => return line,
            Some(_) => continue,
            None => panic!("event channel closed before output"),
        }
    }
}

#[tokio::test]
async fn session_supports_several_messages() {
    init_tracing();
    let (comm, mut rx) = communicator();

    comm.start(&launch(&["--prefix", "echo:"]), CancellationToken::new())
        .await
        .unwrap();
    assert!(comm.is_connected());

    for msg in ["one", "", "three"] {
        comm.send(msg, CancellationToken::new()).await.unwrap();
        let line = with_timeout(next_output(&mut rx)).await;
        assert_eq!(line, format!("echo:{msg}"));
    }

    comm.stop().await;
}

#[tokio::test]
async fn stop_lets_a_connected_child_exit_voluntarily() {
    init_tracing();
    let (comm, mut rx) = communicator();

    comm.start(&launch(&["--exit-code", "4"]), CancellationToken::new())
        .await
        .unwrap();
    comm.send("bye", CancellationToken::new()).await.unwrap();
    assert_eq!(with_timeout(next_output(&mut rx)).await, "bye");

    let started = Instant::now();
    with_timeout(comm.stop()).await;
    // EOF on the socket ends the child well inside the grace window.
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn child_that_never_connects_times_out_within_bound() {
    init_tracing();
    let (comm, _rx) = communicator();
    let settings = fast_settings();

    let started = Instant::now();
    let err = with_timeout(comm.start(&launch(&["--no-connect"]), CancellationToken::new()))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, IpcError::ConnectTimeout(_)));
    assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
    assert!(elapsed >= settings.connect_timeout);
    assert!(elapsed < settings.connect_timeout + settings.kill_timeout + Duration::from_secs(1));
    assert!(comm.port().is_none());
    assert!(comm.pid().is_none());
}

#[tokio::test]
async fn child_exiting_before_connect_is_a_start_failure() {
    init_tracing();
    let (comm, mut rx) = communicator();

    let spec = launch(&[
        "--stderr",
        "cannot import module",
        "--exit-code",
        "7",
        "--no-connect",
        "--exit-immediately",
    ]);
    let err = with_timeout(comm.start(&spec, CancellationToken::new()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StartFailure);
    assert_eq!(err.exit_code(), Some(7));

    // Early stderr is still surfaced for diagnostics.
    let line = with_timeout(async {
        loop {
            match rx.recv().await {
                Some(CommunicatorEvent::Error(line)) => break line,
                Some(_) => continue,
                None => panic!("event channel closed before stderr line"),
            }
        }
    })
    .await;
    assert_eq!(line, "cannot import module");
}

#[tokio::test]
async fn canceled_send_never_leaves_a_partial_frame() {
    init_tracing();
    let (comm, mut rx) = communicator();
    // The child reads nothing for a while, so a large write blocks midway.
    comm.start(&launch(&["--read-delay-ms", "1500"]), CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let big = "x".repeat(32 * 1024 * 1024);
    let (canceled, ()) = tokio::join!(comm.send(&big, cancel.clone()), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    assert!(canceled.unwrap_err().is_canceled());

    with_timeout(comm.send("hello", CancellationToken::new()))
        .await
        .unwrap();

    // The big frame arrives whole and is over the line limit; "hello" follows
    // as its own line.
    let mut oversized = 0;
    let line = with_timeout(async {
        loop {
            match rx.recv().await {
                Some(CommunicatorEvent::Output(line)) => break line,
                Some(CommunicatorEvent::Error(msg)) if msg.contains("exceeds") => oversized += 1,
                Some(other) => panic!("unexpected event {other:?}"),
                None => panic!("event channel closed before output"),
            }
        }
    })
    .await;
    assert_eq!(line, "hello");
    assert_eq!(oversized, 1);

    comm.send("again", CancellationToken::new()).await.unwrap();
    assert_eq!(with_timeout(next_output(&mut rx)).await, "again");
    comm.stop().await;
}

#[tokio::test]
async fn already_canceled_send_writes_nothing() {
    init_tracing();
    let (comm, mut rx) = communicator();
    comm.start(&launch(&[]), CancellationToken::new()).await.unwrap();

    let canceled = CancellationToken::new();
    canceled.cancel();
    let err = comm.send("dropped", canceled).await.unwrap_err();
    assert!(err.is_canceled());

    comm.send("still here", CancellationToken::new()).await.unwrap();
    assert_eq!(with_timeout(next_output(&mut rx)).await, "still here");
    comm.stop().await;
}

#[tokio::test]
async fn stop_interrupts_a_blocked_send() {
    init_tracing();
    let (comm, _rx) = communicator();
    comm.start(&launch(&["--read-delay-ms", "10000"]), CancellationToken::new())
        .await
        .unwrap();

    let big = "x".repeat(64 * 1024 * 1024);
    let (inflight, ()) = tokio::join!(comm.send(&big, CancellationToken::new()), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        with_timeout(comm.stop()).await;
    });

    assert_eq!(inflight.unwrap_err().kind(), ErrorKind::NotRunning);
    assert!(!comm.is_connected());
    assert!(comm.pid().is_none());

    let err = comm.send("late", CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}

#[tokio::test]
async fn canceling_start_releases_the_port_and_allows_restart() {
    init_tracing();
    let (comm, _rx) = communicator();
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };
    let err = comm
        .start(&launch(&["--no-connect"]), cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(err.is_canceled());
    assert!(comm.port().is_none());

    comm.start(&launch(&[]), CancellationToken::new())
        .await
        .expect("restart after cancel");
    assert!(comm.port().is_some());
    comm.stop().await;
    assert!(comm.port().is_none());
}

#[tokio::test]
async fn repeated_stop_is_a_no_op() {
    let (comm, _rx) = communicator();
    comm.start(&launch(&[]), CancellationToken::new()).await.unwrap();

    with_timeout(async {
        tokio::join!(comm.stop(), comm.stop());
        comm.stop().await;
    })
    .await;

    let err = comm.send("x", CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}

#[tokio::test]
async fn stdio_launch_spec_is_rejected() {
    let (comm, _rx) = communicator();
    let mut spec = launch(&[]);
    spec.mode = IpcMode::StandardStream;

    let err = comm.start(&spec, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
