// tests/coordinator_fake.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, with_timeout};
use ipcrun::engine::{Coordinator, LifecycleState, RunEvent, RunId, RunOutcome};
use ipcrun::errors::ErrorKind;
use ipcrun::transport::ExitSignal;
use ipcrun::types::IpcMode;
use ipcrun_test_utils::{FakeFactory, FakeScript, FakeStart, RequestBuilder};
use tokio::sync::mpsc::UnboundedReceiver;

fn request() -> ipcrun::types::RunRequest {
    RequestBuilder::new("fake-interpreter")
        .payload(r#"{"value":"ping"}"#)
        .build()
}

/// Receive events until the coordinator reports Idle after a `Finished`.
async fn until_idle(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    let mut finished = false;
    while let Some(event) = rx.recv().await {
        let idle = event == RunEvent::StateChanged(LifecycleState::Idle);
        if matches!(event, RunEvent::Finished { .. }) {
            finished = true;
        }
        seen.push(event);
        if finished && idle {
            break;
        }
    }
    seen
}

fn finished_count(events: &[RunEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::Finished { .. }))
        .count()
}

#[tokio::test]
async fn exit_after_payload_produces_one_finished_then_idle() {
    init_tracing();
    let (factory, stats) = FakeFactory::new(FakeScript {
        replies: vec!["pong".into()],
        exit_after_send: Some(0),
        ..Default::default()
    });
    let (coordinator, mut rx) = Coordinator::new(factory);

    let id = with_timeout(coordinator.run(request())).await.unwrap();
    let events = with_timeout(until_idle(&mut rx)).await;

    assert_eq!(
        events,
        vec![
            RunEvent::StateChanged(LifecycleState::Starting),
            RunEvent::StateChanged(LifecycleState::Running),
            RunEvent::Output {
                run: id,
                line: "pong".into()
            },
            RunEvent::Finished {
                run: id,
                outcome: RunOutcome::Exited(ExitSignal { exit_code: 0 }),
            },
            RunEvent::StateChanged(LifecycleState::Idle),
        ]
    );

    with_timeout(coordinator.stop()).await;
    assert_eq!(stats.teardowns(), 1);
    assert_eq!(stats.sent(), vec![r#"{"value":"ping"}"#.to_string()]);
    assert_eq!(coordinator.state(), LifecycleState::Idle);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn exit_during_startup_is_reported_as_start_failure() {
    init_tracing();
    let (factory, stats) = FakeFactory::new(FakeScript {
        start: FakeStart::ExitDuringStartup(9),
        ..Default::default()
    });
    let (coordinator, mut rx) = Coordinator::new(factory);

    let err = with_timeout(coordinator.run(request())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StartFailure);
    assert_eq!(err.exit_code(), Some(9));

    let events = with_timeout(until_idle(&mut rx)).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], RunEvent::StateChanged(LifecycleState::Starting));
    assert!(matches!(
        &events[1],
        RunEvent::Finished {
            outcome: RunOutcome::Failed {
                kind: ErrorKind::StartFailure,
                ..
            },
            ..
        }
    ));
    assert!(stats.sent().is_empty());
    assert_eq!(stats.teardowns(), 1);
}

#[tokio::test]
async fn connect_timeout_keeps_its_kind() {
    let (factory, _stats) = FakeFactory::new(FakeScript {
        start: FakeStart::Timeout,
        ..Default::default()
    });
    let (coordinator, mut rx) = Coordinator::new(factory);

    let err = with_timeout(coordinator.run(request())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectTimeout);

    let events = with_timeout(until_idle(&mut rx)).await;
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Finished {
            outcome: RunOutcome::Failed {
                kind: ErrorKind::ConnectTimeout,
                ..
            },
            ..
        }
    )));
}

#[tokio::test]
async fn cancel_while_starting_finishes_as_canceled() {
    init_tracing();
    let (factory, stats) = FakeFactory::new(FakeScript {
        start: FakeStart::Hang,
        ..Default::default()
    });
    let (coordinator, mut rx) = Coordinator::new(factory);
    let coordinator = Arc::new(coordinator);

    let runner = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run(request()).await })
    };

    let first = with_timeout(rx.recv()).await;
    assert_eq!(first, Some(RunEvent::StateChanged(LifecycleState::Starting)));
    coordinator.cancel();

    let err = with_timeout(runner).await.unwrap().unwrap_err();
    assert!(err.is_canceled());

    let events = with_timeout(until_idle(&mut rx)).await;
    assert!(matches!(
        events.as_slice(),
        [
            RunEvent::Finished {
                outcome: RunOutcome::Canceled,
                ..
            },
            RunEvent::StateChanged(LifecycleState::Idle),
        ]
    ));
    assert_eq!(stats.teardowns(), 1);
}

#[tokio::test]
async fn cancel_while_running_tears_down_once() {
    init_tracing();
    let (factory, stats) = FakeFactory::new(FakeScript::default());
    let (coordinator, mut rx) = Coordinator::new(factory);

    let id = with_timeout(coordinator.run(request())).await.unwrap();
    assert_eq!(coordinator.state(), LifecycleState::Running);

    coordinator.cancel();
    let events = with_timeout(until_idle(&mut rx)).await;
    assert!(events.contains(&RunEvent::Finished {
        run: id,
        outcome: RunOutcome::Canceled,
    }));
    assert_eq!(finished_count(&events), 1);

    with_timeout(coordinator.stop()).await;
    assert_eq!(stats.teardowns(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn cancel_during_send_fails_the_run_as_canceled() {
    let (factory, stats) = FakeFactory::new(FakeScript {
        send_delay: Duration::from_secs(5),
        ..Default::default()
    });
    let (coordinator, mut rx) = Coordinator::new(factory);
    let coordinator = Arc::new(coordinator);

    let runner = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run(request()).await })
    };

    // Wait for Running so the payload write is in flight.
    loop {
        let event = with_timeout(rx.recv()).await;
        if event == Some(RunEvent::StateChanged(LifecycleState::Running)) {
            break;
        }
    }
    coordinator.cancel();

    let err = with_timeout(runner).await.unwrap().unwrap_err();
    assert!(err.is_canceled());

    let events = with_timeout(until_idle(&mut rx)).await;
    assert_eq!(finished_count(&events), 1);
    assert!(stats.sent().is_empty());
    with_timeout(coordinator.stop()).await;
    assert_eq!(stats.teardowns(), 1);
}

#[tokio::test]
async fn a_new_run_stops_the_previous_one() {
    init_tracing();
    let (factory, stats) = FakeFactory::new(FakeScript::default());
    let (coordinator, mut rx) = Coordinator::new(factory);

    let first = with_timeout(coordinator.run(request())).await.unwrap();
    let second = with_timeout(
        coordinator.run(
            RequestBuilder::new("fake-interpreter")
                .socket()
                .payload("again")
                .build(),
        ),
    )
    .await
    .unwrap();
    assert!(second > first);
    assert_eq!(coordinator.current_run(), Some(second));

    let events = with_timeout(until_idle(&mut rx)).await;
    assert_eq!(
        events,
        vec![
            RunEvent::StateChanged(LifecycleState::Starting),
            RunEvent::StateChanged(LifecycleState::Running),
            RunEvent::Finished {
                run: first,
                outcome: RunOutcome::Stopped,
            },
            RunEvent::StateChanged(LifecycleState::Idle),
        ]
    );
    assert_eq!(stats.teardowns(), 1);
    assert_eq!(stats.created(), 2);
    assert_eq!(
        *stats.modes.lock().unwrap(),
        vec![IpcMode::StandardStream, IpcMode::LocalSocket]
    );

    with_timeout(coordinator.stop()).await;
    assert_eq!(stats.teardowns(), 2);
}

#[tokio::test]
async fn stop_twice_emits_one_finished() {
    let (factory, stats) = FakeFactory::new(FakeScript::default());
    let (coordinator, mut rx) = Coordinator::new(factory);

    let id = with_timeout(coordinator.run(request())).await.unwrap();
    with_timeout(async {
        coordinator.stop().await;
        coordinator.stop().await;
    })
    .await;

    let events = with_timeout(until_idle(&mut rx)).await;
    assert_eq!(finished_count(&events), 1);
    assert!(events.contains(&RunEvent::Finished {
        run: id,
        outcome: RunOutcome::Stopped,
    }));
    assert!(rx.try_recv().is_err());
    assert_eq!(stats.teardowns(), 1);
    assert_eq!(coordinator.current_run(), None::<RunId>);
}

#[tokio::test]
async fn follow_up_messages_reach_a_running_session() {
    let (factory, stats) = FakeFactory::new(FakeScript {
        replies: vec!["ack".into()],
        ..Default::default()
    });
    let (coordinator, mut rx) = Coordinator::new(factory);

    let id = with_timeout(coordinator.run(request())).await.unwrap();
    with_timeout(coordinator.send("more")).await.unwrap();

    let ack = RunEvent::Output {
        run: id,
        line: "ack".into(),
    };
    let mut acks = 0;
    while acks < 2 {
        if with_timeout(rx.recv()).await == Some(ack.clone()) {
            acks += 1;
        }
    }

    with_timeout(coordinator.stop()).await;
    assert_eq!(
        stats.sent(),
        vec![r#"{"value":"ping"}"#.to_string(), "more".to_string()]
    );
}

#[tokio::test]
async fn send_without_a_run_is_not_running() {
    let (factory, _stats) = FakeFactory::new(FakeScript::default());
    let (coordinator, _rx) = Coordinator::new(factory);

    let err = coordinator.send("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}
