use std::{sync::Arc, time::Duration};

use browserchannel::{
    socket::{Affinity, ReadyState},
    BcError, BcSocket, ErrorCode, QueuedMap, SocketHandler, SocketOptions,
};
use serde_json::{json, Value};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::{sleep, Instant},
};

mod common;
use common::*;

#[derive(Debug, Clone, PartialEq)]
enum SocketEvent {
    Connecting,
    Open,
    Message(Value),
    Error(ErrorCode),
    Close(String),
}

struct SocketRecorder {
    events: UnboundedSender<SocketEvent>,
}

impl SocketHandler for SocketRecorder {
    fn on_connecting(&mut self) {
        let _ = self.events.send(SocketEvent::Connecting);
    }

    fn on_open(&mut self) {
        let _ = self.events.send(SocketEvent::Open);
    }

    fn on_message(&mut self, message: Value) {
        let _ = self.events.send(SocketEvent::Message(message));
    }

    fn on_error(&mut self, _message: &str, code: ErrorCode) {
        let _ = self.events.send(SocketEvent::Error(code));
    }

    fn on_close(&mut self, message: &str, _pending: Vec<QueuedMap>, _undelivered: Vec<QueuedMap>) {
        let _ = self.events.send(SocketEvent::Close(message.to_string()));
    }
}

fn open_socket(
    transport: &MockTransport,
    options: SocketOptions,
) -> anyhow::Result<(BcSocket, UnboundedReceiver<SocketEvent>)> {
    init_tracing();
    let (events, rx) = unbounded_channel();
    let socket = BcSocket::open(
        config(),
        options,
        Arc::new(transport.clone()),
        SocketRecorder { events },
    )?;
    Ok((socket, rx))
}

fn reconnecting() -> SocketOptions {
    SocketOptions {
        reconnect: true,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn server_stop_is_final() -> anyhow::Result<()> {
    let transport = scripted(Script {
        back: [Reply::steps(vec![
            Step::Data(chunk(r#"[[1,["stop"]]]"#)),
            Step::Hang,
        ])]
        .into(),
        ..Default::default()
    });
    let (socket, mut events) = open_socket(&transport, reconnecting())?;

    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);
    assert_eq!(next(&mut events).await, SocketEvent::Error(ErrorCode::Stop));
    assert_eq!(
        next(&mut events).await,
        SocketEvent::Close(ErrorCode::Stop.message().to_string())
    );

    sleep(Duration::from_secs(10)).await;
    assert_eq!(socket.ready_state(), ReadyState::Closed);
    assert_eq!(transport.matching(is_open).len(), 1);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_session_reconnects_at_once() -> anyhow::Result<()> {
    let transport = scripted(Script {
        back: [Reply::status(400, "Unknown SID")].into(),
        ..Default::default()
    });
    let (socket, mut events) = open_socket(&transport, reconnecting())?;

    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);
    assert_eq!(
        next(&mut events).await,
        SocketEvent::Error(ErrorCode::UnknownSessionId)
    );
    assert_eq!(
        next(&mut events).await,
        SocketEvent::Close(ErrorCode::UnknownSessionId.message().to_string())
    );
    let closed_at = Instant::now();
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);
    assert!(closed_at.elapsed() < Duration::from_secs(3));
    assert_eq!(socket.ready_state(), ReadyState::Open);

    // The second session reuses the first one's test results
    assert_eq!(transport.matching(is_init).len(), 1);
    let open = transport.matching(is_open);
    assert_eq!(open.len(), 2);
    assert_eq!(open[0].param("OSID"), None);
    assert_eq!(open[1].param("OSID").as_deref(), Some("sid1"));
    assert_eq!(open[1].param("OAID").as_deref(), Some("0"));

    let affinity = socket.affinity().map(str::to_owned);
    assert!(affinity.is_some());
    assert!(open.iter().all(|r| r.param("a") == affinity));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_is_reported_once_and_blocks_sends() -> anyhow::Result<()> {
    let transport = scripted(Script::default());
    let (socket, mut events) = open_socket(&transport, reconnecting())?;
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);

    socket.close().await?;
    assert_eq!(next(&mut events).await, SocketEvent::Close("Closed".to_string()));
    assert_eq!(socket.ready_state(), ReadyState::Closed);
    assert!(matches!(socket.send("late").await, Err(BcError::SocketClosed)));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.matching(is_open).len(), 1);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reopen_starts_a_new_session() -> anyhow::Result<()> {
    let transport = scripted(Script::default());
    let options = SocketOptions {
        affinity: Affinity::Disabled,
        ..Default::default()
    };
    let (socket, mut events) = open_socket(&transport, options)?;
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);
    assert!(matches!(socket.reopen(), Err(BcError::SocketOpen)));

    socket.close().await?;
    assert_eq!(next(&mut events).await, SocketEvent::Close("Closed".to_string()));

    socket.reopen()?;
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);
    let open = transport.matching(is_open);
    assert_eq!(open.len(), 2);
    assert_eq!(open[1].param("OSID").as_deref(), Some("sid1"));
    assert!(open.iter().all(|r| r.param("a").is_none()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn messages_travel_both_ways() -> anyhow::Result<()> {
    let transport = scripted(Script {
        back: [Reply::steps(vec![
            Step::Wait(Duration::from_secs(1)),
            Step::Data(chunk(r#"[[1,{"k":"v"}]]"#)),
            Step::Hang,
        ])]
        .into(),
        ..Default::default()
    });
    let (socket, mut events) = open_socket(&transport, SocketOptions::default())?;
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);

    socket.send("hi").await?;
    socket.send(json!({"x": 1})).await?;
    assert_eq!(
        next(&mut events).await,
        SocketEvent::Message(json!({"k": "v"}))
    );

    sleep(Duration::from_secs(1)).await;
    let bodies: Vec<String> = transport
        .matching(is_forward)
        .into_iter()
        .filter_map(|r| r.body)
        .collect();
    assert!(bodies.iter().any(|b| b.contains("__S=hi")));
    assert!(bodies
        .iter()
        .any(|b| b.contains("_JSON=%7B%22x%22%3A1%7D")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_during_reachability_check_stays_closed() -> anyhow::Result<()> {
    let transport = scripted(Script {
        stage1: Reply::status(503, ""),
        network_test: Reply::hang(),
        ..Default::default()
    });
    let (socket, mut events) = open_socket(&transport, reconnecting())?;
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.matching(is_network_test).len(), 1);
    socket.close().await?;
    assert_eq!(next(&mut events).await, SocketEvent::Close("Closed".to_string()));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(socket.ready_state(), ReadyState::Closed);
    assert_eq!(transport.matching(is_init).len(), 1);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sessions_draw_fresh_cache_busters() -> anyhow::Result<()> {
    let transport = scripted(Script {
        back: [Reply::status(400, "Unknown SID")].into(),
        ..Default::default()
    });
    let (_socket, mut events) = open_socket(&transport, reconnecting())?;
    loop {
        if let SocketEvent::Close(_) = next(&mut events).await {
            break;
        }
    }
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);

    let open = transport.matching(is_open);
    assert_eq!(open.len(), 2);
    assert_ne!(open[0].param("zx"), open[1].param("zx"));
    assert_ne!(open[0].param("RID"), open[1].param("RID"));
    Ok(())
}

/// Recorder whose `on_message` panics on `"boom"`
struct Explosive(SocketRecorder);

impl SocketHandler for Explosive {
    fn on_connecting(&mut self) {
        self.0.on_connecting()
    }

    fn on_open(&mut self) {
        self.0.on_open()
    }

    fn on_message(&mut self, message: Value) {
        if message == json!("boom") {
            panic!("socket handler failure");
        }
        self.0.on_message(message)
    }

    fn on_error(&mut self, message: &str, code: ErrorCode) {
        self.0.on_error(message, code)
    }

    fn on_close(&mut self, message: &str, pending: Vec<QueuedMap>, undelivered: Vec<QueuedMap>) {
        self.0.on_close(message, pending, undelivered)
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_socket_handler_keeps_socket_usable() -> anyhow::Result<()> {
    init_tracing();
    let transport = scripted(Script {
        back: [Reply::steps(vec![
            Step::Data(chunk(r#"[[1,"boom"],[2,"after"]]"#)),
            Step::Hang,
        ])]
        .into(),
        ..Default::default()
    });
    let (tx, mut events) = unbounded_channel();
    let socket = BcSocket::open(
        config(),
        SocketOptions::default(),
        Arc::new(transport.clone()),
        Explosive(SocketRecorder { events: tx }),
    )?;
    assert_eq!(next(&mut events).await, SocketEvent::Connecting);
    assert_eq!(next(&mut events).await, SocketEvent::Open);
    assert_eq!(next(&mut events).await, SocketEvent::Message(json!("after")));
    assert_eq!(socket.ready_state(), ReadyState::Open);

    socket.send("still here").await?;
    socket.close().await?;
    assert_eq!(next(&mut events).await, SocketEvent::Close("Closed".to_string()));
    assert_eq!(socket.ready_state(), ReadyState::Closed);
    Ok(())
}
