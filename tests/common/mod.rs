#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use browserchannel::{
    error::TransportError,
    transport::{Exchange, HttpRequest, Method, Transport, TransportEvent},
    ChannelConfig, ErrorCode, Handler, OutgoingMap, QueuedMap,
};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::{sleep_until, Instant},
};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> ChannelConfig {
    let mut config = ChannelConfig::new("http://localhost/channel").unwrap();
    config.seed = 42;
    config
}

pub fn map(pairs: &[(&str, &str)]) -> OutgoingMap {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Frames a payload the way the backward channel does
pub fn chunk(payload: &str) -> String {
    format!("{}\n{}", payload.len(), payload)
}

#[derive(Debug, Clone)]
pub enum Step {
    Wait(Duration),
    Data(String),
    Hang,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub steps: Vec<Step>,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            steps: vec![Step::Data(body.into())],
        }
    }

    pub fn steps(steps: Vec<Step>) -> Self {
        Self { status: 200, steps }
    }

    pub fn hang() -> Self {
        Self::steps(vec![Step::Hang])
    }
}

type Route = Box<dyn FnMut(&HttpRequest) -> Reply + Send>;

struct MockServer {
    route: Mutex<Route>,
    requests: Mutex<Vec<HttpRequest>>,
    aborts: AtomicUsize,
}

/// Transport answering from a route function and recording every request
#[derive(Clone)]
pub struct MockTransport {
    server: Arc<MockServer>,
}

impl MockTransport {
    pub fn new(route: impl FnMut(&HttpRequest) -> Reply + Send + 'static) -> Self {
        Self {
            server: Arc::new(MockServer {
                route: Mutex::new(Box::new(route)),
                requests: Mutex::new(Vec::new()),
                aborts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.server.requests.lock().unwrap().clone()
    }

    pub fn matching(&self, pred: impl Fn(&HttpRequest) -> bool) -> Vec<HttpRequest> {
        self.requests().into_iter().filter(|r| pred(r)).collect()
    }

    pub fn aborts(&self) -> usize {
        self.server.aborts.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&self, request: HttpRequest) -> Box<dyn Exchange> {
        self.server.requests.lock().unwrap().push(request.clone());
        let reply = {
            let mut route = self.server.route.lock().unwrap();
            (*route)(&request)
        };
        Box::new(MockExchange {
            status: Some(reply.status),
            steps: reply.steps.into(),
            deadline: None,
            server: self.server.clone(),
        })
    }
}

struct MockExchange {
    status: Option<u16>,
    steps: VecDeque<Step>,
    deadline: Option<Instant>,
    server: Arc<MockServer>,
}

#[async_trait]
impl Exchange for MockExchange {
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        if let Some(status) = self.status.take() {
            return Ok(TransportEvent::Status(status));
        }
        loop {
            match self.steps.front().cloned() {
                None => return Ok(TransportEvent::Done),
                Some(Step::Data(text)) => {
                    self.steps.pop_front();
                    return Ok(TransportEvent::Data(Bytes::from(text)));
                }
                Some(Step::Wait(delay)) => {
                    let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + delay);
                    sleep_until(deadline).await;
                    self.deadline = None;
                    self.steps.pop_front();
                }
                Some(Step::Hang) => std::future::pending::<()>().await,
            }
        }
    }

    fn abort(&mut self) {
        self.server.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn is_init(request: &HttpRequest) -> bool {
    request.uri.path().ends_with("/test") && request.param("MODE").as_deref() == Some("init")
}

pub fn is_open(request: &HttpRequest) -> bool {
    request.method == Method::Post && request.param("SID").is_none()
}

pub fn is_forward(request: &HttpRequest) -> bool {
    request.method == Method::Post && request.param("SID").is_some()
}

pub fn is_back(request: &HttpRequest) -> bool {
    request.method == Method::Get && request.param("RID").as_deref() == Some("rpc")
}

/// Server behaviour for a scripted session
pub struct Script {
    pub stage1: Reply,
    pub stage2: Reply,
    /// Forward POST answers in order, `forward_default` once exhausted
    pub forward: VecDeque<Reply>,
    pub forward_default: Reply,
    /// Backward GET answers in order, hanging once exhausted
    pub back: VecDeque<Reply>,
    /// Answer of the general reachability check
    pub network_test: Reply,
    /// Answer of the blocked prefix image
    pub blocked_image: Reply,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            stage1: Reply::ok(r#"["prefix",null]"#),
            stage2: Reply::steps(vec![
                Step::Data("11111".to_string()),
                Step::Wait(Duration::from_secs(2)),
                Step::Data("2".to_string()),
            ]),
            forward: VecDeque::new(),
            forward_default: Reply::ok("[1,0,0]"),
            back: VecDeque::new(),
            network_test: Reply::ok(""),
            blocked_image: Reply::ok(""),
        }
    }
}

pub fn is_blocked_image(request: &HttpRequest) -> bool {
    request.uri.path() == "/mail/images/cleardot.gif"
}

pub fn is_network_test(request: &HttpRequest) -> bool {
    request.uri.host_str() == Some("www.google.com")
}

/// Session ids are `sid1`, `sid2`, ... per open request
pub fn scripted(mut script: Script) -> MockTransport {
    let mut opens = 0;
    MockTransport::new(move |request| {
        if is_network_test(request) {
            return script.network_test.clone();
        }
        if is_blocked_image(request) {
            return script.blocked_image.clone();
        }
        if request.uri.path().ends_with("/test") {
            return if is_init(request) {
                script.stage1.clone()
            } else {
                script.stage2.clone()
            };
        }
        if request.param("TYPE").as_deref() == Some("terminate") {
            return Reply::ok("");
        }
        if is_open(request) {
            opens += 1;
            return Reply::ok(format!(r#"[[0,["c","sid{opens}","",8]]]"#));
        }
        if is_forward(request) {
            return script
                .forward
                .pop_front()
                .unwrap_or_else(|| script.forward_default.clone());
        }
        if is_back(request) {
            return script.back.pop_front().unwrap_or_else(Reply::hang);
        }
        Reply::status(404, "")
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Opened,
    Array(Value),
    Error(ErrorCode),
    Closed {
        pending: Vec<QueuedMap>,
        undelivered: Vec<QueuedMap>,
    },
}

pub struct Recorder {
    events: UnboundedSender<Event>,
}

pub fn recorder() -> (Recorder, UnboundedReceiver<Event>) {
    let (events, rx) = unbounded_channel();
    (Recorder { events }, rx)
}

impl Handler for Recorder {
    fn channel_opened(&mut self) {
        let _ = self.events.send(Event::Opened);
    }

    fn channel_handle_array(&mut self, array: Value) {
        let _ = self.events.send(Event::Array(array));
    }

    fn channel_error(&mut self, code: ErrorCode) {
        let _ = self.events.send(Event::Error(code));
    }

    fn channel_closed(&mut self, pending: Vec<QueuedMap>, undelivered: Vec<QueuedMap>) {
        let _ = self.events.send(Event::Closed {
            pending,
            undelivered,
        });
    }
}

pub async fn next<T>(events: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event source dropped")
}

/// Absolute map ids carried by a forward body
pub fn batch_ids(body: &str) -> Vec<u64> {
    let field = |name: &str| {
        body.split('&')
            .find_map(|pair| pair.strip_prefix(name))
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    };
    let count = field("count=");
    let offset = field("ofs=");
    (offset..offset + count).collect()
}
