//! One HTTP exchange of the channel, driven by its own task.
//!
//! The task reports decoded data and exactly one terminal outcome back to the
//! channel loop, unless the [`Request`] handle is cancelled or dropped first.

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use random::Source;
use tokio::{
    select,
    sync::{mpsc::Sender, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use url::Url;

use crate::{
    chunk::{ChunkParser, ChunkStatus},
    error::RequestError,
    transport::{Exchange, HttpRequest, Method, Transport, TransportEvent},
};

pub type RequestId = u64;

/// How the response body is handed to the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every decoded chunk as soon as it is complete
    Chunked,
    /// The whole text received so far on every progress event
    Progressive,
    /// The whole body once the response is done
    Whole,
}

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub uri: Url,
    pub body: Option<String>,
    pub delivery: Delivery,
    pub timeout: Duration,
    pub attempt: u32,
    /// Minimum spacing of partial parses, chunked delivery only
    pub throttle: Option<Duration>,
    pub connection_close: bool,
}

impl RequestSpec {
    pub fn get(uri: Url, delivery: Delivery, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            uri,
            body: None,
            delivery,
            timeout,
            attempt: 1,
            throttle: None,
            connection_close: false,
        }
    }

    pub fn post(uri: Url, body: String, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            uri,
            body: Some(body),
            delivery: Delivery::Whole,
            timeout,
            attempt: 1,
            throttle: None,
            connection_close: false,
        }
    }
}

#[derive(Debug)]
pub struct RequestEvent {
    pub id: RequestId,
    pub kind: RequestEventKind,
}

#[derive(Debug)]
pub enum RequestEventKind {
    Data(String),
    Complete {
        status: Option<u16>,
        result: Result<(), RequestError>,
    },
}

/// Handle on a running request, dropping it cancels the exchange
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    started_at: Instant,
    attempt: u32,
    body_len: usize,
    cancel: Option<oneshot::Sender<()>>,
    _task: JoinHandle<()>,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Aborts the exchange, no further events of this request are sent
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            tracing::trace!(request = self.id, "Cancelling request");
            let _ = cancel.send(());
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Starts requests against one transport and tags them with fresh ids
pub struct Requester {
    transport: Arc<dyn Transport>,
    events: Sender<RequestEvent>,
    headers: Vec<(String, String)>,
    random: random::Default,
    next_id: RequestId,
}

impl Requester {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: Sender<RequestEvent>,
        headers: Vec<(String, String)>,
        seed: u64,
    ) -> Self {
        Self {
            transport,
            events,
            headers,
            random: random::default(seed),
            next_id: 0,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn supports_streaming(&self) -> bool {
        self.transport.supports_streaming()
    }

    /// Builds the http request, stamping the attempt and a cache buster on the uri
    pub fn http_request(&mut self, spec: &RequestSpec) -> HttpRequest {
        let mut uri = spec.uri.clone();
        uri.query_pairs_mut()
            .append_pair("t", &spec.attempt.to_string())
            .append_pair("zx", &random_token(&mut self.random));

        let mut request = match (&spec.method, &spec.body) {
            (Method::Post, Some(body)) => HttpRequest::post(uri, body.clone()),
            (Method::Post, None) => HttpRequest::post(uri, String::new()),
            (Method::Get, _) => HttpRequest::get(uri),
        };
        request.headers.extend(self.headers.iter().cloned());
        if spec.connection_close && spec.method == Method::Get {
            request
                .headers
                .push(("Connection".to_string(), "close".to_string()));
        }
        request
    }

    pub fn start(&mut self, spec: RequestSpec) -> Request {
        let id = self.next_id;
        self.next_id += 1;

        let request = self.http_request(&spec);
        tracing::debug!(request = id, method = ?request.method, uri = %request.uri, "Starting request");
        let exchange = self.transport.send(request);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let body_len = spec.body.as_ref().map(String::len).unwrap_or(0);
        let attempt = spec.attempt;
        let task = tokio::spawn(drive(id, spec, exchange, cancel_rx, self.events.clone()));

        Request {
            id,
            started_at: Instant::now(),
            attempt,
            body_len,
            cancel: Some(cancel_tx),
            _task: task,
        }
    }
}

/// Base 36 rendering of a random u64
pub(crate) fn random_token(random: &mut random::Default) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut value = random.read::<u64>();
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    if out.is_empty() {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Accumulated body of one response and what has been handed out of it
struct ResponseReader {
    delivery: Delivery,
    body: BytesMut,
    parser: ChunkParser,
    delivered: usize,
}

impl ResponseReader {
    fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            body: BytesMut::new(),
            parser: ChunkParser::new(),
            delivered: 0,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Pieces ready for the channel before the response is done
    fn drain(&mut self) -> Result<Vec<String>, RequestError> {
        match self.delivery {
            Delivery::Chunked => {
                let mut chunks = Vec::new();
                loop {
                    match self.parser.next_chunk(&self.body) {
                        ChunkStatus::Ready(chunk) => chunks.push(chunk),
                        ChunkStatus::Incomplete => return Ok(chunks),
                        ChunkStatus::Invalid => return Err(RequestError::BadData),
                    }
                }
            }
            Delivery::Progressive if self.body.len() > self.delivered => {
                match std::str::from_utf8(&self.body) {
                    Ok(text) => {
                        self.delivered = self.body.len();
                        Ok(vec![text.to_owned()])
                    }
                    // Wait for the rest of a split code point
                    Err(_) => Ok(Vec::new()),
                }
            }
            Delivery::Progressive | Delivery::Whole => Ok(Vec::new()),
        }
    }

    /// Pieces left once the response is done
    fn finish(&mut self) -> Result<Vec<String>, RequestError> {
        match self.delivery {
            Delivery::Chunked => {
                if self.body.is_empty() {
                    return Err(RequestError::NoData);
                }
                let chunks = self.drain()?;
                if self.parser.has_unread(&self.body) {
                    return Err(RequestError::BadData);
                }
                Ok(chunks)
            }
            Delivery::Progressive => {
                let pieces = self.drain()?;
                if self.delivered < self.body.len() {
                    return Err(RequestError::BadData);
                }
                Ok(pieces)
            }
            Delivery::Whole => match std::str::from_utf8(&self.body) {
                Ok(text) => Ok(vec![text.to_owned()]),
                Err(_) => Err(RequestError::BadData),
            },
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

async fn drive(
    id: RequestId,
    spec: RequestSpec,
    mut exchange: Box<dyn Exchange>,
    mut cancel: oneshot::Receiver<()>,
    events: Sender<RequestEvent>,
) {
    let mut reader = ResponseReader::new(spec.delivery);
    let mut status = None;
    let mut watchdog = Instant::now() + spec.timeout;
    let mut flush_at: Option<Instant> = None;
    let mut last_parse: Option<Instant> = None;

    let result = loop {
        select! {
            biased;
            _ = &mut cancel => {
                exchange.abort();
                return;
            }
            _ = sleep_until(watchdog) => {
                tracing::debug!(request = id, "Request timed out");
                exchange.abort();
                break Err(RequestError::Timeout);
            }
            _ = sleep_until(flush_at.unwrap_or(watchdog)), if flush_at.is_some() => {
                flush_at = None;
                last_parse = Some(Instant::now());
                match reader.drain() {
                    Ok(pieces) => send_pieces(id, &events, pieces).await,
                    Err(e) => {
                        exchange.abort();
                        break Err(e);
                    }
                }
            }
            event = exchange.next_event() => match event {
                Ok(TransportEvent::Status(code)) => {
                    tracing::trace!(request = id, status = code, "Got response status");
                    status = Some(code);
                    watchdog = Instant::now() + spec.timeout;
                }
                Ok(TransportEvent::Data(bytes)) => {
                    watchdog = Instant::now() + spec.timeout;
                    reader.push(&bytes);
                    if status != Some(200) {
                        continue;
                    }
                    let now = Instant::now();
                    match (spec.throttle, last_parse) {
                        (Some(throttle), Some(last)) if now < last + throttle => {
                            flush_at.get_or_insert(last + throttle);
                        }
                        _ => {
                            last_parse = Some(now);
                            flush_at = None;
                            match reader.drain() {
                                Ok(pieces) => send_pieces(id, &events, pieces).await,
                                Err(e) => {
                                    exchange.abort();
                                    break Err(e);
                                }
                            }
                        }
                    }
                }
                Ok(TransportEvent::Done) => {
                    break match status {
                        Some(200) => match reader.finish() {
                            Ok(pieces) => {
                                send_pieces(id, &events, pieces).await;
                                Ok(())
                            }
                            Err(e) => Err(e),
                        },
                        Some(400) if reader.text().contains("Unknown SID") => {
                            Err(RequestError::UnknownSessionId)
                        }
                        Some(code) => Err(RequestError::BadStatus(code)),
                        None => Err(RequestError::Transport("no response status".to_string())),
                    };
                }
                Err(e) => {
                    tracing::debug!(request = id, error = %e, "Request failed");
                    break Err(e.into());
                }
            }
        }
    };

    // A cancel that raced the terminal outcome still wins
    if cancel.try_recv().is_ok() {
        return;
    }
    let _ = events
        .send(RequestEvent {
            id,
            kind: RequestEventKind::Complete { status, result },
        })
        .await;
}

async fn send_pieces(id: RequestId, events: &Sender<RequestEvent>, pieces: Vec<String>) {
    for piece in pieces {
        let _ = events
            .send(RequestEvent {
                id,
                kind: RequestEventKind::Data(piece),
            })
            .await;
    }
}
