//! WebSocket shaped wrapper around a channel.
//!
//! A [`BcSocket`] owns at most one live channel at a time and builds a new one
//! when the old one dies, unless the server stopped it or the user closed it.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use random::Source;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{
    channel::{
        guarded, Channel, ChannelConfig, ChannelHandle, ConnectOptions, Handler, OldSession,
        OutgoingMap, QueuedMap,
    },
    diagnostics::{Diagnostics, NoopDiagnostics},
    error::{BcError, ErrorCode, Result},
    request::random_token,
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Token that lets a load balancer route every request of a client to one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affinity {
    Random,
    Fixed(String),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub reconnect: bool,
    pub reconnect_time: Duration,
    pub extra_params: Vec<(String, String)>,
    pub affinity: Affinity,
    pub affinity_param: String,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reconnect: false,
            reconnect_time: Duration::from_millis(3_000),
            extra_params: Vec::new(),
            affinity: Affinity::Random,
            affinity_param: "a".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Json(Value),
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::Text(value.to_string())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::Text(value)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Json(value)
    }
}

pub trait SocketHandler: Send + 'static {
    fn on_connecting(&mut self) {}

    fn on_open(&mut self) {}

    fn on_message(&mut self, _message: Value) {}

    fn on_error(&mut self, _message: &str, _code: ErrorCode) {}

    fn on_close(&mut self, _message: &str, _pending: Vec<QueuedMap>, _undelivered: Vec<QueuedMap>) {
    }
}

struct SocketState {
    ready_state: ReadyState,
    session: Option<ChannelHandle>,
    last_session: Option<ChannelHandle>,
    last_error: Option<ErrorCode>,
    reconnect_timer: Option<JoinHandle<()>>,
    generation: u64,
    /// Seeds every new channel
    random: random::Default,
}

struct SocketShared {
    config: ChannelConfig,
    options: SocketOptions,
    affinity: Option<String>,
    transport: Arc<dyn Transport>,
    diagnostics: Arc<dyn Diagnostics>,
    state: Mutex<SocketState>,
    handler: Mutex<Box<dyn SocketHandler>>,
}

#[derive(Clone)]
pub struct BcSocket {
    shared: Arc<SocketShared>,
}

impl std::fmt::Debug for BcSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BcSocket")
            .field("url", &self.shared.config.base_url.as_str())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl BcSocket {
    /// Creates the socket and starts connecting right away
    pub fn open(
        config: ChannelConfig,
        options: SocketOptions,
        transport: Arc<dyn Transport>,
        handler: impl SocketHandler,
    ) -> Result<Self> {
        Self::open_with_diagnostics(config, options, transport, Arc::new(NoopDiagnostics), handler)
    }

    pub fn open_with_diagnostics(
        config: ChannelConfig,
        options: SocketOptions,
        transport: Arc<dyn Transport>,
        diagnostics: Arc<dyn Diagnostics>,
        handler: impl SocketHandler,
    ) -> Result<Self> {
        let mut random = random::default(config.seed);
        let affinity = match &options.affinity {
            Affinity::Random => Some(random_token(&mut random)),
            Affinity::Fixed(token) => Some(token.clone()),
            Affinity::Disabled => None,
        };

        let socket = BcSocket {
            shared: Arc::new(SocketShared {
                config,
                options,
                affinity,
                transport,
                diagnostics,
                state: Mutex::new(SocketState {
                    ready_state: ReadyState::Closed,
                    session: None,
                    last_session: None,
                    last_error: None,
                    reconnect_timer: None,
                    generation: 0,
                    random,
                }),
                handler: Mutex::new(Box::new(handler)),
            }),
        };
        socket.reconnect()?;
        Ok(socket)
    }

    /// Opens a closed socket again
    pub fn reopen(&self) -> Result<()> {
        let mut state = self.state();
        if state.ready_state != ReadyState::Closed || state.reconnect_timer.is_some() {
            return Err(BcError::SocketOpen);
        }
        state.reconnect_timer = Some(self.schedule_reconnect(Duration::ZERO));
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let session = {
            let mut state = self.state();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.last_error = Some(ErrorCode::Ok);
            if state.ready_state == ReadyState::Closed {
                return Ok(());
            }
            state.ready_state = ReadyState::Closing;
            state.session.clone()
        };

        if let Some(session) = session {
            session.disconnect().await?;
        }
        Ok(())
    }

    pub async fn send_map(&self, map: OutgoingMap) -> Result<()> {
        let session = {
            let state = self.state();
            match state.ready_state {
                ReadyState::Closing | ReadyState::Closed => return Err(BcError::SocketClosed),
                _ => state.session.clone(),
            }
        };
        match session {
            Some(session) => session.send_map(map).await,
            None => Err(BcError::SocketClosed),
        }
    }

    /// Sends text as `{_S: text}` and JSON as `{JSON: serialized}`
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let mut map = OutgoingMap::new();
        match message.into() {
            Message::Text(text) => map.insert("_S".to_string(), text),
            Message::Json(value) => map.insert("JSON".to_string(), serde_json::to_string(&value)?),
        };
        self.send_map(map).await
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state().ready_state
    }

    pub fn affinity(&self) -> Option<&str> {
        self.shared.affinity.as_deref()
    }

    /// The live channel, if any
    pub fn session(&self) -> Option<ChannelHandle> {
        self.state().session.clone()
    }

    fn state(&self) -> MutexGuard<'_, SocketState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, callback: &'static str, f: impl FnOnce(&mut dyn SocketHandler)) {
        let mut handler = self
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guarded(callback, || f(&mut **handler));
    }

    fn schedule_reconnect(&self, delay: Duration) -> JoinHandle<()> {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        let socket = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = socket.reconnect() {
                tracing::warn!(error = %e, "Reconnect failed");
            }
        })
    }

    fn reconnect(&self) -> Result<()> {
        let (generation, last_session, seed) = {
            let mut state = self.state();
            if state.session.is_some() {
                return Err(BcError::SocketOpen);
            }
            state.reconnect_timer = None;
            state.ready_state = ReadyState::Connecting;
            state.generation += 1;
            let seed = state.random.read::<u64>();
            (state.generation, state.last_session.clone(), seed)
        };
        self.notify("on_connecting", |handler| handler.on_connecting());

        let mut options = ConnectOptions {
            extra_params: self.shared.options.extra_params.clone(),
            ..Default::default()
        };
        if let Some(affinity) = &self.shared.affinity {
            options
                .extra_params
                .push((self.shared.options.affinity_param.clone(), affinity.clone()));
        }
        if let Some(last) = last_session {
            options.test_results = last.test_results();
            options.old_session = last.session_id().map(|session_id| OldSession {
                session_id,
                last_array_id: last.last_array_id(),
            });
        }

        let mut config = self.shared.config.clone();
        config.seed = seed;
        let channel = Channel::new(
            config,
            self.shared.transport.clone(),
            SocketBridge {
                socket: self.clone(),
                generation,
            },
        )?
        .with_diagnostics(self.shared.diagnostics.clone());

        // Held across connect so early callbacks see the new session
        let mut state = self.state();
        if state.generation != generation {
            return Ok(());
        }
        state.session = Some(channel.connect(options));
        Ok(())
    }

    fn on_channel_opened(&self, generation: u64) {
        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.last_session = state.session.clone();
            state.ready_state = ReadyState::Open;
        }
        self.notify("on_open", |handler| handler.on_open());
    }

    fn on_channel_message(&self, generation: u64, message: Value) {
        if self.state().generation != generation {
            return;
        }
        self.notify("on_message", |handler| handler.on_message(message));
    }

    fn on_channel_error(&self, generation: u64, code: ErrorCode) {
        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            // A user close already decided the outcome
            if state.last_error == Some(ErrorCode::Ok) {
                tracing::debug!(%code, "Dropping channel error after close");
                return;
            }
            state.last_error = Some(code);
            if state.ready_state != ReadyState::Closed {
                state.ready_state = ReadyState::Closing;
            }
        }
        self.notify("on_error", |handler| handler.on_error(code.message(), code));
    }

    fn on_channel_closed(
        &self,
        generation: u64,
        pending: Vec<QueuedMap>,
        undelivered: Vec<QueuedMap>,
    ) {
        let code = {
            let mut state = self.state();
            if state.generation != generation || state.ready_state == ReadyState::Closed {
                return;
            }
            state.session = None;
            state.ready_state = ReadyState::Closed;
            let code = state.last_error.take();

            let options = &self.shared.options;
            if options.reconnect && !matches!(code, Some(ErrorCode::Stop) | Some(ErrorCode::Ok)) {
                let delay = if code == Some(ErrorCode::UnknownSessionId) {
                    Duration::ZERO
                } else {
                    options.reconnect_time
                };
                state.reconnect_timer = Some(self.schedule_reconnect(delay));
            }
            code
        };

        let message = match code {
            Some(code) if code != ErrorCode::Ok => code.message(),
            _ => "Closed",
        };
        tracing::debug!(message, "Socket closed");
        self.notify("on_close", |handler| {
            handler.on_close(message, pending, undelivered)
        });
    }
}

/// Channel handler feeding one session's callbacks into the socket
struct SocketBridge {
    socket: BcSocket,
    generation: u64,
}

impl Handler for SocketBridge {
    fn channel_opened(&mut self) {
        self.socket.on_channel_opened(self.generation);
    }

    fn channel_handle_array(&mut self, array: Value) {
        self.socket.on_channel_message(self.generation, array);
    }

    fn channel_error(&mut self, code: ErrorCode) {
        self.socket.on_channel_error(self.generation, code);
    }

    fn channel_closed(&mut self, pending: Vec<QueuedMap>, undelivered: Vec<QueuedMap>) {
        self.socket
            .on_channel_closed(self.generation, pending, undelivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_from_text_and_json() {
        assert_eq!(Message::from("hi"), Message::Text("hi".into()));
        assert_eq!(
            Message::from(serde_json::json!({"a": 1})),
            Message::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn default_options() {
        let options = SocketOptions::default();
        assert!(!options.reconnect);
        assert_eq!(options.reconnect_time, Duration::from_secs(3));
        assert_eq!(options.affinity_param, "a");
    }
}
