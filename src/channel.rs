mod backoff;
mod backward;
pub mod config;
mod forward;
pub mod handler;
mod sequence;
mod uri;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    select,
    sync::{
        mpsc::{self, Receiver, Sender},
        watch,
    },
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use url::Url;

pub use self::{
    backoff::{retry_delay, Backoff},
    config::ChannelConfig,
    forward::{encode_batch, parse_ack, ForwardAck},
    handler::Handler,
    sequence::{ArraySequencer, SequenceError},
    uri::UriBuilder,
};
pub(crate) use handler::guarded;

use self::{backward::BackwardChannel, forward::ForwardChannel};
use crate::{
    consts::*,
    diagnostics::{Diagnostics, NoopDiagnostics, Reachability, Stat},
    error::{BcError, CommandError, ErrorCode, RequestError, Result},
    probe::{spawn_probe, ProbeEvent, ProbePurpose, ProbeSchedule},
    request::{Delivery, RequestEvent, RequestEventKind, RequestSpec, Requester},
    tester::{ConnectionTester, TestContext, TestResults, TestStep},
    transport::{Transport, TransportEvent},
};

/// Client to server payload, an ordered string map
pub type OutgoingMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMap {
    pub id: u64,
    pub map: OutgoingMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelState {
    #[default]
    Init,
    /// Running the connection test
    Connecting,
    /// Open request sent, waiting for the handshake
    Opening,
    Opened,
    Closed,
}

/// Snapshot of a channel published after every loop turn
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub session_id: Option<String>,
    pub last_array_id: i64,
    pub host_prefix: Option<String>,
    pub server_version: u32,
    pub streaming: bool,
    pub test_results: Option<TestResults>,
    /// Every callback has run, the loop is gone
    pub finished: bool,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Init,
            session_id: None,
            last_array_id: -1,
            host_prefix: None,
            server_version: CHANNEL_VERSION,
            streaming: false,
            test_results: None,
            finished: false,
        }
    }
}

#[derive(Debug)]
pub enum ChannelCommand {
    SendMap(OutgoingMap),
    Disconnect,
    SetFailFast(bool),
}

/// Session a new channel replaces, so the server can retire it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldSession {
    pub session_id: String,
    pub last_array_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Query parameters sent with every request
    pub extra_params: Vec<(String, String)>,
    pub old_session: Option<OldSession>,
    /// Skips test stage 1
    pub test_results: Option<TestResults>,
    /// Skips test stage 2
    pub streaming: Option<bool>,
}

/// Cloneable handle on a connected channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    commands: Sender<ChannelCommand>,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelHandle {
    pub async fn send_map(&self, map: OutgoingMap) -> Result<()> {
        let state = self.state();
        if state == ChannelState::Closed {
            return Err(BcError::InvalidState(state));
        }
        self.command(ChannelCommand::SendMap(map)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ChannelState::Closed {
            return Ok(());
        }
        self.command(ChannelCommand::Disconnect).await
    }

    pub async fn set_fail_fast(&self, fail_fast: bool) -> Result<()> {
        self.command(ChannelCommand::SetFailFast(fail_fast)).await
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    pub fn last_array_id(&self) -> i64 {
        self.status.borrow().last_array_id
    }

    pub fn test_results(&self) -> Option<TestResults> {
        self.status.borrow().test_results.clone()
    }

    /// Resolves once the channel is closed and every callback has run
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        loop {
            if status.borrow().finished {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    async fn command(&self, command: ChannelCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(CommandError::from)?;
        Ok(())
    }
}

pub struct Channel {
    config: ChannelConfig,
    state: ChannelState,
    handler: Box<dyn Handler>,
    diagnostics: Arc<dyn Diagnostics>,
    requester: Requester,
    request_events: Receiver<RequestEvent>,
    probe_tx: Sender<ProbeEvent>,
    probe_events: Receiver<ProbeEvent>,
    uris: UriBuilder,
    tester: Option<ConnectionTester>,
    forward: ForwardChannel,
    backward: BackwardChannel,
    sequencer: ArraySequencer,
    session_id: Option<String>,
    host_prefix: Option<String>,
    server_version: u32,
    streaming: bool,
    test_results: Option<TestResults>,
    /// Announced on the open request only
    old_session: Option<OldSession>,
    random: random::Default,
    network_probe: Option<JoinHandle<()>>,
    status: watch::Sender<ChannelStatus>,
    finished: bool,
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        handler: impl Handler + 'static,
    ) -> Result<Self> {
        let uris = UriBuilder::new(&config.base_url, Vec::new())?;
        let (request_tx, request_events) = mpsc::channel(100);
        let (probe_tx, probe_events) = mpsc::channel(10);
        let requester = Requester::new(
            transport,
            request_tx,
            config.extra_headers.clone(),
            config.seed.wrapping_add(1),
        );
        let (status, _) = watch::channel(ChannelStatus::default());

        Ok(Channel {
            state: ChannelState::Init,
            handler: Box::new(handler),
            diagnostics: Arc::new(NoopDiagnostics),
            requester,
            request_events,
            probe_tx,
            probe_events,
            uris,
            tester: None,
            forward: ForwardChannel::default(),
            backward: BackwardChannel::default(),
            sequencer: ArraySequencer::new(MAX_REORDER_WINDOW),
            session_id: None,
            host_prefix: None,
            server_version: CHANNEL_VERSION,
            streaming: false,
            test_results: None,
            old_session: None,
            random: random::default(config.seed),
            network_probe: None,
            status,
            finished: false,
            config,
        })
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Starts the channel loop on the current runtime
    pub fn connect(self, options: ConnectOptions) -> ChannelHandle {
        let (commands_tx, commands) = mpsc::channel(100);
        let handle = ChannelHandle {
            commands: commands_tx,
            status: self.status.subscribe(),
        };
        tokio::spawn(self.run(commands, options));
        handle
    }

    async fn run(mut self, mut commands: Receiver<ChannelCommand>, options: ConnectOptions) {
        self.start_connect(options);
        self.publish();

        let mut commands_open = true;
        while !self.finished {
            let deadline = self.next_deadline();
            select! {
                biased;
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                Some(event) = self.request_events.recv() => self.handle_request_event(event),
                Some(event) = self.probe_events.recv() => self.handle_probe_event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers()
                }
                else => break,
            }
            self.publish();
        }

        self.finished = true;
        self.publish();
        tracing::debug!("Channel loop finished");
    }

    fn start_connect(&mut self, options: ConnectOptions) {
        tracing::debug!("Connecting channel");
        self.state = ChannelState::Connecting;
        self.diagnostics.stat(Stat::ConnectAttempt);

        self.uris.add_params(options.extra_params);
        self.old_session = options.old_session;

        if !self.ok_to_make_request() {
            return;
        }
        self.tester = Some(ConnectionTester::new(options.test_results, options.streaming));
        if let Some(step) = self.with_tester(|tester, ctx| tester.start(ctx)) {
            self.handle_test_step(step);
        }
    }

    fn handle_command(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::SendMap(map) => {
                if self.state == ChannelState::Closed {
                    tracing::warn!("Dropping map queued on a closed channel");
                } else {
                    self.queue_map(map);
                }
            }
            ChannelCommand::Disconnect => self.disconnect(),
            ChannelCommand::SetFailFast(fail_fast) => self.set_fail_fast(fail_fast),
        }
    }

    fn handle_request_event(&mut self, event: RequestEvent) {
        let RequestEvent { id, kind } = event;

        if self.tester.as_ref().map_or(false, |tester| tester.owns(id)) {
            let step = match kind {
                RequestEventKind::Data(text) => {
                    self.with_tester(|tester, ctx| tester.on_data(ctx, text))
                }
                RequestEventKind::Complete { result, .. } => {
                    self.with_tester(|tester, ctx| tester.on_complete(ctx, result))
                }
            };
            if let Some(step) = step {
                self.handle_test_step(step);
            }
        } else if self.forward.owns(id) {
            match kind {
                RequestEventKind::Data(text) => self.on_forward_data(text),
                RequestEventKind::Complete { status, result } => {
                    self.report_reachability(&result);
                    self.on_forward_complete(status, result)
                }
            }
        } else if self.backward.owns(id) {
            match kind {
                RequestEventKind::Data(text) => {
                    self.diagnostics
                        .server_reachability(Reachability::BackChannelActivity);
                    self.on_back_channel_data(text)
                }
                RequestEventKind::Complete { status, result } => {
                    self.report_reachability(&result);
                    self.on_back_channel_complete(status, result)
                }
            }
        } else {
            tracing::trace!(request = id, "Dropping event of a finished request");
        }
    }

    fn handle_probe_event(&mut self, event: ProbeEvent) {
        match event.purpose {
            ProbePurpose::Blocked => {
                if let Some(step) =
                    self.with_tester(|tester, ctx| tester.on_probe(ctx, event.reachable))
                {
                    self.handle_test_step(step);
                }
            }
            ProbePurpose::Network(code) => {
                self.network_probe = None;
                let code = match (code, event.reachable) {
                    (ErrorCode::Network, true) => ErrorCode::RequestFailed,
                    (code, true) => code,
                    (_, false) => ErrorCode::Network,
                };
                tracing::debug!(reachable = event.reachable, %code, "Reporting channel error");
                self.report_error(code);
            }
        }
    }

    fn handle_test_step(&mut self, step: TestStep) {
        match step {
            TestStep::Pending => {}
            TestStep::Finished { streaming } => {
                if let Some(tester) = self.tester.take() {
                    self.test_results = tester.results().cloned();
                    self.host_prefix = tester.host_prefix().map(str::to_owned);
                }
                self.streaming = self.config.allow_streaming && streaming;
                tracing::debug!(streaming = self.streaming, "Connection test complete");
                self.ensure_forward_channel();
            }
            TestStep::Failed(code) => {
                if let Some(mut tester) = self.tester.take() {
                    self.test_results = tester.results().cloned();
                    tester.abort();
                }
                self.signal_error(code);
            }
        }
    }

    fn with_tester(
        &mut self,
        f: impl FnOnce(&mut ConnectionTester, &mut TestContext<'_>) -> TestStep,
    ) -> Option<TestStep> {
        let handler_params = self.handler_params();
        let tester = self.tester.as_mut()?;
        let mut ctx = TestContext {
            requester: &mut self.requester,
            uris: &self.uris,
            handler_params: &handler_params,
            handler: self.handler.as_ref(),
            probes: &self.probe_tx,
            diagnostics: self.diagnostics.as_ref(),
            config: &self.config,
        };
        Some(f(tester, &mut ctx))
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.forward.retry_at,
            self.backward.retry_at,
            self.backward.dead_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        if self.forward.retry_at.map_or(false, |at| at <= now) {
            self.forward.retry_at = None;
            self.start_forward_channel();
        }
        if self.backward.dead_at.map_or(false, |at| at <= now) {
            self.backward.dead_at = None;
            self.on_dead_back_channel();
        }
        if self.backward.retry_at.map_or(false, |at| at <= now) {
            self.backward.retry_at = None;
            self.start_back_channel();
        }
    }

    /// Decodes a list of `[id, payload]` arrays and delivers them in id order
    fn process_arrays(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let arrays: Vec<(i64, Value)> = match serde_json::from_str(text) {
            Ok(arrays) => arrays,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable arrays from server");
                self.signal_error(ErrorCode::BadData);
                return;
            }
        };

        for (id, payload) in arrays {
            let released = match self.sequencer.accept(id, payload) {
                Ok(released) => released,
                Err(e) => {
                    tracing::warn!(error = %e, "Array sequence violated");
                    self.signal_error(ErrorCode::BadData);
                    return;
                }
            };
            for (id, payload) in released {
                tracing::trace!(id, "Handling array");
                self.backward.backoff.reset();
                self.handle_array(payload);
                if self.state == ChannelState::Closed {
                    return;
                }
            }
        }
    }

    fn handle_array(&mut self, payload: Value) {
        let tag = payload.get(0).and_then(Value::as_str);
        match (self.state, tag) {
            (_, Some("stop")) => {
                tracing::info!("Server stopped the channel");
                self.signal_error(ErrorCode::Stop);
            }
            (ChannelState::Opening, Some("c")) => self.on_handshake(&payload),
            (ChannelState::Opening, _) => {
                tracing::debug!("Ignoring array received before the handshake")
            }
            (ChannelState::Opened, Some("noop")) => {}
            (ChannelState::Opened, _) => {
                let handler = &mut self.handler;
                guarded("channel_handle_array", || {
                    handler.channel_handle_array(payload)
                });
            }
            _ => {}
        }
    }

    fn on_handshake(&mut self, payload: &Value) {
        let session_id = match payload.get(1).and_then(Value::as_str) {
            Some(session_id) => session_id.to_owned(),
            None => {
                tracing::warn!("Handshake without a session id");
                self.signal_error(ErrorCode::BadResponse);
                return;
            }
        };

        let prefix = payload
            .get(2)
            .and_then(Value::as_str)
            .filter(|prefix| !prefix.is_empty())
            .map(str::to_owned);
        if prefix.is_some() && self.config.allow_host_prefix {
            let handler = &self.handler;
            self.host_prefix =
                guarded("correct_host_prefix", || handler.correct_host_prefix(prefix)).flatten();
        }
        self.server_version = payload
            .get(3)
            .and_then(Value::as_u64)
            .map(|version| version as u32)
            .unwrap_or(DEFAULT_SERVER_VERSION);

        tracing::info!(
            session_id = %session_id,
            server_version = self.server_version,
            "Channel opened"
        );
        self.session_id = Some(session_id);
        self.state = ChannelState::Opened;

        let handler = &mut self.handler;
        guarded("channel_opened", || handler.channel_opened());
        if self.state == ChannelState::Opened {
            self.ensure_back_channel();
        }
    }

    fn disconnect(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        tracing::debug!(state = ?self.state, "Disconnecting channel");
        self.cancel_requests();
        if self.state == ChannelState::Opened {
            self.send_terminate();
        }
        self.close_channel();
    }

    /// Best effort notice to the server, nobody waits for the answer
    fn send_terminate(&mut self) {
        let session_id = match &self.session_id {
            Some(session_id) => session_id.clone(),
            None => return,
        };
        let rid = self.forward.take_rid();
        let handler_params = self.handler_params();
        let uri = self.uris.bind(
            None,
            CHANNEL_VERSION,
            &handler_params,
            &[
                ("SID", session_id),
                ("RID", rid.to_string()),
                ("TYPE", "terminate".to_string()),
            ],
        );
        let request = self.requester.http_request(&RequestSpec::get(
            uri,
            Delivery::Whole,
            self.config.watchdog_timeout,
        ));
        let transport = self.requester.transport();
        let limit = self.config.watchdog_timeout;
        tokio::spawn(async move {
            let mut exchange = transport.send(request);
            let outcome = timeout(limit, async {
                loop {
                    match exchange.next_event().await {
                        Ok(TransportEvent::Done) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            if outcome.is_err() {
                exchange.abort();
            }
        });
    }

    fn set_fail_fast(&mut self, fail_fast: bool) {
        self.config.fail_fast = fail_fast;
        tracing::debug!(fail_fast, "Fail fast changed");
        let budget = self.config.forward_retry_budget();
        let retrying = self.forward.request.is_some() || self.forward.retry_at.is_some();
        if retrying && self.forward.backoff.count() > budget {
            tracing::info!("Retry budget exceeded after fail fast");
            self.forward.request = None;
            self.forward.retry_at = None;
            self.signal_error(ErrorCode::RequestFailed);
        }
    }

    /// Tears the channel down and reports `code`, after a reachability check if
    /// the code calls for one
    fn signal_error(&mut self, code: ErrorCode) {
        if self.state == ChannelState::Closed {
            tracing::debug!(%code, "Ignoring error on a closed channel");
            return;
        }
        tracing::info!(%code, "Channel error");
        self.cancel_requests();
        self.state = ChannelState::Closed;

        if code.needs_reachability_check() {
            self.diagnostics.stat(Stat::ErrorNetwork);
            let handler = &mut self.handler;
            let uri = guarded("network_test_uri", || handler.network_test_uri())
                .flatten()
                .or_else(|| Url::parse(DEFAULT_NETWORK_TEST_URI).ok());
            if let Some(uri) = uri {
                self.network_probe = Some(spawn_probe(
                    self.requester.transport(),
                    uri,
                    ProbeSchedule {
                        timeout: NETWORK_TEST_TIMEOUT,
                        attempts: 1,
                        pause: Duration::ZERO,
                    },
                    ProbePurpose::Network(code),
                    self.probe_tx.clone(),
                ));
                return;
            }
        } else {
            self.diagnostics.stat(Stat::ErrorOther);
        }
        self.report_error(code);
    }

    fn report_error(&mut self, code: ErrorCode) {
        let handler = &mut self.handler;
        guarded("channel_error", || handler.channel_error(code));
        self.close_channel();
    }

    fn close_channel(&mut self) {
        self.state = ChannelState::Closed;
        let pending = std::mem::take(&mut self.forward.pending);
        let undelivered: Vec<QueuedMap> = self.forward.outgoing.drain(..).collect();
        tracing::debug!(
            pending = pending.len(),
            undelivered = undelivered.len(),
            "Channel closed"
        );
        let handler = &mut self.handler;
        guarded("channel_closed", || {
            handler.channel_closed(pending, undelivered)
        });
        self.finished = true;
    }

    fn cancel_requests(&mut self) {
        if let Some(mut tester) = self.tester.take() {
            tester.abort();
        }
        self.backward.cancel();
        self.forward.cancel();
    }

    /// Asks the handler whether requests may go out, closing the channel if not
    fn ok_to_make_request(&mut self) -> bool {
        let handler = &mut self.handler;
        let code =
            guarded("ok_to_make_request", || handler.ok_to_make_request()).unwrap_or(ErrorCode::Ok);
        if code == ErrorCode::Ok {
            return true;
        }
        tracing::info!(%code, "Handler refused a request");
        self.signal_error(code);
        false
    }

    fn handler_params(&mut self) -> Vec<(String, String)> {
        let handler = &mut self.handler;
        guarded("additional_params", || handler.additional_params()).unwrap_or_default()
    }

    fn is_active(&mut self) -> bool {
        let handler = &mut self.handler;
        guarded("is_active", || handler.is_active()).unwrap_or(true)
    }

    fn report_reachability(&self, result: &std::result::Result<(), RequestError>) {
        let event = match result {
            Ok(()) => Reachability::ServerReachable,
            Err(RequestError::Timeout) | Err(RequestError::Transport(_)) => {
                Reachability::ServerUnreachable
            }
            Err(_) => return,
        };
        self.diagnostics.server_reachability(event);
    }

    fn stat_request_error(&self, error: &RequestError) {
        self.diagnostics.stat(match error {
            RequestError::BadStatus(_) => Stat::RequestBadStatus,
            RequestError::NoData => Stat::RequestNoData,
            RequestError::Timeout => Stat::RequestTimeout,
            RequestError::UnknownSessionId => Stat::RequestUnknownSessionId,
            RequestError::BadData => Stat::RequestBadData,
            RequestError::Transport(_) => Stat::RequestTransport,
        });
    }

    fn publish(&self) {
        self.status.send_replace(ChannelStatus {
            state: self.state,
            session_id: self.session_id.clone(),
            last_array_id: self.sequencer.last_array_id(),
            host_prefix: self.host_prefix.clone(),
            server_version: self.server_version,
            streaming: self.streaming,
            test_results: self.test_results.clone(),
            finished: self.finished,
        });
    }
}
