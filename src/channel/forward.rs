use std::{collections::VecDeque, time::Duration};

use random::Source;
use serde_json::Value;
use tokio::time::Instant;

use super::{Backoff, Channel, ChannelState, OutgoingMap, QueuedMap};
use crate::{
    chunk::split_chunks,
    consts::*,
    diagnostics::Reachability,
    error::{ErrorCode, RequestError},
    request::{Request, RequestId, RequestSpec},
};

/// A batch on the wire, resent unchanged on retry
#[derive(Debug, Clone)]
struct Batch {
    rid: u64,
    body: String,
}

#[derive(Debug, Default)]
pub(super) struct ForwardChannel {
    pub request: Option<Request>,
    pub retry_at: Option<Instant>,
    resend: bool,
    pub backoff: Backoff,
    pub outgoing: VecDeque<QueuedMap>,
    /// Maps of the current batch
    pub pending: Vec<QueuedMap>,
    batch: Option<Batch>,
    next_rid: u64,
    next_map_id: u64,
}

impl ForwardChannel {
    pub fn owns(&self, id: RequestId) -> bool {
        self.request.as_ref().map(Request::id) == Some(id)
    }

    pub fn cancel(&mut self) {
        self.request = None;
        self.retry_at = None;
    }

    pub fn take_rid(&mut self) -> u64 {
        let rid = self.next_rid;
        self.next_rid += 1;
        rid
    }

    fn fill_batch(&mut self) {
        let count = self.outgoing.len().min(MAX_MAPS_PER_REQUEST);
        self.pending.extend(self.outgoing.drain(..count));
    }
}

/// Form encodes a batch: `count=N&ofs=K&req{i}_{key}={value}`.
///
/// Servers up to version 6 expect positional indexes and no offset.
pub fn encode_batch(maps: &[QueuedMap], server_version: u32) -> String {
    let mut parts = vec![format!("count={}", maps.len())];
    let offset = match maps.first() {
        Some(first) if server_version > 6 => {
            parts.push(format!("ofs={}", first.id));
            first.id
        }
        _ => 0,
    };

    for (position, queued) in maps.iter().enumerate() {
        let index = if server_version > 6 {
            queued.id - offset
        } else {
            position as u64
        };
        for (key, value) in &queued.map {
            parts.push(format!("req{index}_{key}={}", urlencoding::encode(value)));
        }
    }
    parts.join("&")
}

/// Answer to a forward POST from a version 8 server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardAck {
    BackchannelMissing,
    Delivered {
        last_array_id: i64,
        outstanding_bytes: u64,
    },
}

pub fn parse_ack(text: &str) -> Option<ForwardAck> {
    let answer: Vec<Value> = serde_json::from_str(text).ok()?;
    match answer.as_slice() {
        [flag, ..] if flag.as_i64() == Some(0) => Some(ForwardAck::BackchannelMissing),
        [_, last_array_id, outstanding_bytes] => Some(ForwardAck::Delivered {
            last_array_id: last_array_id.as_i64()?,
            outstanding_bytes: outstanding_bytes.as_u64()?,
        }),
        _ => None,
    }
}

impl Channel {
    pub(super) fn queue_map(&mut self, map: OutgoingMap) {
        if self.forward.outgoing.len() == MAX_MAPS_PER_REQUEST {
            tracing::warn!(
                queued = self.forward.outgoing.len(),
                "Already have {MAX_MAPS_PER_REQUEST} queued maps upon queueing another"
            );
        }
        let id = self.forward.next_map_id;
        self.forward.next_map_id += 1;
        tracing::trace!(id, "Queueing map");
        self.forward.outgoing.push_back(QueuedMap { id, map });

        if matches!(self.state, ChannelState::Opening | ChannelState::Opened) {
            self.ensure_forward_channel();
        }
    }

    /// Schedules a send on the next loop turn unless one is already coming
    pub(super) fn ensure_forward_channel(&mut self) {
        if self.forward.request.is_some() || self.forward.retry_at.is_some() {
            return;
        }
        self.forward.resend = false;
        self.forward.backoff.reset();
        self.forward.retry_at = Some(Instant::now());
    }

    pub(super) fn start_forward_channel(&mut self) {
        let resend = std::mem::take(&mut self.forward.resend);
        if !self.ok_to_make_request() {
            return;
        }
        match self.state {
            ChannelState::Connecting if resend => {
                tracing::error!("Open request is never retried")
            }
            ChannelState::Connecting => self.open(),
            ChannelState::Opened if resend => self.send_forward(true),
            ChannelState::Opened if self.forward.outgoing.is_empty() => {
                tracing::trace!("No maps to send")
            }
            ChannelState::Opened if self.forward.request.is_some() => {
                tracing::error!("Forward request already in flight")
            }
            ChannelState::Opened => self.send_forward(false),
            _ => {}
        }
    }

    fn open(&mut self) {
        let rid = (self.random.read::<f64>() * INITIAL_RID_RANGE as f64).floor() as u64;
        self.forward.next_rid = rid + 1;
        self.forward.fill_batch();
        let body = encode_batch(&self.forward.pending, self.server_version);
        tracing::debug!(rid, maps = self.forward.pending.len(), "Opening channel");

        let mut params = vec![("RID", rid.to_string())];
        if let Some(version) = &self.config.app_version {
            params.push(("CVER", version.clone()));
        }
        if let Some(old) = &self.old_session {
            params.push(("OSID", old.session_id.clone()));
            params.push(("OAID", old.last_array_id.to_string()));
        }
        let handler_params = self.handler_params();
        let uri = self
            .uris
            .bind(None, CHANNEL_VERSION, &handler_params, &params);

        self.state = ChannelState::Opening;
        self.forward.batch = Some(Batch {
            rid,
            body: body.clone(),
        });
        let spec = RequestSpec::post(uri, body, self.config.watchdog_timeout);
        self.diagnostics
            .server_reachability(Reachability::RequestMade);
        self.forward.request = Some(self.requester.start(spec));
    }

    fn send_forward(&mut self, resend: bool) {
        let batch = match (resend, self.forward.batch.clone()) {
            (true, Some(batch)) => batch,
            _ => {
                let rid = self.forward.take_rid();
                self.forward.fill_batch();
                let batch = Batch {
                    rid,
                    body: encode_batch(&self.forward.pending, self.server_version),
                };
                self.forward.batch = Some(batch.clone());
                batch
            }
        };

        let session_id = self.session_id.clone().unwrap_or_default();
        let handler_params = self.handler_params();
        let uri = self.uris.bind(
            None,
            CHANNEL_VERSION,
            &handler_params,
            &[
                ("SID", session_id),
                ("RID", batch.rid.to_string()),
                ("AID", self.sequencer.last_array_id().to_string()),
            ],
        );

        let timeout = self.forward_timeout();
        let mut spec = RequestSpec::post(uri, batch.body, timeout);
        spec.attempt = self.forward.backoff.count() + 1;
        tracing::debug!(
            rid = batch.rid,
            attempt = spec.attempt,
            maps = self.forward.pending.len(),
            "Sending forward batch"
        );
        self.diagnostics
            .server_reachability(Reachability::RequestMade);
        self.forward.request = Some(self.requester.start(spec));
    }

    /// Half the configured timeout plus a random share of the other half
    fn forward_timeout(&mut self) -> Duration {
        let half = self.config.forward_request_timeout.as_millis() as f64 * 0.5;
        let millis = half.round() + (half * self.random.read::<f64>()).round();
        Duration::from_millis(millis as u64)
    }

    pub(super) fn on_forward_data(&mut self, text: String) {
        match self.state {
            ChannelState::Opening => self.process_open_response(&text),
            ChannelState::Opened => self.process_ack(&text),
            _ => {}
        }
    }

    /// The open answer is a plain array list, chunk framed by some servers
    fn process_open_response(&mut self, text: &str) {
        match split_chunks(text) {
            Some(chunks) => {
                for chunk in chunks {
                    self.process_arrays(&chunk);
                    if self.state == ChannelState::Closed {
                        return;
                    }
                }
            }
            None => self.process_arrays(text),
        }
    }

    fn process_ack(&mut self, text: &str) {
        if self.server_version > 7 {
            match parse_ack(text) {
                Some(ForwardAck::BackchannelMissing) => self.on_back_channel_missing(),
                Some(ForwardAck::Delivered {
                    last_array_id,
                    outstanding_bytes,
                }) => self.check_dead_back_channel(last_array_id, outstanding_bytes),
                None => {
                    tracing::warn!(body = %text, "Bad forward channel response");
                    self.signal_error(ErrorCode::BadResponse);
                }
            }
        } else if text != MAGIC_RESPONSE_COOKIE {
            tracing::warn!(body = %text, "Bad forward channel response");
            self.signal_error(ErrorCode::BadResponse);
        }
    }

    pub(super) fn on_forward_complete(
        &mut self,
        status: Option<u16>,
        result: Result<(), RequestError>,
    ) {
        let request = match self.forward.request.take() {
            Some(request) => request,
            None => return,
        };

        match result {
            Ok(()) => {
                if self.state == ChannelState::Opening {
                    tracing::warn!("Open request finished without a handshake");
                    self.signal_error(ErrorCode::BadResponse);
                    return;
                }
                self.diagnostics.timing(
                    request.body_len(),
                    request.started_at().elapsed(),
                    self.forward.backoff.count(),
                );
                self.forward.pending.clear();
                self.forward.batch = None;
                self.forward.backoff.reset();
                if self.state == ChannelState::Opened && !self.forward.outgoing.is_empty() {
                    self.ensure_forward_channel();
                }
            }
            Err(error) => {
                self.stat_request_error(&error);
                let retry = error.is_retriable()
                    && self.state == ChannelState::Opened
                    && self.forward.backoff.count() < self.config.forward_retry_budget();
                if !retry {
                    tracing::debug!(
                        error = %error,
                        ?status,
                        attempt = request.attempt(),
                        "Forward channel failed"
                    );
                    self.signal_error(error.error_code());
                    return;
                }

                let active = self.is_active();
                let delay = self.forward.backoff.next_delay(
                    self.config.retry_delay_base,
                    self.config.retry_delay_jitter,
                    &mut self.random,
                    active,
                );
                tracing::debug!(
                    error = %error,
                    ?status,
                    delay_ms = delay.as_millis() as u64,
                    retries = self.forward.backoff.count(),
                    "Retrying forward channel"
                );
                self.forward.resend = true;
                self.forward.retry_at = Some(Instant::now() + delay);
            }
        }
    }
}
