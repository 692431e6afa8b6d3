use tokio::time::Instant;

use super::{Backoff, Channel, ChannelState};
use crate::{
    consts::*,
    diagnostics::{Reachability, Stat},
    error::RequestError,
    request::{Delivery, Request, RequestId, RequestSpec},
};

#[derive(Debug, Default)]
pub(super) struct BackwardChannel {
    pub request: Option<Request>,
    pub retry_at: Option<Instant>,
    /// Restart deadline armed when the server claims data we never got
    pub dead_at: Option<Instant>,
    pub backoff: Backoff,
    attempt: u32,
}

impl BackwardChannel {
    pub fn owns(&self, id: RequestId) -> bool {
        self.request.as_ref().map(Request::id) == Some(id)
    }

    pub fn cancel(&mut self) {
        self.request = None;
        self.retry_at = None;
        self.dead_at = None;
    }
}

impl Channel {
    pub(super) fn ensure_back_channel(&mut self) {
        if self.backward.request.is_some() || self.backward.retry_at.is_some() {
            return;
        }
        self.backward.attempt = 1;
        self.backward.backoff.reset();
        self.backward.retry_at = Some(Instant::now());
    }

    fn maybe_retry_back_channel(&mut self) -> bool {
        if self.backward.request.is_some() || self.backward.retry_at.is_some() {
            tracing::error!("Backward channel already active");
            return false;
        }
        if self.backward.backoff.count() >= self.config.back_channel_max_retries {
            return false;
        }

        self.backward.attempt += 1;
        let active = self.is_active();
        let delay = self.backward.backoff.next_delay(
            self.config.retry_delay_base,
            self.config.retry_delay_jitter,
            &mut self.random,
            active,
        );
        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.backward.attempt,
            "Scheduling backward channel"
        );
        self.backward.retry_at = Some(Instant::now() + delay);
        true
    }

    pub(super) fn start_back_channel(&mut self) {
        if self.state != ChannelState::Opened || !self.ok_to_make_request() {
            return;
        }

        let handler_params = self.handler_params();
        let prefix = if self.config.supports_cross_domain {
            self.host_prefix.as_deref()
        } else {
            None
        };
        let uri = self.uris.bind(
            prefix,
            CHANNEL_VERSION,
            &handler_params,
            &[
                ("RID", BACK_CHANNEL_RID.to_string()),
                ("SID", self.session_id.clone().unwrap_or_default()),
                ("CI", if self.streaming { "0" } else { "1" }.to_string()),
                ("AID", self.sequencer.last_array_id().to_string()),
                ("TYPE", "xmlhttp".to_string()),
            ],
        );

        let mut spec = RequestSpec::get(uri, Delivery::Chunked, self.config.watchdog_timeout);
        spec.attempt = self.backward.attempt;
        spec.throttle = self.config.readystate_throttle;
        spec.connection_close = true;
        tracing::debug!(
            attempt = spec.attempt,
            streaming = self.streaming,
            "Starting backward channel"
        );
        self.diagnostics
            .server_reachability(Reachability::RequestMade);
        self.backward.request = Some(self.requester.start(spec));
    }

    pub(super) fn on_back_channel_data(&mut self, text: String) {
        self.backward.dead_at = None;
        self.process_arrays(&text);
    }

    pub(super) fn on_back_channel_complete(
        &mut self,
        status: Option<u16>,
        result: Result<(), RequestError>,
    ) {
        self.backward.dead_at = None;
        self.backward.request = None;
        match result {
            Ok(()) => {
                tracing::trace!("Backward channel finished");
                self.ensure_back_channel();
            }
            Err(error) => {
                self.stat_request_error(&error);
                if error.is_retriable() && self.maybe_retry_back_channel() {
                    return;
                }
                tracing::debug!(error = %error, ?status, "Backward channel failed");
                self.signal_error(error.error_code());
            }
        }
    }

    /// Forward answer `[0, ..]`: the server has no backward request for us
    pub(super) fn on_back_channel_missing(&mut self) {
        self.diagnostics.stat(Stat::BackchannelMissing);
        if self.backward.retry_at.is_some() {
            tracing::debug!("Backward channel is about to start");
            return;
        }

        let forward_started = self
            .forward
            .request
            .as_ref()
            .map(Request::started_at)
            .unwrap_or_else(Instant::now);
        let stale = match &self.backward.request {
            Some(back) => {
                back.started_at() + self.config.stale_back_channel_threshold < forward_started
            }
            None => {
                tracing::warn!("Server reports a missing backward channel");
                true
            }
        };
        if stale {
            tracing::debug!("Restarting backward channel");
            self.backward.dead_at = None;
            self.backward.request = None;
            self.maybe_retry_back_channel();
        } else {
            tracing::trace!("Backward channel is younger than the forward request");
        }
    }

    /// Forward answer `[1, lastArrayId, outstandingBytes]`
    pub(super) fn check_dead_back_channel(&mut self, server_last: i64, outstanding_bytes: u64) {
        let last = self.sequencer.last_array_id();
        if server_last <= last {
            return;
        }
        tracing::debug!(
            server_last,
            last,
            outstanding_bytes,
            "Server sent arrays not received yet"
        );
        if outstanding_bytes < OUTSTANDING_DATA_BACKCHANNEL_RETRY_CUTOFF
            && self.streaming
            && self.backward.backoff.count() == 0
            && self.backward.dead_at.is_none()
        {
            self.backward.dead_at = Some(Instant::now() + self.config.dead_back_channel_timeout);
        }
    }

    pub(super) fn on_dead_back_channel(&mut self) {
        if self.state != ChannelState::Opened {
            return;
        }
        tracing::warn!("Backward channel looks dead, restarting");
        self.diagnostics.stat(Stat::BackchannelDead);
        self.backward.request = None;
        self.maybe_retry_back_channel();
    }
}
