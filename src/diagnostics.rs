use std::time::Duration;

/// Notable events of a channel, for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    ConnectAttempt,
    ErrorNetwork,
    ErrorOther,
    TestStage1Start,
    TestStage1Failed,
    TestStage2Start,
    TestStage2Failed,
    Blocked,
    Streaming,
    Buffered,
    RequestTimeout,
    RequestBadStatus,
    RequestNoData,
    RequestUnknownSessionId,
    RequestBadData,
    RequestTransport,
    BackchannelMissing,
    BackchannelDead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reachability {
    RequestMade,
    ServerReachable,
    ServerUnreachable,
    BackChannelActivity,
}

/// Sink for channel statistics.
///
/// Every method has a no-op default.
pub trait Diagnostics: Send + Sync {
    fn stat(&self, _stat: Stat) {}

    fn server_reachability(&self, _event: Reachability) {}

    /// A forward POST of `size` body bytes was acknowledged after `rtt`
    fn timing(&self, _size: usize, _rtt: Duration, _retries: u32) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {}

/// Logs every diagnostic event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn stat(&self, stat: Stat) {
        tracing::debug!(?stat, "Channel stat");
    }

    fn server_reachability(&self, event: Reachability) {
        tracing::trace!(?event, "Server reachability");
    }

    fn timing(&self, size: usize, rtt: Duration, retries: u32) {
        tracing::debug!(size, rtt_ms = rtt.as_millis() as u64, retries, "Forward channel timing");
    }
}
