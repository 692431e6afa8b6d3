//! Reachability probes: a plain GET that counts as reachable when any 2xx
//! answer completes within the timeout.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc::Sender, task::JoinHandle, time::timeout};
use url::Url;

use crate::{
    error::ErrorCode,
    transport::{HttpRequest, Transport, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePurpose {
    /// The blocked host check of the connection test
    Blocked,
    /// General reachability before reporting a channel error
    Network(ErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEvent {
    pub purpose: ProbePurpose,
    pub reachable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSchedule {
    pub timeout: Duration,
    pub attempts: u32,
    pub pause: Duration,
}

pub async fn probe_once(transport: &dyn Transport, uri: Url, limit: Duration) -> bool {
    let mut exchange = transport.send(HttpRequest::get(uri));
    let outcome = timeout(limit, async {
        let mut ok = false;
        loop {
            match exchange.next_event().await {
                Ok(TransportEvent::Status(code)) => ok = (200..300).contains(&code),
                Ok(TransportEvent::Data(_)) => {}
                Ok(TransportEvent::Done) => return ok,
                Err(_) => return false,
            }
        }
    })
    .await;

    match outcome {
        Ok(reachable) => reachable,
        Err(_) => {
            exchange.abort();
            false
        }
    }
}

pub async fn probe(transport: &dyn Transport, uri: &Url, schedule: ProbeSchedule) -> bool {
    for attempt in 1..=schedule.attempts {
        if probe_once(transport, uri.clone(), schedule.timeout).await {
            return true;
        }
        tracing::debug!(uri = %uri, attempt, "Reachability probe failed");
        if attempt < schedule.attempts {
            tokio::time::sleep(schedule.pause).await;
        }
    }
    false
}

/// Runs a probe in the background and posts its verdict to `events`
pub fn spawn_probe(
    transport: Arc<dyn Transport>,
    uri: Url,
    schedule: ProbeSchedule,
    purpose: ProbePurpose,
    events: Sender<ProbeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reachable = probe(transport.as_ref(), &uri, schedule).await;
        tracing::debug!(uri = %uri, reachable, ?purpose, "Reachability probe done");
        let _ = events.send(ProbeEvent { purpose, reachable }).await;
    })
}
