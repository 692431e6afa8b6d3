//! Two stage connection test run before a channel opens.
//!
//! Stage 1 asks the server for a host prefix and an optional blocked prefix,
//! stage 2 finds out whether partial responses make it through unbuffered.

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc::Sender, task::JoinHandle, time::Instant};

use crate::{
    channel::{guarded, ChannelConfig, Handler, UriBuilder},
    consts::*,
    diagnostics::{Diagnostics, Stat},
    error::{ErrorCode, RequestError},
    probe::{spawn_probe, ProbeEvent, ProbePurpose, ProbeSchedule},
    request::{Delivery, Request, RequestId, RequestSpec, Requester},
};

/// Answer of test stage 1, reusable by the next session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub host_prefix: Option<String>,
    pub blocked_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TesterState {
    Init,
    Stage1,
    BlockedProbe,
    Stage2,
    Done,
}

/// What the channel should do after feeding the tester an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStep {
    Pending,
    Finished { streaming: bool },
    Failed(ErrorCode),
}

/// Channel state the tester needs while it runs
pub struct TestContext<'a> {
    pub requester: &'a mut Requester,
    pub uris: &'a UriBuilder,
    pub handler_params: &'a [(String, String)],
    pub handler: &'a dyn Handler,
    pub probes: &'a Sender<ProbeEvent>,
    pub diagnostics: &'a dyn Diagnostics,
    pub config: &'a ChannelConfig,
}

pub struct ConnectionTester {
    state: TesterState,
    precomputed: Option<TestResults>,
    precomputed_streaming: Option<bool>,
    results: Option<TestResults>,
    host_prefix: Option<String>,
    request: Option<Request>,
    probe: Option<JoinHandle<()>>,
    stage1_answer: Option<String>,
    stage2_started: Option<Instant>,
    first_progress_seen: bool,
    saw_payload: bool,
}

impl ConnectionTester {
    pub fn new(precomputed: Option<TestResults>, precomputed_streaming: Option<bool>) -> Self {
        Self {
            state: TesterState::Init,
            precomputed,
            precomputed_streaming,
            results: None,
            host_prefix: None,
            request: None,
            probe: None,
            stage1_answer: None,
            stage2_started: None,
            first_progress_seen: false,
            saw_payload: false,
        }
    }

    pub fn results(&self) -> Option<&TestResults> {
        self.results.as_ref()
    }

    /// Host prefix after correction by the handler
    pub fn host_prefix(&self) -> Option<&str> {
        self.host_prefix.as_deref()
    }

    pub fn owns(&self, id: RequestId) -> bool {
        self.request.as_ref().map(Request::id) == Some(id)
    }

    pub fn start(&mut self, ctx: &mut TestContext<'_>) -> TestStep {
        match self.precomputed.clone() {
            Some(results) => {
                tracing::debug!(?results, "Skipping test stage 1");
                self.accept_results(ctx, results)
            }
            None => {
                self.state = TesterState::Stage1;
                ctx.diagnostics.stat(Stat::TestStage1Start);
                let uri = ctx.uris.test(
                    None,
                    CHANNEL_VERSION,
                    ctx.handler_params,
                    &[("MODE", "init".to_string())],
                );
                let spec = RequestSpec::get(uri, Delivery::Whole, ctx.config.watchdog_timeout);
                self.request = Some(ctx.requester.start(spec));
                TestStep::Pending
            }
        }
    }

    pub fn on_data(&mut self, ctx: &mut TestContext<'_>, text: String) -> TestStep {
        match self.state {
            TesterState::Stage1 => {
                self.stage1_answer = Some(text);
                TestStep::Pending
            }
            TesterState::Stage2 if !self.first_progress_seen => {
                self.first_progress_seen = true;
                if text != STREAMING_TEST_PAYLOAD {
                    tracing::debug!("Test stage 2 looks buffered");
                    return TestStep::Pending;
                }
                self.saw_payload = true;
                let elapsed = self
                    .stage2_started
                    .map(|started| started.elapsed())
                    .unwrap_or_default();
                if ctx.requester.supports_streaming() || elapsed < STREAMING_TEST_WINDOW {
                    self.request = None;
                    self.finish(ctx, true)
                } else {
                    TestStep::Pending
                }
            }
            _ => TestStep::Pending,
        }
    }

    pub fn on_complete(
        &mut self,
        ctx: &mut TestContext<'_>,
        result: Result<(), RequestError>,
    ) -> TestStep {
        self.request = None;
        match (self.state, result) {
            (TesterState::Stage1, Ok(())) => {
                match self.stage1_answer.take().as_deref().and_then(parse_stage1) {
                    Some(results) => self.accept_results(ctx, results),
                    None => {
                        tracing::warn!("Unparseable test stage 1 answer");
                        ctx.diagnostics.stat(Stat::TestStage1Failed);
                        self.fail(ErrorCode::Network)
                    }
                }
            }
            (TesterState::Stage1, Err(e)) => {
                tracing::debug!(error = %e, "Test stage 1 failed");
                ctx.diagnostics.stat(Stat::TestStage1Failed);
                self.fail(ErrorCode::Network)
            }
            (TesterState::Stage2, Ok(())) => self.finish(ctx, self.saw_payload),
            (TesterState::Stage2, Err(e)) => {
                tracing::debug!(error = %e, "Test stage 2 failed");
                ctx.diagnostics.stat(Stat::TestStage2Failed);
                self.fail(ErrorCode::Network)
            }
            _ => TestStep::Pending,
        }
    }

    pub fn on_probe(&mut self, ctx: &mut TestContext<'_>, reachable: bool) -> TestStep {
        if self.state != TesterState::BlockedProbe {
            return TestStep::Pending;
        }
        self.probe = None;
        if reachable {
            self.start_stage2(ctx)
        } else {
            ctx.diagnostics.stat(Stat::Blocked);
            self.fail(ErrorCode::Blocked)
        }
    }

    /// Stops any request or probe still running
    pub fn abort(&mut self) {
        self.request = None;
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
    }

    fn accept_results(&mut self, ctx: &mut TestContext<'_>, results: TestResults) -> TestStep {
        self.host_prefix = if ctx.config.allow_host_prefix {
            let handler = ctx.handler;
            let raw = results.host_prefix.clone();
            guarded("correct_host_prefix", || handler.correct_host_prefix(raw)).flatten()
        } else {
            None
        };
        self.results = Some(results.clone());

        let blocked = match results.blocked_prefix {
            Some(blocked) => blocked,
            None => return self.start_stage2(ctx),
        };
        let uri = match ctx.uris.blocked_probe(&blocked) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(error = %e, prefix = %blocked, "Unusable blocked prefix");
                return self.fail(ErrorCode::Blocked);
            }
        };
        self.state = TesterState::BlockedProbe;
        self.probe = Some(spawn_probe(
            ctx.requester.transport(),
            uri,
            ProbeSchedule {
                timeout: BLOCKED_PROBE_TIMEOUT,
                attempts: BLOCKED_PROBE_ATTEMPTS,
                pause: BLOCKED_PROBE_PAUSE,
            },
            ProbePurpose::Blocked,
            ctx.probes.clone(),
        ));
        TestStep::Pending
    }

    fn start_stage2(&mut self, ctx: &mut TestContext<'_>) -> TestStep {
        if let Some(streaming) = self.precomputed_streaming {
            tracing::debug!(streaming, "Skipping test stage 2");
            return self.finish(ctx, streaming);
        }

        self.state = TesterState::Stage2;
        ctx.diagnostics.stat(Stat::TestStage2Start);
        let prefix = if ctx.config.supports_cross_domain {
            self.host_prefix.as_deref()
        } else {
            None
        };
        let uri = ctx.uris.test(
            prefix,
            CHANNEL_VERSION,
            ctx.handler_params,
            &[("TYPE", "xmlhttp".to_string())],
        );
        let mut spec = RequestSpec::get(uri, Delivery::Progressive, ctx.config.watchdog_timeout);
        spec.connection_close = true;
        self.stage2_started = Some(Instant::now());
        self.request = Some(ctx.requester.start(spec));
        TestStep::Pending
    }

    fn finish(&mut self, ctx: &mut TestContext<'_>, streaming: bool) -> TestStep {
        self.state = TesterState::Done;
        ctx.diagnostics.stat(if streaming {
            Stat::Streaming
        } else {
            Stat::Buffered
        });
        tracing::info!(streaming, "Connection test done");
        TestStep::Finished { streaming }
    }

    fn fail(&mut self, code: ErrorCode) -> TestStep {
        self.state = TesterState::Done;
        self.abort();
        TestStep::Failed(code)
    }
}

fn parse_stage1(text: &str) -> Option<TestResults> {
    let answer: Vec<Option<String>> = serde_json::from_str(text).ok()?;
    let mut answer = answer.into_iter();
    Some(TestResults {
        host_prefix: answer.next().flatten().filter(|prefix| !prefix.is_empty()),
        blocked_prefix: answer.next().flatten().filter(|prefix| !prefix.is_empty()),
    })
}
