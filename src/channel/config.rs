use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

use crate::{
    consts::*,
    error::{BcError, Result},
};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel root, `test` and `bind` live below it
    pub base_url: Url,
    pub app_version: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub watchdog_timeout: Duration,
    pub forward_request_timeout: Duration,
    pub forward_max_retries: u32,
    pub back_channel_max_retries: u32,
    pub fail_fast: bool,
    pub allow_host_prefix: bool,
    pub allow_streaming: bool,
    /// Use the host prefix for test stage 2 and the backward channel
    pub supports_cross_domain: bool,
    pub readystate_throttle: Option<Duration>,
    pub retry_delay_base: Duration,
    pub retry_delay_jitter: Duration,
    pub stale_back_channel_threshold: Duration,
    pub dead_back_channel_timeout: Duration,
    pub seed: u64,
}

impl ChannelConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() || base_url.host_str().is_none() {
            return Err(BcError::BadConfig(format!(
                "{base_url} cannot be a channel root"
            )));
        }

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(10);

        Ok(ChannelConfig {
            base_url,
            app_version: None,
            extra_headers: Vec::new(),
            watchdog_timeout: WATCHDOG_TIMEOUT,
            forward_request_timeout: FORWARD_CHANNEL_REQUEST_TIMEOUT,
            forward_max_retries: FORWARD_CHANNEL_MAX_RETRIES,
            back_channel_max_retries: BACK_CHANNEL_MAX_RETRIES,
            fail_fast: false,
            allow_host_prefix: true,
            allow_streaming: true,
            supports_cross_domain: false,
            readystate_throttle: Some(POLLING_INTERVAL),
            retry_delay_base: RETRY_DELAY_BASE,
            retry_delay_jitter: RETRY_DELAY_JITTER,
            stale_back_channel_threshold: STALE_BACKCHANNEL_THRESHOLD,
            dead_back_channel_timeout: DEAD_BACKCHANNEL_TIMEOUT,
            seed,
        })
    }

    pub fn forward_retry_budget(&self) -> u32 {
        if self.fail_fast {
            0
        } else {
            self.forward_max_retries
        }
    }
}
