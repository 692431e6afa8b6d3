use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use url::Url;

use super::QueuedMap;
use crate::error::ErrorCode;

/// Runs a user callback, logging and swallowing a panic
pub(crate) fn guarded<R>(callback: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(callback, "Handler callback panicked");
            None
        }
    }
}

/// Receiver of channel callbacks.
///
/// Callbacks run on the channel loop; a panicking callback is logged and
/// otherwise ignored.
pub trait Handler: Send {
    fn channel_opened(&mut self) {}

    /// One server array, in array id order
    fn channel_handle_array(&mut self, _array: Value) {}

    /// Fatal error, always followed by `channel_closed`
    fn channel_error(&mut self, _code: ErrorCode) {}

    /// Maps sent but unacknowledged, and maps never sent
    fn channel_closed(&mut self, _pending: Vec<QueuedMap>, _undelivered: Vec<QueuedMap>) {}

    /// Checked before every request, any code but `Ok` closes the channel
    fn ok_to_make_request(&mut self) -> ErrorCode {
        ErrorCode::Ok
    }

    /// Query parameters added to every request
    fn additional_params(&mut self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn network_test_uri(&mut self) -> Option<Url> {
        None
    }

    /// An inactive application gets slower retries
    fn is_active(&mut self) -> bool {
        true
    }

    fn correct_host_prefix(&self, prefix: Option<String>) -> Option<String> {
        prefix
    }
}
