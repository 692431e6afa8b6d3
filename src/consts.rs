use std::time::Duration;

/// Protocol version spoken by this client
pub const CHANNEL_VERSION: u32 = 8;
/// Version assumed when the open handshake does not carry one
pub const DEFAULT_SERVER_VERSION: u32 = 6;
/// Time without progress before a request is abandoned
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(45_000);
/// Minimum spacing between two parses of partial streaming data
pub const POLLING_INTERVAL: Duration = Duration::from_millis(250);
/// Base timeout of a forward channel POST, jittered per request
pub const FORWARD_CHANNEL_REQUEST_TIMEOUT: Duration = Duration::from_millis(20_000);
/// Fixed part of the retry delay
pub const RETRY_DELAY_BASE: Duration = Duration::from_millis(5_000);
/// Upper bound of the random part of the retry delay
pub const RETRY_DELAY_JITTER: Duration = Duration::from_millis(10_000);
pub const FORWARD_CHANNEL_MAX_RETRIES: u32 = 2;
pub const BACK_CHANNEL_MAX_RETRIES: u32 = 3;
/// Maps carried by a single forward POST
pub const MAX_MAPS_PER_REQUEST: usize = 1000;
/// Outstanding backchannel bytes below which a missing array means a dead backchannel
pub const OUTSTANDING_DATA_BACKCHANNEL_RETRY_CUTOFF: u64 = 37_500;
pub const DEAD_BACKCHANNEL_TIMEOUT: Duration = Duration::from_millis(6_000);
/// Age at which a backward request is considered stale by a "backchannel missing" reply
pub const STALE_BACKCHANNEL_THRESHOLD: Duration = Duration::from_millis(3_000);
/// Forward channel acknowledgement used by servers older than version 8
pub const MAGIC_RESPONSE_COOKIE: &str = "y2f%";
/// First progress text of an unbuffered test stage 2
pub const STREAMING_TEST_PAYLOAD: &str = "11111";
/// Time within which the streaming payload must show up
pub const STREAMING_TEST_WINDOW: Duration = Duration::from_millis(500);
pub const BLOCKED_PROBE_PATH: &str = "/mail/images/cleardot.gif";
pub const BLOCKED_PROBE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const BLOCKED_PROBE_ATTEMPTS: u32 = 3;
pub const BLOCKED_PROBE_PAUSE: Duration = Duration::from_millis(2_000);
pub const DEFAULT_NETWORK_TEST_URI: &str = "https://www.google.com/images/cleardot.gif";
pub const NETWORK_TEST_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Range of the random RID of the open request
pub const INITIAL_RID_RANGE: u64 = 100_000;
/// Arrays held back while waiting for a missing id
pub const MAX_REORDER_WINDOW: usize = 64;
/// RID used by every backward channel request
pub const BACK_CHANNEL_RID: &str = "rpc";
