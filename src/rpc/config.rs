use std::path::PathBuf;
use std::time::Duration;

use crate::common::{
    PeerAddress, MAX_BUCKET_SIZE_K, SIBLING_BUCKET_SIZE_S, SPLIT_GRANULARITY_B,
};

/// Default number of concurrent requests in a lookup.
pub const DEFAULT_ALPHA: usize = 3;
/// Default request timeout before abandoning an inflight request to a non-responding peer.
///
/// Anonymity networks have long round trips, hence the generous default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REPLICATION_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REPLICATION_JITTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPLICATION_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Capacity of each k-bucket, also the number of results of a lookup
    /// and the number of peers an item is stored on.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Capacity of the sibling bucket.
    ///
    /// Defaults to [SIBLING_BUCKET_SIZE_S]
    pub s: usize,
    /// Concurrent requests in a lookup.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Buckets away from the local Id only split at depths that are not a multiple of `b`.
    ///
    /// Defaults to [SPLIT_GRANULARITY_B]
    pub b: u16,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are deemeed "done".
    /// The shorter this duration is, the more responses from slow peers we miss out on,
    /// and the more peers get locked for no good reason.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Overall timeout of a single lookup.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub lookup_timeout: Duration,
    /// How long find and delete authorization queries wait for responses.
    ///
    /// Defaults to [DEFAULT_RESPONSE_TIMEOUT]
    pub response_timeout: Duration,
    /// Buckets (and sibling sections) not looked up for this long get refreshed.
    ///
    /// Defaults to [DEFAULT_BUCKET_REFRESH_INTERVAL]
    pub bucket_refresh_interval: Duration,
    /// How often the main loop checks for stale buckets and lost peers.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
    /// Pause between bootstrap rounds where no seed responded.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_RETRY_INTERVAL]
    pub bootstrap_retry_interval: Duration,
    /// Average pause between replication cycles.
    ///
    /// Defaults to [DEFAULT_REPLICATION_INTERVAL]
    pub replication_interval: Duration,
    /// Maximum random deviation from `replication_interval`, in both directions.
    ///
    /// Defaults to [DEFAULT_REPLICATION_JITTER]
    pub replication_jitter: Duration,
    /// How long replication waits after each store for a possible delete request.
    ///
    /// Defaults to [DEFAULT_REPLICATION_WAIT]
    pub replication_wait: Duration,
    /// Bootstrap peers.
    ///
    /// Defaults to an empty list, there are no public seeds to build in.
    pub bootstrap: Vec<PeerAddress>,
    /// File to read bootstrap peers from at startup, and to persist the routing table to
    /// on shutdown.
    ///
    /// Defaults to None
    pub peer_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: MAX_BUCKET_SIZE_K,
            s: SIBLING_BUCKET_SIZE_S,
            alpha: DEFAULT_ALPHA,
            b: SPLIT_GRANULARITY_B,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            bootstrap_retry_interval: DEFAULT_BOOTSTRAP_RETRY_INTERVAL,
            replication_interval: DEFAULT_REPLICATION_INTERVAL,
            replication_jitter: DEFAULT_REPLICATION_JITTER,
            replication_wait: DEFAULT_REPLICATION_WAIT,
            bootstrap: Vec::new(),
            peer_file: None,
        }
    }
}
