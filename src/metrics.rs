//! Metrics support for the relay

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for the pkarr record relay
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "pkarr_relay")]
#[allow(missing_docs)]
pub struct Metrics {
    /// Number of publishes that were stored
    pub publish_success: Counter,
    /// Number of publishes refused by validation
    pub publish_invalid: Counter,
    /// Number of publishes that failed to be stored
    pub publish_error: Counter,
    /// Number of failed cache writes
    pub cache_set_error: Counter,
    /// Lookups answered from the cache
    pub resolve_cache_hit: Counter,
    /// Lookups answered from the DHT
    pub resolve_dht_hit: Counter,
    /// Lookups answered from the store
    pub resolve_store_hit: Counter,
    /// Lookups with no result in any tier
    pub resolve_not_found: Counter,
    /// Lookups for undecodable identifiers
    pub resolve_invalid_identifier: Counter,
    /// Background DHT puts that succeeded
    pub propagate_success: Counter,
    /// Background DHT puts that failed
    pub propagate_error: Counter,
    /// Records not queued for a background DHT put
    pub propagate_dropped: Counter,
    /// Completed republish passes
    pub republish_runs: Counter,
    /// Records republished successfully
    pub republish_success: Counter,
    /// Records that failed to republish
    pub republish_error: Counter,
    /// Number of HTTP requests
    pub http_requests: Counter,
    /// Number of HTTP requests with a 2xx status code
    pub http_requests_success: Counter,
    /// Number of HTTP requests with a non-2xx status code
    pub http_requests_error: Counter,
    /// Total duration of all HTTP requests
    pub http_requests_duration_ms: Counter,
}
