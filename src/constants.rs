//! Centralized defaults and limits.
//!
//! Every tunable that has a default lives here so that configuration,
//! engines and tests agree on the same values.

use std::time::Duration;

// =============================================================================
// Network
// =============================================================================

/// Default address of the API listener.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7777";

/// Default address of the Prometheus metrics listener.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Maximum request body size (10 MB).
pub const MAX_BODY_SIZE_BYTES: usize = 10 * 1024 * 1024;

// =============================================================================
// Storage
// =============================================================================

/// Default redb page cache size (64 MB).
pub const DEFAULT_CACHE_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// Size of the per-entry header holding the expiration timestamp.
pub const ENTRY_HEADER_LEN: usize = 8;

/// Shortest accepted TTL; expirations are stored in whole milliseconds.
pub const MIN_TTL: Duration = Duration::from_millis(1);

// =============================================================================
// Reclamation
// =============================================================================

/// Default fraction of expired entries a segment needs before it is rewritten.
pub const DEFAULT_DISCARD_RATIO: f64 = 0.5;

/// Default interval between reclamation runs (5 minutes).
pub const DEFAULT_RECLAMATION_INTERVAL_SECS: u64 = 5 * 60;

/// Default number of entries per reclamation segment.
pub const DEFAULT_RECLAIM_SEGMENT_ENTRIES: usize = 1024;

// =============================================================================
// Subscriptions
// =============================================================================

/// Default number of change batches buffered per subscriber before it is
/// considered lagging and dropped.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;
