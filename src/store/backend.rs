//! Engine contract implemented by every storage backend.

use super::types::{GetRequest, Reclaim, SetRequest, StopFlag};
use super::KeyValue;
use crate::error::Result;
use crate::hub::Subscription;

/// A persistent ordered key-value engine.
///
/// All methods are blocking; async callers run them on the blocking pool.
/// Implementations must be safe to share across threads.
pub trait Datastore: Send + Sync + 'static {
    /// Resolves point and prefix requests against one consistent snapshot.
    ///
    /// Results follow request order; prefix results are ascending by key.
    /// Absent and expired keys are omitted.
    fn get(&self, requests: &[GetRequest]) -> Result<Vec<KeyValue>>;

    /// Atomically applies a batch, then publishes it to subscribers.
    ///
    /// On error nothing from the batch is visible and nothing is published.
    fn set(&self, request: &SetRequest) -> Result<()>;

    /// Opens a subscription over `prefixes`.
    ///
    /// The snapshot and the live feed are cut at the same point: every
    /// committed batch is either in the snapshot or delivered live.
    fn subscribe(&self, prefixes: &[Vec<u8>]) -> Result<Subscription>;

    /// Physically removes expired entries from segments whose stale share
    /// reaches `discard_ratio`. Runs alongside reads and writes.
    fn reclaim(&self, discard_ratio: f64, stop: &StopFlag) -> Result<Reclaim>;

    /// Ends every live subscription and refuses new ones.
    fn close(&self);

    /// Short name for logs.
    fn backend_name(&self) -> &'static str;
}
