//! Storage engines.
//!
//! A persistent ordered key-value store with point and prefix reads,
//! atomic write batches with an optional shared TTL, prefix subscriptions
//! and background space reclamation.
//!
//! # Module Structure
//!
//! - `types` - Request/response types and the stored entry layout
//! - `backend` - [`Datastore`] trait implemented by every engine
//! - `redb` - File-backed engine on top of redb
//! - `memory` - In-memory engine for tests and ephemeral deployments

mod backend;
mod memory;
mod redb;
mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::info;

pub use backend::Datastore;
pub use memory::MemoryStore;
pub use self::redb::{RedbOptions, RedbStore};
pub use types::{GetRequest, KeyValue, Reclaim, SetRequest, StopFlag};

use crate::config::StoreSettings;
use crate::error::{Error, Result};

/// Opens the engine selected by `settings`.
///
/// # Errors
///
/// Returns [`Error::Config`] if no path is configured for a persistent
/// store, or an engine error if the database cannot be opened.
pub fn open(settings: &StoreSettings) -> Result<Arc<dyn Datastore>> {
    if settings.in_memory {
        info!("Opening in-memory datastore");
        return Ok(Arc::new(MemoryStore::new(
            settings.reclaim_segment_entries,
            settings.subscriber_buffer,
        )));
    }

    let path = settings.path.as_deref().ok_or_else(|| {
        Error::Config("store.path is required unless store.in_memory is set".to_string())
    })?;
    let store = RedbStore::open(path, &RedbOptions::from(settings))?;
    info!(path = %path.display(), "Opened datastore");
    Ok(Arc::new(store))
}

/// Sorts and deduplicates prefixes, dropping any prefix covered by a
/// shorter one in the same set.
pub(crate) fn normalize_prefixes(prefixes: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut sorted = prefixes.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut normalized: Vec<Vec<u8>> = Vec::with_capacity(sorted.len());
    for prefix in sorted {
        // Sorted order puts a covering prefix right before what it covers
        if normalized.last().is_some_and(|last| prefix.starts_with(last)) {
            continue;
        }
        normalized.push(prefix);
    }
    normalized
}
