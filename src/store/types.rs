//! Type definitions shared by the storage engines.
//!
//! Contains the request/response shapes of the engine contract and the
//! on-disk entry layout used for expiration metadata.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::ENTRY_HEADER_LEN;
use crate::error::{Error, Result};

/// A key and its current value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One item of a Get: a point key or a prefix range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub key: Vec<u8>,
    pub is_prefix: bool,
}

impl GetRequest {
    /// Point lookup of a single key.
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            is_prefix: false,
        }
    }

    /// Every entry whose key starts with `prefix`, ascending.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            key: prefix.into(),
            is_prefix: true,
        }
    }
}

/// A write batch. All entries share the same optional TTL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetRequest {
    pub entries: Vec<KeyValue>,
    pub ttl: Option<Duration>,
}

impl SetRequest {
    pub fn new(entries: Vec<KeyValue>) -> Self {
        Self { entries, ttl: None }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Outcome of a reclamation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// No segment held enough stale data to be rewritten.
    NoOp,
    /// Segments were rewritten and expired entries physically removed.
    Reclaimed { segments: usize, entries: usize },
}

impl Reclaim {
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// Label used for logs and metrics.
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Reclaimed { .. } => "reclaimed",
        }
    }
}

/// Cooperative stop signal checked by reclamation between segments.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Entry layout
// =============================================================================

/// Current Unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Absolute expiration for a batch written at `now`.
///
/// The TTL is rounded up to whole milliseconds so a live entry never
/// expires before its TTL has elapsed.
pub(crate) fn expiry_for(ttl: Option<Duration>, now: u64) -> Option<u64> {
    ttl.map(|ttl| {
        let millis = u64::try_from(ttl.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX);
        now.saturating_add(millis)
    })
}

pub(crate) const fn is_expired(expires_at: Option<u64>, now: u64) -> bool {
    match expires_at {
        Some(expires_at) => expires_at <= now,
        None => false,
    }
}

/// Encodes `[expires_at: u64 BE][value]`; zero means the entry never expires.
pub(crate) fn encode_entry(value: &[u8], expires_at: Option<u64>) -> Vec<u8> {
    let mut raw = Vec::with_capacity(ENTRY_HEADER_LEN + value.len());
    raw.extend_from_slice(&expires_at.unwrap_or(0).to_be_bytes());
    raw.extend_from_slice(value);
    raw
}

/// Splits a stored entry into its expiration and value.
///
/// Returns `None` when the entry is shorter than its header.
pub(crate) fn decode_entry(raw: &[u8]) -> Option<(Option<u64>, &[u8])> {
    let (header, value) = raw.split_first_chunk::<ENTRY_HEADER_LEN>()?;
    let expires_at = u64::from_be_bytes(*header);
    Some(((expires_at != 0).then_some(expires_at), value))
}

/// Lossy rendering of a key for error context and logs.
pub(crate) fn display_key(key: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(key)
}

// =============================================================================
// Reclamation helpers
// =============================================================================

pub(crate) fn validate_discard_ratio(discard_ratio: f64) -> Result<()> {
    if (0.0..=1.0).contains(&discard_ratio) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "discard ratio must be within [0, 1], got {discard_ratio}"
        )))
    }
}

/// A segment is rewritten once its stale share reaches the discard ratio.
pub(crate) fn segment_qualifies(expired: usize, total: usize, discard_ratio: f64) -> bool {
    expired > 0 && total > 0 && (expired as f64 / total as f64) >= discard_ratio
}
