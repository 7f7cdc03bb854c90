// =============================================================================
// Lint Configuration
// =============================================================================

#![deny(unsafe_code)]
// Correctness: Must handle all fallible operations
#![deny(unused_must_use)]
// Quality: Pedantic but pragmatic
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![allow(missing_debug_implementations)] // Trait objects and redb handles lack Debug

// Allowed with documented reasons
#![allow(clippy::missing_errors_doc)] // Error returns self-documenting via type
#![allow(clippy::missing_panics_doc)] // Panics documented in main entry points
#![allow(clippy::module_name_repetitions)] // e.g., store::StoreSettings is clearer
#![allow(clippy::doc_markdown)] // Too many false positives in code docs
#![allow(clippy::must_use_candidate)] // Not all returned values need annotation
#![allow(clippy::cast_possible_truncation)] // Millisecond timestamps fit in u64
#![allow(clippy::cast_sign_loss)] // Intentional in size calculations
#![allow(clippy::cast_precision_loss)] // Ratios and metric values

//! kvetch - a persistent ordered key-value store with a remote API.
//!
//! Point and prefix reads, atomic write batches with a shared TTL, live
//! prefix subscriptions (a consistent snapshot followed by every later
//! change) and a background reclamation cycle that frees the space held by
//! expired entries.
//!
//! # Example
//!
//! ```
//! use kvetch::store::{Datastore, GetRequest, KeyValue, MemoryStore, SetRequest};
//!
//! let store = MemoryStore::default();
//! store
//!     .set(&SetRequest::new(vec![
//!         KeyValue::new("a/1", "x"),
//!         KeyValue::new("a/2", "y"),
//!         KeyValue::new("b/1", "z"),
//!     ]))
//!     .unwrap();
//!
//! let found = store.get(&[GetRequest::prefix("a/")]).unwrap();
//! assert_eq!(found.len(), 2);
//! ```

/// Centralized defaults and limits.
pub mod constants;

/// Settings loaded from TOML and `KVETCH_*` environment variables.
pub mod config;

/// Error taxonomy shared by every layer.
pub mod error;

/// Change hub and subscriptions.
pub mod hub;

/// Structured logging setup.
pub mod logging;

/// Prometheus metrics.
pub mod metrics;

/// Background reclamation scheduler.
pub mod reclaim;

/// HTTP transport.
pub mod server;

/// Get/Set/Subscribe API over a shared engine.
pub mod service;

/// Storage engines.
pub mod store;

pub use error::{Error, Result};
