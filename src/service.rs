//! API service: the Get/Set/Subscribe surface over a shared engine.
//!
//! Validates input before it reaches the engine and runs every blocking
//! engine call on the blocking pool. Engine errors are surfaced unchanged.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::constants::MIN_TTL;
use crate::error::{Error, Result};
use crate::hub::Subscription;
use crate::metrics;
use crate::store::{Datastore, GetRequest, KeyValue, SetRequest};

/// Cheaply cloneable handle to the store's public operations.
#[derive(Clone)]
pub struct ApiService {
    store: Arc<dyn Datastore>,
}

impl ApiService {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    /// Resolves point and prefix requests in one snapshot.
    ///
    /// Absent keys are omitted; results follow request order.
    pub async fn get_values(&self, requests: Vec<GetRequest>) -> Result<Vec<KeyValue>> {
        let prefixes = requests.iter().filter(|r| r.is_prefix).count();
        metrics::record_get(requests.len() - prefixes, prefixes);

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.get(&requests)).await?
    }

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty key or a TTL under 1 ms, and
    /// [`Error::Write`] if the engine rejects the batch.
    pub async fn set_values(&self, request: SetRequest) -> Result<()> {
        validate_set(&request)?;
        let entries = request.entries.len();
        let with_ttl = request.ttl.is_some();

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.set(&request)).await??;

        metrics::record_set(entries, with_ttl);
        debug!(entries, with_ttl, "Batch applied");
        Ok(())
    }

    /// Opens a pull-style subscription: snapshot batches, then live ones.
    pub async fn subscribe(&self, prefixes: Vec<Vec<u8>>) -> Result<Subscription> {
        let store = Arc::clone(&self.store);
        let subscription =
            tokio::task::spawn_blocking(move || store.subscribe(&prefixes)).await??;
        debug!(
            subscription = subscription.id(),
            prefixes = subscription.prefixes().len(),
            "Subscription opened"
        );
        Ok(subscription)
    }

    /// Drives a subscription into `handler` until `cancel` resolves.
    ///
    /// Cancellation returns `Ok(())`. A handler error or a broken feed ends
    /// the subscription with that error.
    pub async fn run_subscription<C, H, Fut>(
        &self,
        prefixes: Vec<Vec<u8>>,
        cancel: C,
        mut handler: H,
    ) -> Result<()>
    where
        C: Future<Output = ()>,
        H: FnMut(Vec<KeyValue>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        tokio::pin!(cancel);

        let mut subscription = tokio::select! {
            biased;
            () = &mut cancel => return Ok(()),
            subscription = self.subscribe(prefixes) => subscription?,
        };

        loop {
            let batch = tokio::select! {
                biased;
                () = &mut cancel => break,
                batch = subscription.next() => batch?,
            };
            tokio::select! {
                biased;
                () = &mut cancel => break,
                handled = handler(batch) => handled?,
            }
        }

        debug!(subscription = subscription.id(), "Subscription cancelled");
        Ok(())
    }

    /// Ends every live subscription and refuses new ones.
    pub fn shutdown(&self) {
        debug!(backend = self.store.backend_name(), "Closing change feed");
        self.store.close();
    }
}

impl std::fmt::Debug for ApiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiService")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

fn validate_set(request: &SetRequest) -> Result<()> {
    if let Some(index) = request.entries.iter().position(|e| e.key.is_empty()) {
        return Err(Error::validation(format!("message {index} has an empty key")));
    }
    if request.ttl.is_some_and(|ttl| ttl < MIN_TTL) {
        return Err(Error::validation("ttl must be at least 1 ms"));
    }
    Ok(())
}
