//! Background reclamation scheduler.
//!
//! Runs [`Datastore::reclaim`] once immediately and then again every
//! interval, measured from the end of the previous run. Runs never overlap.
//! A failed run stops the scheduler and is returned to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::config::StoreSettings;
use crate::error::Result;
use crate::metrics;
use crate::store::{Datastore, Reclaim, StopFlag};

/// Periodic driver for space reclamation.
pub struct ReclamationScheduler {
    store: Arc<dyn Datastore>,
    interval: Duration,
    discard_ratio: f64,
}

/// Raises the flag if the run is abandoned, e.g. when the scheduler
/// future is dropped mid-run.
struct StopOnDrop(StopFlag);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

impl ReclamationScheduler {
    pub fn new(store: Arc<dyn Datastore>, interval: Duration, discard_ratio: f64) -> Self {
        Self {
            store,
            interval,
            discard_ratio,
        }
    }

    pub fn from_settings(store: Arc<dyn Datastore>, settings: &StoreSettings) -> Self {
        Self::new(store, settings.reclamation_interval(), settings.discard_ratio)
    }

    /// Runs until `shutdown` resolves or a reclamation run fails.
    ///
    /// On shutdown an in-flight run is asked to stop and awaited before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failed run.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        info!(
            interval_secs = self.interval.as_secs_f64(),
            discard_ratio = self.discard_ratio,
            "Reclamation scheduler started"
        );

        loop {
            let stop = StopFlag::new();
            let _guard = StopOnDrop(stop.clone());
            let started = Instant::now();

            let store = Arc::clone(&self.store);
            let discard_ratio = self.discard_ratio;
            let run_stop = stop.clone();
            let mut task =
                tokio::task::spawn_blocking(move || store.reclaim(discard_ratio, &run_stop));

            tokio::select! {
                joined = &mut task => {
                    record_run(joined?, started)?;
                }
                () = &mut shutdown => {
                    stop.stop();
                    debug!("Waiting for in-flight reclamation to stop");
                    record_run(task.await?, started)?;
                    break;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = &mut shutdown => break,
            }
        }

        info!("Reclamation scheduler stopped");
        Ok(())
    }
}

fn record_run(result: Result<Reclaim>, started: Instant) -> Result<Reclaim> {
    let elapsed = started.elapsed();
    match result {
        Ok(outcome) => {
            let entries = match outcome {
                Reclaim::NoOp => {
                    debug!(duration_ms = elapsed.as_millis() as u64, "Nothing to reclaim");
                    0
                },
                Reclaim::Reclaimed { segments, entries } => {
                    info!(
                        segments,
                        entries,
                        duration_ms = elapsed.as_millis() as u64,
                        "Reclaimed expired entries"
                    );
                    entries
                },
            };
            metrics::record_reclaim(outcome.outcome(), entries, elapsed.as_secs_f64());
            Ok(outcome)
        },
        Err(err) => {
            error!(error = %err, "Reclamation failed, stopping scheduler");
            metrics::record_reclaim("error", 0, elapsed.as_secs_f64());
            Err(err)
        },
    }
}
