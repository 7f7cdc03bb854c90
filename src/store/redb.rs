//! File-backed engine on top of redb.
//!
//! Entries live in a single `&[u8] -> &[u8]` table ordered by key. Each
//! stored value carries an 8-byte expiration header (see
//! `types::encode_entry`); expired entries are hidden on read and removed
//! physically by [`Datastore::reclaim`].

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use redb::{
    Database, ReadableDatabase, ReadableTable, RepairSession, TableDefinition, WriteTransaction,
};
use tracing::{debug, warn};

use super::backend::Datastore;
use super::normalize_prefixes;
use super::types::{
    GetRequest, KeyValue, Reclaim, SetRequest, StopFlag, decode_entry, display_key,
    encode_entry, expiry_for, is_expired, now_millis, segment_qualifies, validate_discard_ratio,
};
use crate::config::StoreSettings;
use crate::constants::{
    DEFAULT_CACHE_SIZE_BYTES, DEFAULT_RECLAIM_SEGMENT_ENTRIES, DEFAULT_SUBSCRIBER_BUFFER,
};
use crate::error::{Error, Result};
use crate::hub::{ChangeHub, Subscription};

/// Ordered entries table.
const ENTRIES: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("entries");

/// Engine knobs for [`RedbStore`].
#[derive(Debug, Clone)]
pub struct RedbOptions {
    /// Page cache size in bytes.
    pub cache_size_bytes: usize,
    /// Allow redb to repair a database that was not closed cleanly.
    /// When false, opening such a file fails instead.
    pub allow_repair: bool,
    /// Entries per reclamation segment.
    pub segment_entries: usize,
    /// Batches buffered per subscriber.
    pub subscriber_buffer: usize,
}

impl Default for RedbOptions {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            allow_repair: true,
            segment_entries: DEFAULT_RECLAIM_SEGMENT_ENTRIES,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl From<&StoreSettings> for RedbOptions {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            cache_size_bytes: settings.cache_size_bytes,
            allow_repair: settings.allow_repair,
            segment_entries: settings.reclaim_segment_entries,
            subscriber_buffer: settings.subscriber_buffer,
        }
    }
}

/// Persistent engine backed by a redb file.
pub struct RedbStore {
    db: Database,
    path: PathBuf,
    hub: ChangeHub,
    /// Held from the start of a write batch until it has been published, and
    /// while a subscription takes its snapshot and registers.
    commit_lock: Mutex<()>,
    segment_entries: usize,
    #[cfg(test)]
    fail_after: std::sync::atomic::AtomicUsize,
}

impl RedbStore {
    /// Opens or creates the database at `path`.
    ///
    /// Creates parent directories if needed and initializes the entries
    /// table on first open.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Parent directory cannot be created
    /// - Database file cannot be opened (permissions, corruption with
    ///   repair disabled, etc.)
    /// - Initialization transaction fails
    pub fn open(path: impl AsRef<Path>, options: &RedbOptions) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::write(format!("create data directory {}", parent.display()), e)
            })?;
        }

        let mut builder = Database::builder();
        builder.set_cache_size(options.cache_size_bytes);
        if !options.allow_repair {
            builder.set_repair_callback(|session: &mut RepairSession| {
                warn!("Datastore needs repair but repair is disabled");
                session.abort();
            });
        }
        let db = builder
            .create(path)
            .map_err(|e| Error::read(format!("open datastore {}", path.display()), e))?;

        let txn = db
            .begin_write()
            .map_err(|e| Error::write("begin initialization transaction", e))?;
        txn.open_table(ENTRIES)
            .map_err(|e| Error::write("initialize entries table", e))?;
        txn.commit()
            .map_err(|e| Error::write("commit initialization transaction", e))?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            hub: ChangeHub::new(options.subscriber_buffer),
            commit_lock: Mutex::new(()),
            segment_entries: options.segment_entries.max(1),
            #[cfg(test)]
            fail_after: std::sync::atomic::AtomicUsize::new(usize::MAX),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Makes every later batch fail after writing `entries` entries.
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&self, entries: usize) {
        self.fail_after
            .store(entries, std::sync::atomic::Ordering::SeqCst);
    }

    /// Writes a stored value verbatim, bypassing the entry layout.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &[u8], raw: &[u8]) {
        let txn = self.db.begin_write().unwrap();
        txn.open_table(ENTRIES).unwrap().insert(key, raw).unwrap();
        txn.commit().unwrap();
    }

    #[cfg(test)]
    fn injected_fault(&self, written: usize) -> bool {
        written >= self.fail_after.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[cfg(not(test))]
    #[inline]
    const fn injected_fault(&self, _written: usize) -> bool {
        false
    }

    fn write_entries(&self, txn: &WriteTransaction, request: &SetRequest) -> Result<()> {
        let expires_at = expiry_for(request.ttl, now_millis());
        let mut table = txn
            .open_table(ENTRIES)
            .map_err(|e| Error::write("open entries table", e))?;

        for (written, entry) in request.entries.iter().enumerate() {
            if self.injected_fault(written) {
                return Err(Error::write(
                    format!("set key '{}'", display_key(&entry.key)),
                    std::io::Error::other("injected write fault"),
                ));
            }

            let raw = encode_entry(&entry.value, expires_at);
            table
                .insert(entry.key.as_slice(), raw.as_slice())
                .map_err(|e| Error::write(format!("set key '{}'", display_key(&entry.key)), e))?;
        }
        Ok(())
    }

    /// Scans the table once and collects the expired keys of every segment
    /// whose stale share reaches `discard_ratio`.
    fn stale_segments(&self, discard_ratio: f64) -> Result<Vec<Vec<Vec<u8>>>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| Error::reclamation("begin read transaction", e))?;
        let table = txn
            .open_table(ENTRIES)
            .map_err(|e| Error::reclamation("open entries table", e))?;
        let now = now_millis();

        let mut segments = Vec::new();
        let mut expired = Vec::new();
        let mut total = 0usize;
        for item in table
            .iter()
            .map_err(|e| Error::reclamation("scan entries", e))?
        {
            let (key, raw) = item.map_err(|e| Error::reclamation("scan entries", e))?;
            total += 1;
            if decode_entry(raw.value()).is_some_and(|(exp, _)| is_expired(exp, now)) {
                expired.push(key.value().to_vec());
            }
            if total == self.segment_entries {
                if segment_qualifies(expired.len(), total, discard_ratio) {
                    segments.push(std::mem::take(&mut expired));
                } else {
                    expired.clear();
                }
                total = 0;
            }
        }
        if segment_qualifies(expired.len(), total, discard_ratio) {
            segments.push(expired);
        }
        Ok(segments)
    }

    /// Deletes the keys of one segment that are still expired.
    fn rewrite_segment(&self, keys: &[Vec<u8>]) -> Result<usize> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::reclamation("begin segment rewrite", e))?;
        let removed = {
            let mut table = txn
                .open_table(ENTRIES)
                .map_err(|e| Error::reclamation("open entries table", e))?;
            let now = now_millis();
            let mut removed = 0;
            for key in keys {
                // The key may have been rewritten since the scan
                let still_expired = match table
                    .get(key.as_slice())
                    .map_err(|e| Error::reclamation("read segment entry", e))?
                {
                    Some(raw) => {
                        decode_entry(raw.value()).is_some_and(|(exp, _)| is_expired(exp, now))
                    },
                    None => false,
                };
                if still_expired {
                    table
                        .remove(key.as_slice())
                        .map_err(|e| Error::reclamation("remove expired entry", e))?;
                    removed += 1;
                }
            }
            removed
        };
        txn.commit()
            .map_err(|e| Error::reclamation("commit segment rewrite", e))?;
        Ok(removed)
    }
}

fn corrupt_entry(key: &[u8]) -> Error {
    Error::read(
        format!("decode entry '{}'", display_key(key)),
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "stored value is shorter than its expiration header",
        ),
    )
}

fn scan_prefix<T>(table: &T, prefix: &[u8], now: u64, out: &mut Vec<KeyValue>) -> Result<()>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let context = || format!("scan prefix '{}'", display_key(prefix));
    let range = table
        .range(prefix..)
        .map_err(|e| Error::read(context(), e))?;
    for item in range {
        let (key, raw) = item.map_err(|e| Error::read(context(), e))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        let (expires_at, value) = decode_entry(raw.value()).ok_or_else(|| corrupt_entry(key))?;
        if !is_expired(expires_at, now) {
            out.push(KeyValue::new(key, value));
        }
    }
    Ok(())
}

impl Datastore for RedbStore {
    fn get(&self, requests: &[GetRequest]) -> Result<Vec<KeyValue>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| Error::read("begin read transaction", e))?;
        let table = txn
            .open_table(ENTRIES)
            .map_err(|e| Error::read("open entries table", e))?;
        let now = now_millis();

        let mut found = Vec::new();
        for request in requests {
            if request.is_prefix {
                scan_prefix(&table, &request.key, now, &mut found)?;
                continue;
            }

            let raw = table
                .get(request.key.as_slice())
                .map_err(|e| Error::read(format!("get key '{}'", display_key(&request.key)), e))?;
            if let Some(raw) = raw {
                let (expires_at, value) =
                    decode_entry(raw.value()).ok_or_else(|| corrupt_entry(&request.key))?;
                if !is_expired(expires_at, now) {
                    found.push(KeyValue::new(request.key.clone(), value));
                }
            }
        }
        Ok(found)
    }

    fn set(&self, request: &SetRequest) -> Result<()> {
        if request.entries.is_empty() {
            return Ok(());
        }

        let _commit = self.commit_lock.lock();
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::write("begin write transaction", e))?;
        if let Err(err) = self.write_entries(&txn, request) {
            if let Err(abort_err) = txn.abort() {
                warn!(error = %abort_err, "Failed to abort write transaction");
            }
            return Err(err);
        }
        txn.commit().map_err(|e| {
            Error::write(format!("commit batch of {} entries", request.entries.len()), e)
        })?;

        self.hub.publish(&request.entries);
        Ok(())
    }

    fn subscribe(&self, prefixes: &[Vec<u8>]) -> Result<Subscription> {
        let prefixes = normalize_prefixes(prefixes);

        let (txn, subscription) = {
            let _commit = self.commit_lock.lock();
            let txn = self
                .db
                .begin_read()
                .map_err(|e| Error::read("begin snapshot transaction", e))?;
            let subscription = self.hub.register(prefixes.clone())?;
            (txn, subscription)
        };

        let table = txn
            .open_table(ENTRIES)
            .map_err(|e| Error::read("open entries table", e))?;
        let now = now_millis();
        let mut snapshot = Vec::with_capacity(prefixes.len());
        for prefix in &prefixes {
            let mut batch = Vec::new();
            scan_prefix(&table, prefix, now, &mut batch)?;
            snapshot.push(batch);
        }
        debug!(
            subscription = subscription.id(),
            batches = snapshot.iter().filter(|b| !b.is_empty()).count(),
            "Snapshot taken"
        );
        Ok(subscription.with_snapshot(snapshot))
    }

    fn reclaim(&self, discard_ratio: f64, stop: &StopFlag) -> Result<Reclaim> {
        validate_discard_ratio(discard_ratio)?;

        let stale = self.stale_segments(discard_ratio)?;
        let mut segments = 0;
        let mut entries = 0;
        for keys in &stale {
            if stop.is_stopped() {
                debug!(remaining = stale.len() - segments, "Reclamation stopped early");
                break;
            }
            entries += self.rewrite_segment(keys)?;
            segments += 1;
        }

        if segments == 0 {
            Ok(Reclaim::NoOp)
        } else {
            Ok(Reclaim::Reclaimed { segments, entries })
        }
    }

    fn close(&self) {
        self.hub.close("store closed");
    }

    fn backend_name(&self) -> &'static str {
        "redb"
    }
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}
