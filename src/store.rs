//! Local persistence of the user data bundle, backed by redb.
//!
//! Three tables:
//!   buckets: bucket name → bucket content as JSON bytes
//!   hashes:  bucket name → content hash the server advertised
//!   meta:    "synced_at" → RFC 3339 timestamp
//!
//! A bucket only counts as present when it has a hash entry. Writes that
//! touch several buckets happen in one transaction, so a bucket and its hash
//! are never observed out of step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::bundle::{Bucket, ReceivedBundle, UserDataBundle};
use crate::state::{SyncError, SyncResult};

const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");
const HASHES: TableDefinition<&str, &str> = TableDefinition::new("hashes");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const SYNCED_AT_KEY: &str = "synced_at";

/// Handle to the persisted bundle.
pub struct LocalSyncStore {
    db: Database,
}

impl LocalSyncStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let db = Database::create(path)?;
        {
            let txn = db.begin_write()?;
            txn.open_table(BUCKETS)?;
            txn.open_table(HASHES)?;
            txn.open_table(META)?;
            txn.commit()?;
        }
        tracing::debug!("Opened bundle store at {}", path.display());
        Ok(Self { db })
    }

    /// Default location: `<data dir>/edugo/sync.redb`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("edugo").join("sync.redb"))
    }

    /// Replace the whole persisted bundle. Buckets are stored as the JSON the
    /// server sent.
    pub fn save(&self, received: &ReceivedBundle) -> SyncResult<()> {
        let encoded = encode_entries(received)?;
        let txn = self.db.begin_write()?;
        {
            let mut buckets = txn.open_table(BUCKETS)?;
            let mut hashes = txn.open_table(HASHES)?;

            let stale: Vec<String> = hashes
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<Vec<String>, redb::StorageError>>()?;
            for name in &stale {
                hashes.remove(name.as_str())?;
                buckets.remove(name.as_str())?;
            }

            for (bucket, bytes, hash) in &encoded {
                buckets.insert(bucket.as_str(), bytes.as_slice())?;
                hashes.insert(bucket.as_str(), hash.as_str())?;
            }

            let mut meta = txn.open_table(META)?;
            meta.insert(
                SYNCED_AT_KEY,
                received.bundle.synced_at.to_rfc3339().as_str(),
            )?;
        }
        txn.commit()?;
        tracing::debug!("Saved bundle with {} buckets", encoded.len());
        Ok(())
    }

    /// Load the persisted bundle. `None` if nothing was ever saved.
    pub fn restore(&self) -> SyncResult<Option<UserDataBundle>> {
        let txn = self.db.begin_read()?;
        let hashes = txn.open_table(HASHES)?;
        let buckets = txn.open_table(BUCKETS)?;
        let meta = txn.open_table(META)?;

        let synced_at = match meta.get(SYNCED_AT_KEY)? {
            Some(raw) => Some(parse_timestamp(raw.value())?),
            None => None,
        };

        let mut bundle = UserDataBundle::default();
        for entry in hashes.iter()? {
            let (name, hash) = entry?;
            let bucket: Bucket = match name.value().parse() {
                Ok(b) => b,
                Err(_) => {
                    tracing::warn!("Skipping unknown stored bucket {}", name.value());
                    continue;
                }
            };
            let content = buckets.get(bucket.as_str())?.ok_or_else(|| {
                SyncError::InvalidData(format!("bucket {bucket} has a hash but no content"))
            })?;
            let value: Value = serde_json::from_slice(content.value())
                .map_err(|e| SyncError::Decoding(format!("stored bucket {bucket}: {e}")))?;
            bundle.apply_bucket(bucket, &value, hash.value().to_string())?;
        }

        if bundle.hashes.is_empty() && synced_at.is_none() {
            return Ok(None);
        }
        bundle.synced_at = synced_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Ok(Some(bundle))
    }

    /// Replace a single bucket. Other buckets are untouched; `synced_at`
    /// only moves forward.
    pub fn update_bucket(
        &self,
        bucket: Bucket,
        value: &Value,
        hash: &str,
        synced_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let txn = self.db.begin_write()?;
        {
            let mut buckets = txn.open_table(BUCKETS)?;
            buckets.insert(bucket.as_str(), bytes.as_slice())?;
            let mut hashes = txn.open_table(HASHES)?;
            hashes.insert(bucket.as_str(), hash)?;
            let mut meta = txn.open_table(META)?;
            advance_synced_at(&mut meta, synced_at)?;
        }
        txn.commit()?;
        tracing::debug!("Updated bucket {} ({})", bucket, hash);
        Ok(())
    }

    /// Merge a partial bundle into the persisted one and return the result.
    /// Buckets the partial does not carry keep their content and hash.
    pub fn merge_partial(&self, partial: &ReceivedBundle) -> SyncResult<UserDataBundle> {
        let mut merged = self.restore()?.unwrap_or_default();
        merged.merge(&partial.bundle);

        let encoded = encode_entries(partial)?;
        let txn = self.db.begin_write()?;
        {
            let mut buckets = txn.open_table(BUCKETS)?;
            let mut hashes = txn.open_table(HASHES)?;
            for (bucket, bytes, hash) in &encoded {
                buckets.insert(bucket.as_str(), bytes.as_slice())?;
                hashes.insert(bucket.as_str(), hash.as_str())?;
            }
            let mut meta = txn.open_table(META)?;
            meta.insert(SYNCED_AT_KEY, merged.synced_at.to_rfc3339().as_str())?;
        }
        txn.commit()?;
        Ok(merged)
    }

    /// Record a sync that changed no bucket.
    pub fn mark_synced(&self, synced_at: DateTime<Utc>) -> SyncResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            advance_synced_at(&mut meta, synced_at)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Stored JSON of one bucket, exactly as written.
    pub fn stored_value(&self, bucket: Bucket) -> SyncResult<Option<Value>> {
        let txn = self.db.begin_read()?;
        let buckets = txn.open_table(BUCKETS)?;
        let value = match buckets.get(bucket.as_str())? {
            Some(content) => Some(
                serde_json::from_slice(content.value())
                    .map_err(|e| SyncError::Decoding(format!("stored bucket {bucket}: {e}")))?,
            ),
            None => None,
        };
        Ok(value)
    }

    /// Bucket → hash map sent on delta sync.
    pub fn stored_hashes(&self) -> SyncResult<BTreeMap<Bucket, String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(HASHES)?;
        let mut hashes = BTreeMap::new();
        for entry in table.iter()? {
            let (name, hash) = entry?;
            if let Ok(bucket) = name.value().parse::<Bucket>() {
                hashes.insert(bucket, hash.value().to_string());
            }
        }
        Ok(hashes)
    }

    pub fn synced_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        let synced_at = match meta.get(SYNCED_AT_KEY)? {
            Some(raw) => Some(parse_timestamp(raw.value())?),
            None => None,
        };
        Ok(synced_at)
    }

    /// Delete every persisted bucket, hash and timestamp.
    pub fn clear(&self) -> SyncResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut buckets = txn.open_table(BUCKETS)?;
            let mut hashes = txn.open_table(HASHES)?;
            let mut meta = txn.open_table(META)?;
            let names: Vec<String> = buckets
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<Vec<String>, redb::StorageError>>()?;
            for name in &names {
                buckets.remove(name.as_str())?;
            }
            let names: Vec<String> = hashes
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<Vec<String>, redb::StorageError>>()?;
            for name in &names {
                hashes.remove(name.as_str())?;
            }
            meta.remove(SYNCED_AT_KEY)?;
        }
        txn.commit()?;
        tracing::info!("Cleared local bundle store");
        Ok(())
    }

    /// Overwrite a bucket's stored bytes without touching its hash.
    #[cfg(test)]
    pub(crate) fn write_raw_bucket(&self, bucket: Bucket, bytes: &[u8]) -> SyncResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut buckets = txn.open_table(BUCKETS)?;
            buckets.insert(bucket.as_str(), bytes)?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// Raw JSON bytes of every received bucket together with its hash.
fn encode_entries(received: &ReceivedBundle) -> SyncResult<Vec<(Bucket, Vec<u8>, String)>> {
    received
        .entries()
        .map(|(bucket, value, hash)| -> SyncResult<(Bucket, Vec<u8>, String)> {
            Ok((bucket, serde_json::to_vec(value)?, hash.to_string()))
        })
        .collect()
}

fn advance_synced_at(
    meta: &mut redb::Table<'_, &'static str, &'static str>,
    synced_at: DateTime<Utc>,
) -> SyncResult<()> {
    let current = match meta.get(SYNCED_AT_KEY)? {
        Some(raw) => Some(parse_timestamp(raw.value())?),
        None => None,
    };
    if current.map_or(true, |c| synced_at > c) {
        meta.insert(SYNCED_AT_KEY, synced_at.to_rfc3339().as_str())?;
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Decoding(format!("stored synced_at {raw:?}: {e}")))
}
