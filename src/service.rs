//! Sync orchestration.
//!
//! [`SyncService`] ties the remote [`SyncApi`] to the [`LocalSyncStore`]:
//!
//! - `full_sync`: fetch the whole bundle and replace local state
//! - `sync_buckets`: fetch selected buckets and merge them in
//! - `delta_sync`: send local hashes, apply only the buckets that changed
//! - `launch_sync`: restore, then delta, then fall back to a full sync
//!
//! Each operation runs through the [`SyncStateTracker`], so at most one sync
//! is in flight and subscribers see `syncing → completed | error`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};

use crate::api::{BucketPayload, DeltaRequest, HttpSyncApi, SyncApi};
use crate::bundle::{check_bucket, verify_hash, Bucket, UserDataBundle};
use crate::config::Config;
use crate::state::{BundleSyncState, SyncError, SyncGuard, SyncResult, SyncStateTracker};
use crate::store::LocalSyncStore;

/// How `launch_sync` got the bundle up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// No usable local bundle; fetched everything.
    FullSync,
    /// Local bundle refreshed by delta; lists the buckets that changed.
    Delta(Vec<Bucket>),
    /// Delta failed, full sync succeeded.
    FullSyncAfterDeltaFailure,
    /// Both remote paths failed; the restored local bundle stays in use.
    Offline(SyncError),
}

pub struct SyncService {
    api: Arc<dyn SyncApi>,
    store: Arc<LocalSyncStore>,
    current: RwLock<Option<UserDataBundle>>,
    state: SyncStateTracker,
    verify_hashes: bool,
}

impl SyncService {
    pub fn new(api: Arc<dyn SyncApi>, store: LocalSyncStore) -> Self {
        Self {
            api,
            store: Arc::new(store),
            current: RwLock::new(None),
            state: SyncStateTracker::new(),
            verify_hashes: false,
        }
    }

    /// HTTP transport and on-disk store as described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api = HttpSyncApi::new(&config.server)?;
        let store = LocalSyncStore::open(&config.sync.db_path()?)?;
        Ok(Self::new(Arc::new(api), store).with_hash_verification(config.sync.verify_hashes))
    }

    pub fn with_hash_verification(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    pub fn store(&self) -> &LocalSyncStore {
        &self.store
    }

    pub fn state(&self) -> BundleSyncState {
        self.state.current()
    }

    /// Progress stream; always holds the latest state.
    pub fn subscribe(&self) -> watch::Receiver<BundleSyncState> {
        self.state.subscribe()
    }

    /// Snapshot of the bundle currently in memory.
    pub async fn current_bundle(&self) -> Option<UserDataBundle> {
        self.current.read().await.clone()
    }

    /// Load the persisted bundle into memory.
    pub async fn restore_local(&self) -> SyncResult<Option<UserDataBundle>> {
        let restored = self.with_store(|store| store.restore()).await?;
        if let Some(ref bundle) = restored {
            tracing::debug!(
                "Restored local bundle ({} buckets, synced {})",
                bundle.hashes.len(),
                bundle.synced_at
            );
        }
        *self.current.write().await = restored.clone();
        Ok(restored)
    }

    /// Fetch the whole bundle and replace local state with it.
    pub async fn full_sync(&self) -> SyncResult<UserDataBundle> {
        let guard = self.state.begin()?;
        tracing::info!("Full sync started");
        let result = self.run_full_sync().await;
        Self::finish(guard, "Full sync", &result);
        result
    }

    async fn run_full_sync(&self) -> SyncResult<UserDataBundle> {
        let received = self
            .api
            .fetch_bundle(None)
            .await?
            .validate(self.verify_hashes)?;
        if received.bundle.hashes.is_empty() {
            return Err(SyncError::InvalidData("server returned an empty bundle".to_string()));
        }

        let bundle = self
            .with_store(move |store| {
                store.save(&received)?;
                Ok(received.into_bundle())
            })
            .await?;
        *self.current.write().await = Some(bundle.clone());
        tracing::info!("Full sync stored {} buckets", bundle.hashes.len());
        Ok(bundle)
    }

    /// Fetch only `buckets` and merge them into local state. Buckets not
    /// requested keep their content and hash.
    pub async fn sync_buckets(&self, buckets: &[Bucket]) -> SyncResult<UserDataBundle> {
        if buckets.is_empty() {
            return Err(SyncError::InvalidData("no buckets requested".to_string()));
        }
        let guard = self.state.begin()?;
        tracing::info!("Bucket sync started: {:?}", buckets);
        let result = self.run_bucket_sync(buckets).await;
        Self::finish(guard, "Bucket sync", &result);
        result
    }

    async fn run_bucket_sync(&self, buckets: &[Bucket]) -> SyncResult<UserDataBundle> {
        let partial = self
            .api
            .fetch_bundle(Some(buckets))
            .await?
            .validate(self.verify_hashes)?;

        let received = partial.bundle.present_buckets();
        if let Some(extra) = received.iter().find(|b| !buckets.contains(*b)) {
            return Err(SyncError::InvalidData(format!(
                "server sent unrequested bucket {extra}"
            )));
        }
        if let Some(missing) = buckets.iter().find(|b| !received.contains(*b)) {
            return Err(SyncError::InvalidData(format!(
                "server omitted requested bucket {missing}"
            )));
        }

        let merged = self
            .with_store(move |store| store.merge_partial(&partial))
            .await?;
        *self.current.write().await = Some(merged.clone());
        Ok(merged)
    }

    /// Send local hashes and apply only the buckets the server reports as
    /// changed. Changed buckets are decoded and written concurrently; the
    /// in-memory bundle is reloaded from the store afterwards, so a partial
    /// failure leaves memory and disk agreeing. Returns the updated buckets.
    pub async fn delta_sync(&self) -> SyncResult<Vec<Bucket>> {
        let guard = self.state.begin()?;
        tracing::info!("Delta sync started");
        let result = self.run_delta_sync().await;
        Self::finish(guard, "Delta sync", &result);
        result
    }

    async fn run_delta_sync(&self) -> SyncResult<Vec<Bucket>> {
        let hashes = self.with_store(|store| store.stored_hashes()).await?;
        if hashes.is_empty() {
            return Err(SyncError::InvalidData(
                "no local bundle to compute a delta against".to_string(),
            ));
        }

        let response = self.api.fetch_delta(&DeltaRequest { hashes }).await?;
        let synced_at = response.synced_at.unwrap_or_else(Utc::now);
        tracing::debug!(
            "Delta response: {} changed, {} unchanged",
            response.changed.len(),
            response.unchanged.len()
        );

        let changed = response
            .changed
            .into_iter()
            .map(|(name, payload)| -> SyncResult<(Bucket, BucketPayload)> {
                Ok((name.parse::<Bucket>()?, payload))
            })
            .collect::<SyncResult<Vec<_>>>()?;

        if changed.is_empty() {
            let restored = self
                .with_store(move |store| {
                    store.mark_synced(synced_at)?;
                    store.restore()
                })
                .await?;
            *self.current.write().await = restored;
            return Ok(Vec::new());
        }

        let verify = self.verify_hashes;
        let tasks = changed.into_iter().map(|(bucket, payload)| {
            self.with_store(move |store| {
                apply_changed_bucket(store, bucket, payload, verify, synced_at).map(|()| bucket)
            })
        });
        let results = join_all(tasks).await;

        *self.current.write().await = self.with_store(|store| store.restore()).await?;

        let mut updated = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(bucket) => updated.push(bucket),
                Err(e) => {
                    tracing::warn!("Failed to apply changed bucket: {}", e);
                    first_error = first_error.or(Some(e));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        updated.sort();
        Ok(updated)
    }

    /// Startup sequence: restore the local bundle, refresh it by delta, fall
    /// back to a full sync when the delta fails. With a local bundle in hand
    /// a failing full sync is not fatal: the stale bundle stays in use.
    pub async fn launch_sync(&self) -> SyncResult<LaunchOutcome> {
        let has_local = match self.restore_local().await {
            Ok(restored) => restored.is_some(),
            Err(e) => {
                tracing::warn!("Discarding unreadable local bundle: {}", e);
                self.with_store(|store| store.clear()).await?;
                *self.current.write().await = None;
                false
            }
        };

        if !has_local {
            self.full_sync().await?;
            return Ok(LaunchOutcome::FullSync);
        }

        let delta_error = match self.delta_sync().await {
            Ok(buckets) => return Ok(LaunchOutcome::Delta(buckets)),
            Err(SyncError::AlreadySyncing) => return Err(SyncError::AlreadySyncing),
            Err(e) => e,
        };
        tracing::warn!("Delta sync failed, falling back to full sync: {}", delta_error);

        match self.full_sync().await {
            Ok(_) => Ok(LaunchOutcome::FullSyncAfterDeltaFailure),
            Err(SyncError::AlreadySyncing) => Err(SyncError::AlreadySyncing),
            Err(e) => {
                tracing::warn!("Full sync failed, continuing with local bundle: {}", e);
                Ok(LaunchOutcome::Offline(e))
            }
        }
    }

    /// Run a store operation on the blocking pool. Every redb call made by
    /// the service goes through here.
    async fn with_store<T, F>(&self, op: F) -> SyncResult<T>
    where
        F: FnOnce(&LocalSyncStore) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| SyncError::Storage(format!("store task failed: {e}")))?
    }

    fn finish<T>(guard: SyncGuard<'_>, what: &str, result: &SyncResult<T>) {
        match result {
            Ok(_) => tracing::info!("{} completed", what),
            Err(e) => tracing::warn!("{} failed: {}", what, e),
        }
        guard.finish(result);
    }
}

/// Decode, optionally verify, then persist one bucket from a delta response.
/// The stored bytes are the payload as received.
fn apply_changed_bucket(
    store: &LocalSyncStore,
    bucket: Bucket,
    payload: BucketPayload,
    verify: bool,
    synced_at: DateTime<Utc>,
) -> SyncResult<()> {
    let BucketPayload { data, hash } = payload;
    if verify {
        verify_hash(bucket, &data, &hash)?;
    }
    check_bucket(bucket, &data)?;
    store.update_bucket(bucket, &data, &hash, synced_at)
}
