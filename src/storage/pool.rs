//! Database Pool
//!
//! Arbitrates access to index shards by endpoint-set. One slot exists per
//! endpoint-set; readable checkouts share the slot, and a writable checkout
//! first wins the endpoint-set's write-intent lock, so at most one writable
//! handle exists globally at any time. Idle slots are evicted LRU once the
//! cached population exceeds the quota.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::index::IndexShard;
use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};

pub const DB_WRITABLE: u32 = 1;
/// Create the index if it doesn't exist yet.
pub const DB_SPAWN: u32 = 2;
/// Announce the index to the cluster so peers can resolve it.
pub const DB_INIT_REF: u32 = 4;

/// Reopen-and-retry budget for reads that hit storage divergence.
pub const REOPEN_RETRIES: usize = 3;

const DEFAULT_QUOTA: usize = 16;
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct DatabaseSlot {
    pub endpoints: EndpointSet,
    shard: RwLock<IndexShard>,
    ref_count: AtomicUsize,
    last_used: std::sync::Mutex<Instant>,
}

#[derive(Debug)]
pub struct DatabasePool {
    data_dir: PathBuf,
    slots: DashMap<String, Arc<DatabaseSlot>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    quota: usize,
    checkout_timeout: Duration,
    /// Index paths spawned with `DB_INIT_REF`; the manager forwards these
    /// to discovery as index announcements.
    announcements: UnboundedSender<String>,
}

impl DatabasePool {
    pub fn new(
        data_dir: PathBuf,
        announcements: UnboundedSender<String>,
    ) -> Arc<Self> {
        Self::with_limits(
            data_dir,
            announcements,
            DEFAULT_QUOTA,
            DEFAULT_CHECKOUT_TIMEOUT,
        )
    }

    pub fn with_limits(
        data_dir: PathBuf,
        announcements: UnboundedSender<String>,
        quota: usize,
        checkout_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_dir,
            slots: DashMap::new(),
            write_locks: DashMap::new(),
            quota,
            checkout_timeout,
            announcements,
        })
    }

    /// Check out a database for the endpoint-set. A `DB_WRITABLE` checkout
    /// blocks on the write-intent lock up to the pool timeout; the returned
    /// handle checks itself back in on drop.
    pub async fn checkout(
        self: &Arc<Self>,
        endpoints: &EndpointSet,
        flags: u32,
    ) -> Result<DatabaseHandle> {
        let writable = flags & DB_WRITABLE != 0;
        let key = endpoints.key();

        let write_guard = if writable {
            let lock = self
                .write_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            match tokio::time::timeout(self.checkout_timeout, lock.lock_owned()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    return Err(Error::DatabaseCheckout(format!(
                        "timed out waiting for the writer of {}",
                        key
                    )));
                }
            }
        } else {
            None
        };

        let slot = match self.slots.get(&key) {
            Some(entry) => entry.value().clone(),
            None => self.open_slot(endpoints, &key, flags)?,
        };

        if writable {
            slot.shard.write().await.ensure_writable()?;
        }

        slot.ref_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Checked out {} ({})",
            key,
            if writable { "writable" } else { "readable" }
        );

        Ok(DatabaseHandle {
            slot,
            pool: self.clone(),
            writable,
            _write_guard: write_guard,
        })
    }

    fn open_slot(
        self: &Arc<Self>,
        endpoints: &EndpointSet,
        key: &str,
        flags: u32,
    ) -> Result<Arc<DatabaseSlot>> {
        let path = endpoints
            .first()
            .ok_or_else(|| Error::ParseError("empty endpoint set".to_string()))?
            .path
            .clone();
        let shard = IndexShard::open(
            &self.data_dir,
            &path,
            flags & DB_WRITABLE != 0,
            flags & DB_SPAWN != 0,
        )?;

        let slot = Arc::new(DatabaseSlot {
            endpoints: endpoints.clone(),
            shard: RwLock::new(shard),
            ref_count: AtomicUsize::new(0),
            last_used: std::sync::Mutex::new(Instant::now()),
        });
        self.slots.insert(key.to_string(), slot.clone());

        if flags & DB_INIT_REF != 0 {
            let _ = self.announcements.send(path);
        }

        Ok(slot)
    }

    fn checkin(&self, slot: &Arc<DatabaseSlot>) {
        slot.ref_count.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut last_used) = slot.last_used.lock() {
            *last_used = Instant::now();
        }
        self.evict_idle();
    }

    /// Drop idle cached slots, oldest first, until the cached population is
    /// back under quota.
    fn evict_idle(&self) {
        loop {
            let idle: Vec<(String, Instant)> = self
                .slots
                .iter()
                .filter(|entry| entry.value().ref_count.load(Ordering::SeqCst) == 0)
                .map(|entry| {
                    let at = entry
                        .value()
                        .last_used
                        .lock()
                        .map(|t| *t)
                        .unwrap_or_else(|_| Instant::now());
                    (entry.key().clone(), at)
                })
                .collect();

            if idle.len() <= self.quota {
                return;
            }

            let Some((key, _)) = idle.into_iter().min_by_key(|(_, at)| *at) else {
                return;
            };
            // Re-check under the map entry; a checkout may have won the race.
            let removed = self
                .slots
                .remove_if(&key, |_, slot| slot.ref_count.load(Ordering::SeqCst) == 0);
            if removed.is_some() {
                tracing::debug!("Evicted idle database {}", key);
            } else {
                return;
            }
        }
    }

    /// Roll back uncommitted batches in every slot. Called by the manager
    /// on forced shutdown while writable handles may still be live.
    pub async fn rollback_all(&self) {
        for entry in self.slots.iter() {
            let mut shard = entry.value().shard.write().await;
            if shard.has_pending() {
                if let Err(e) = shard.rollback() {
                    tracing::error!("Rollback of {} failed: {}", entry.key(), e);
                }
            }
        }
    }

    pub fn cached_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().ref_count.load(Ordering::SeqCst) == 0)
            .count()
    }

    pub fn checked_out_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().ref_count.load(Ordering::SeqCst) > 0)
            .count()
    }
}

/// A checked-out database. Readable handles share the slot; a writable
/// handle additionally holds the endpoint-set's write-intent lock, which is
/// released when the handle drops.
#[derive(Debug)]
pub struct DatabaseHandle {
    slot: Arc<DatabaseSlot>,
    pool: Arc<DatabasePool>,
    writable: bool,
    _write_guard: Option<OwnedMutexGuard<()>>,
}

impl DatabaseHandle {
    pub async fn read(&self) -> RwLockReadGuard<'_, IndexShard> {
        self.slot.shard.read().await
    }

    pub async fn write(&self) -> Result<RwLockWriteGuard<'_, IndexShard>> {
        if !self.writable {
            return Err(Error::DatabaseCheckout(
                "handle was not checked out writable".to_string(),
            ));
        }
        Ok(self.slot.shard.write().await)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.slot.endpoints
    }

    /// Reload the shard from disk after detected divergence.
    pub async fn reopen(&self) -> Result<()> {
        self.slot.shard.write().await.reopen()
    }

    /// Fetch documents by id under the reopen budget: a stale shard is
    /// reloaded and the fetch retried up to `REOPEN_RETRIES` times before
    /// the operation fails. Missing ids are skipped, not errors.
    pub async fn fetch_documents<'a>(
        &self,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<Vec<crate::storage::index::Document>> {
        let mut documents = Vec::new();
        for id in ids {
            let mut attempts = 0;
            loop {
                {
                    let shard = self.slot.shard.read().await;
                    if !shard.is_stale() {
                        if let Some(doc) = shard.get_document(id) {
                            documents.push(doc.clone());
                        }
                        break;
                    }
                }
                attempts += 1;
                if attempts > REOPEN_RETRIES {
                    return Err(Error::StorageError(format!(
                        "index diverged while fetching {}",
                        id
                    )));
                }
                self.reopen().await?;
            }
        }
        Ok(documents)
    }
}

impl Drop for DatabaseHandle {
    fn drop(&mut self) {
        self.pool.checkin(&self.slot);
    }
}
