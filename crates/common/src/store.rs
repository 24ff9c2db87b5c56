//! Thread-safe secret store with delayed-deletion TTLs.
//!
//! Deletions observed at the source do not remove entries right away. The
//! entry is scheduled to purge after a grace period, so a briefly confused
//! backend does not make files vanish in front of running consumers. Expired
//! entries are dropped lazily by whichever access sees them first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::secret::Secret;

/// A stored secret plus cache bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub secret: Secret,
    /// When this entry was last written by a successful put.
    pub inserted_at: SystemTime,
    /// Absolute purge instant. `None` means the entry is not scheduled for
    /// deletion. Once set, it is never moved earlier; a put clears it.
    pub ttl_deadline: Option<SystemTime>,
    /// Records a deletion observed at the source. `secret` carries only
    /// metadata and the entry never appears in listings.
    pub tombstone: bool,
}

impl CacheEntry {
    fn expired(&self, now: SystemTime) -> bool {
        self.ttl_deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Concurrency-safe `name -> CacheEntry` map. All writes come from the cache
/// coordinator; the lock is never held across I/O.
pub struct SecretStore {
    inner: Mutex<HashMap<String, CacheEntry>>,
    deletion_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl SecretStore {
    pub fn new(deletion_delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            deletion_delay,
            clock,
        }
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up an entry, purging it if its deadline has passed. Tombstones
    /// are returned as-is; callers decide what a known-deleted name means for
    /// them.
    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut map = self.guard();
        match map.get(name) {
            Some(entry) if entry.expired(now) => {
                map.remove(name);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Inserts or replaces an entry. Clears any scheduled deletion and the
    /// tombstone flag. `inserted_at` defaults to the current clock reading.
    pub fn put(&self, name: &str, secret: Secret, inserted_at: Option<SystemTime>) {
        let inserted_at = inserted_at.unwrap_or_else(|| self.clock.now());
        let entry = CacheEntry {
            secret,
            inserted_at,
            ttl_deadline: None,
            tombstone: false,
        };
        self.guard().insert(name.to_string(), entry);
    }

    /// Schedules `name` to purge after the deletion delay. An entry already
    /// scheduled keeps its earlier deadline. An absent name materializes as a
    /// tombstone so the deletion itself is remembered.
    pub fn delete(&self, name: &str) {
        let now = self.clock.now();
        let deadline = now + self.deletion_delay;
        let mut map = self.guard();
        match map.get_mut(name) {
            Some(entry) => {
                if entry.ttl_deadline.is_none() {
                    entry.ttl_deadline = Some(deadline);
                }
            }
            None => {
                let secret = Secret::metadata_only(name, DateTime::<Utc>::from(now));
                map.insert(
                    name.to_string(),
                    CacheEntry {
                        secret,
                        inserted_at: now,
                        ttl_deadline: Some(deadline),
                        tombstone: true,
                    },
                );
            }
        }
    }

    /// Schedules every unscheduled entry for deletion after the delay.
    pub fn delete_all(&self) {
        let deadline = self.clock.now() + self.deletion_delay;
        for entry in self.guard().values_mut() {
            if entry.ttl_deadline.is_none() {
                entry.ttl_deadline = Some(deadline);
            }
        }
    }

    /// Converges this store toward `other`, which holds a freshly merged
    /// listing. Entries missing from `other` are scheduled for delayed
    /// deletion if they hold content, or dropped outright if they do not.
    /// Entries present in `other` overlay whatever is here.
    pub fn replace(&self, other: &SecretStore) {
        if std::ptr::eq(self, other) {
            return;
        }
        let deadline = self.clock.now() + self.deletion_delay;
        let (mut mine, theirs) = self.lock_pair(other);
        mine.retain(|name, entry| {
            if theirs.contains_key(name) {
                return true;
            }
            if entry.tombstone || entry.secret.content.is_empty() {
                return false;
            }
            if entry.ttl_deadline.is_none() {
                entry.ttl_deadline = Some(deadline);
            }
            true
        });
        for (name, entry) in theirs.iter() {
            mine.insert(name.clone(), entry.clone());
        }
    }

    /// Adopts `other`'s entries wholesale, discarding everything here.
    pub fn overwrite(&self, other: &SecretStore) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (mut mine, theirs) = self.lock_pair(other);
        *mine = theirs.clone();
    }

    /// Live secrets in no particular order. Expired entries encountered along
    /// the way are purged; tombstones are skipped.
    pub fn values(&self) -> Vec<Secret> {
        let now = self.clock.now();
        let mut map = self.guard();
        map.retain(|_, entry| !entry.expired(now));
        map.values()
            .filter(|entry| !entry.tombstone)
            .map(|entry| entry.secret.clone())
            .collect()
    }

    /// Count of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.guard();
        map.retain(|_, entry| !entry.expired(now));
        map.values().filter(|entry| !entry.tombstone).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry immediately, pending deletions included.
    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Locks both stores, ordered by allocation address so two concurrent
    /// cross-store operations cannot deadlock. Guards come back in
    /// (self, other) order.
    fn lock_pair<'a>(
        &'a self,
        other: &'a SecretStore,
    ) -> (
        MutexGuard<'a, HashMap<String, CacheEntry>>,
        MutexGuard<'a, HashMap<String, CacheEntry>>,
    ) {
        let (first, second) = if (self as *const SecretStore as usize)
            <= (other as *const SecretStore as usize)
        {
            (self, other)
        } else {
            (other, self)
        };
        let first_guard = first.guard();
        let second_guard = second.guard();
        if std::ptr::eq(first, self) {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        }
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("len", &self.guard().len())
            .field("deletion_delay", &self.deletion_delay)
            .finish()
    }
}
