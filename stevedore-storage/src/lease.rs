//! Table name lease cache.
//!
//! Hands out small integer suffixes per (connection, shape) so temporary
//! table names such as `orders_1`, `orders_2` are reused once released.
//! The whole cache is guarded by one mutex; a connection's entry lives as
//! long as it has outstanding leases.

use crate::traits::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use stevedore_core::{StevedoreError, StevedoreResult, TableName};
use tracing::debug;

/// Identifies the family of tables sharing a naming sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeKey(pub TableName);

impl From<TableName> for ShapeKey {
    fn from(table: TableName) -> Self {
        Self(table)
    }
}

impl From<&TableName> for ShapeKey {
    fn from(table: &TableName) -> Self {
        Self(table.clone())
    }
}

impl fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct ConnectionEntry {
    consumers: usize,
    leased: HashMap<ShapeKey, BTreeSet<u32>>,
}

/// Process-wide suffix cache. Share it as `Arc<NameLeaseCache>`.
#[derive(Debug, Default)]
pub struct NameLeaseCache {
    entries: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl NameLeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leasing handle for one consumer of `connection`.
    pub fn leasing(self: &Arc<Self>, connection: ConnectionId) -> NameLeasing {
        NameLeasing {
            cache: Arc::clone(self),
            connection,
            disposed: AtomicBool::new(false),
        }
    }

    /// Suffixes currently leased for `(connection, shape)`, ascending.
    pub fn leased_suffixes(&self, connection: ConnectionId, shape: &ShapeKey) -> Vec<u32> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&connection)
            .and_then(|entry| entry.leased.get(shape))
            .map(|suffixes| suffixes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections with outstanding leases.
    pub fn connection_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Outstanding leases of `connection`.
    pub fn consumer_count(&self, connection: ConnectionId) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&connection)
            .map_or(0, |entry| entry.consumers)
    }

    fn acquire(&self, connection: ConnectionId, shape: &ShapeKey) -> StevedoreResult<u32> {
        let mut entries = self.entries.lock().map_err(|_| StevedoreError::LockPoisoned {
            resource: "name lease cache".to_string(),
        })?;
        let entry = entries.entry(connection).or_default();
        entry.consumers += 1;

        let leased = entry.leased.entry(shape.clone()).or_default();
        // Smallest positive integer not currently leased.
        let mut suffix = 1;
        for &taken in leased.iter() {
            if taken != suffix {
                break;
            }
            suffix += 1;
        }
        leased.insert(suffix);
        Ok(suffix)
    }

    fn give_back(&self, connection: ConnectionId, shape: &ShapeKey, suffix: u32) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(&connection) else {
            return;
        };
        if let Some(leased) = entry.leased.get_mut(shape) {
            leased.remove(&suffix);
            if leased.is_empty() {
                entry.leased.remove(shape);
            }
        }
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers == 0 {
            entries.remove(&connection);
        }
    }
}

/// Per-consumer leasing handle bound to one connection.
pub struct NameLeasing {
    cache: Arc<NameLeaseCache>,
    connection: ConnectionId,
    disposed: AtomicBool,
}

impl NameLeasing {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn lease(&self, shape: impl Into<ShapeKey>) -> StevedoreResult<SuffixLease> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StevedoreError::disposed("NameLeasing"));
        }
        let shape = shape.into();
        let suffix = self.cache.acquire(self.connection, &shape)?;
        debug!(connection = %self.connection, shape = %shape, suffix, "Leased table name suffix");

        Ok(SuffixLease {
            cache: Arc::clone(&self.cache),
            connection: self.connection,
            shape,
            suffix,
            released: false,
        })
    }

    /// Outstanding leases stay valid; new leases are refused.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A leased suffix. Returned to the cache on `release` or drop, exactly once.
pub struct SuffixLease {
    cache: Arc<NameLeaseCache>,
    connection: ConnectionId,
    shape: ShapeKey,
    suffix: u32,
    released: bool,
}

impl SuffixLease {
    pub fn suffix(&self) -> u32 {
        self.suffix
    }

    pub fn shape(&self) -> &ShapeKey {
        &self.shape
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cache.give_back(self.connection, &self.shape, self.suffix);
        debug!(connection = %self.connection, shape = %self.shape, suffix = self.suffix, "Returned table name suffix");
    }
}

impl Drop for SuffixLease {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for SuffixLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuffixLease")
            .field("connection", &self.connection)
            .field("shape", &self.shape)
            .field("suffix", &self.suffix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn orders() -> ShapeKey {
        ShapeKey(TableName::new("orders"))
    }

    #[test]
    fn test_lease_sequence_reuses_smallest_free_suffix() {
        let cache = Arc::new(NameLeaseCache::new());
        let leasing = cache.leasing(ConnectionId::new());

        let first = leasing.lease(orders()).unwrap();
        let second = leasing.lease(orders()).unwrap();
        assert_eq!((first.suffix(), second.suffix()), (1, 2));

        first.release();
        let third = leasing.lease(orders()).unwrap();
        assert_eq!(third.suffix(), 1);
        let fourth = leasing.lease(orders()).unwrap();
        assert_eq!(fourth.suffix(), 3);
    }

    #[test]
    fn test_teardown_restarts_numbering() {
        let cache = Arc::new(NameLeaseCache::new());
        let connection = ConnectionId::new();
        let leasing = cache.leasing(connection);

        let a = leasing.lease(orders()).unwrap();
        let b = leasing.lease(orders()).unwrap();
        assert_eq!(cache.consumer_count(connection), 2);
        drop(a);
        drop(b);
        assert_eq!(cache.connection_count(), 0);

        let again = leasing.lease(orders()).unwrap();
        assert_eq!(again.suffix(), 1);
        assert_eq!(cache.connection_count(), 1);
    }

    #[test]
    fn test_suffixes_are_scoped_per_connection_and_shape() {
        let cache = Arc::new(NameLeaseCache::new());
        let one = cache.leasing(ConnectionId::new());
        let two = cache.leasing(ConnectionId::new());

        let a = one.lease(orders()).unwrap();
        let b = two.lease(orders()).unwrap();
        let c = one.lease(TableName::new("customers")).unwrap();
        assert_eq!((a.suffix(), b.suffix(), c.suffix()), (1, 1, 1));
        assert_eq!(cache.connection_count(), 2);
        assert_eq!(cache.leased_suffixes(one.connection_id(), &orders()), vec![1]);
    }

    #[test]
    fn test_disposed_leasing_refuses_new_leases() {
        let cache = Arc::new(NameLeaseCache::new());
        let leasing = cache.leasing(ConnectionId::new());
        let held = leasing.lease(orders()).unwrap();
        leasing.dispose();

        assert!(leasing.lease(orders()).unwrap_err().is_disposed());
        // outstanding lease is unaffected
        assert_eq!(held.suffix(), 1);
        held.release();
        assert_eq!(cache.connection_count(), 0);
    }

    #[test]
    fn test_concurrent_leases_never_collide() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 16;

        let cache = Arc::new(NameLeaseCache::new());
        let connection = ConnectionId::new();
        let leasing = cache.leasing(connection);

        let mut held: Vec<SuffixLease> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        let mut mine = Vec::new();
                        for round in 0..PER_THREAD * 2 {
                            let lease = leasing.lease(orders()).unwrap();
                            // churn: every other lease goes straight back
                            if round % 2 == 0 {
                                lease.release();
                            } else {
                                mine.push(lease);
                            }
                        }
                        mine
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let mut suffixes: Vec<u32> = held.iter().map(|l| l.suffix()).collect();
        suffixes.sort_unstable();
        let expected: Vec<u32> = (1..=(THREADS * PER_THREAD) as u32).collect();
        assert_eq!(suffixes, expected);
        assert_eq!(cache.leased_suffixes(connection, &orders()), expected);
        assert_eq!(cache.consumer_count(connection), THREADS * PER_THREAD);

        held.clear();
        assert_eq!(cache.connection_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_leased_suffixes_are_distinct_and_dense(ops in prop::collection::vec(any::<bool>(), 1..64)) {
            let cache = Arc::new(NameLeaseCache::new());
            let connection = ConnectionId::new();
            let leasing = cache.leasing(connection);
            let mut held: Vec<SuffixLease> = Vec::new();

            for lease in ops {
                if lease || held.is_empty() {
                    held.push(leasing.lease(orders()).unwrap());
                } else {
                    let released = held.remove(held.len() / 2);
                    released.release();
                }

                let leased = cache.leased_suffixes(connection, &orders());
                prop_assert_eq!(leased.len(), held.len());
                prop_assert_eq!(cache.consumer_count(connection), held.len());
                // a fresh lease always picks the smallest gap
                let expected_next = (1u32..).find(|s| !leased.contains(s)).unwrap();
                if let Some(last) = held.last() {
                    prop_assert!(leased.contains(&last.suffix()));
                }
                prop_assert!(expected_next as usize <= held.len() + 1);
            }

            drop(held);
            prop_assert_eq!(cache.connection_count(), 0);
        }
    }
}
