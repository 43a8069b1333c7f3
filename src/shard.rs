//! Hash partitioning of pending transfers.
//!
//! A transfer's shard is `md5(partition_key) mod shard_count`, so every transfer
//! with the same key lands in the same shard on every run. Rebalancing moves
//! whole records out of shards that drift more than `imbalance_threshold` above
//! the mean into shards below it; it never changes the total count.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ShardConfig;
use crate::core_types::{PendingTransfer, TransferId};

/// Which field decides a transfer's shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKey {
    #[default]
    Source,
    Destination,
    /// Source and destination together.
    Pair,
}

impl PartitionKey {
    pub fn bytes_of(&self, transfer: &PendingTransfer) -> Vec<u8> {
        match self {
            PartitionKey::Source => transfer.source.as_bytes().to_vec(),
            PartitionKey::Destination => transfer.destination.as_bytes().to_vec(),
            PartitionKey::Pair => {
                let mut key = transfer.source.as_bytes().to_vec();
                key.extend_from_slice(transfer.destination.as_bytes());
                key
            }
        }
    }
}

/// Stable shard index for an arbitrary key.
pub fn shard_for_key(key: &[u8], shard_count: usize) -> usize {
    let digest = md5::compute(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    (u64::from_be_bytes(head) % shard_count.max(1) as u64) as usize
}

#[derive(Debug, Default)]
struct Shard {
    members: FxHashMap<TransferId, PendingTransfer>,
}

#[derive(Debug, Default)]
struct ShardTable {
    shards: Vec<Shard>,
    /// transfer id -> current shard (differs from the hashed shard after a rebalance move)
    location: FxHashMap<TransferId, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardStats {
    pub shard_count: usize,
    pub loads: Vec<usize>,
    pub total: usize,
    pub rebalances: u64,
    pub moved_total: u64,
}

pub struct ShardManager {
    config: ShardConfig,
    table: RwLock<ShardTable>,
    last_rebalance: Mutex<Option<Instant>>,
    counters: Mutex<(u64, u64)>,
}

impl ShardManager {
    pub fn new(config: ShardConfig) -> Self {
        let count = config.count.max(1);
        let shards = (0..count).map(|_| Shard::default()).collect();
        Self {
            config: ShardConfig { count, ..config },
            table: RwLock::new(ShardTable {
                shards,
                location: FxHashMap::default(),
            }),
            last_rebalance: Mutex::new(None),
            counters: Mutex::new((0, 0)),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.config.count
    }

    /// Hashed shard for a transfer without storing it.
    pub fn shard_of(&self, transfer: &PendingTransfer) -> usize {
        shard_for_key(
            &self.config.partition_key.bytes_of(transfer),
            self.config.count,
        )
    }

    /// Place a transfer in its hashed shard and return the index.
    ///
    /// Re-assigning an id that is already placed keeps its current shard.
    pub fn assign_to_shard(&self, transfer: &PendingTransfer) -> usize {
        let mut table = self.table.write();
        if let Some(&existing) = table.location.get(&transfer.id) {
            return existing;
        }
        let index = self.shard_of(transfer);
        table.shards[index]
            .members
            .insert(transfer.id, transfer.clone());
        table.location.insert(transfer.id, index);
        index
    }

    /// Snapshot of one shard's members; `None` when the index is out of range.
    pub fn get_transactions(&self, shard_index: usize) -> Option<Vec<PendingTransfer>> {
        let table = self.table.read();
        table
            .shards
            .get(shard_index)
            .map(|s| s.members.values().cloned().collect())
    }

    /// Remove the given ids from one shard; ids living elsewhere are ignored.
    pub fn remove_transactions(&self, shard_index: usize, ids: &[TransferId]) -> usize {
        let mut table = self.table.write();
        let ShardTable { shards, location } = &mut *table;
        let Some(shard) = shards.get_mut(shard_index) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if shard.members.remove(id).is_some() {
                location.remove(id);
                removed += 1;
            }
        }
        removed
    }

    /// Remove ids wherever they currently live.
    pub fn remove_anywhere(&self, ids: &[TransferId]) -> usize {
        let mut table = self.table.write();
        let ShardTable { shards, location } = &mut *table;
        let mut removed = 0;
        for id in ids {
            if let Some(index) = location.remove(id)
                && shards[index].members.remove(id).is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    pub fn current_shard(&self, id: &TransferId) -> Option<usize> {
        self.table.read().location.get(id).copied()
    }

    pub fn total(&self) -> usize {
        self.table.read().location.len()
    }

    /// Rebalance unless one ran within `rebalance_interval`. Returns records moved.
    pub fn rebalance(&self) -> usize {
        {
            let mut last = self.last_rebalance.lock();
            if let Some(at) = *last
                && at.elapsed() < self.config.rebalance_interval()
            {
                return 0;
            }
            *last = Some(Instant::now());
        }
        self.rebalance_now()
    }

    /// Move records from overloaded to underloaded shards until no flagged pair remains.
    pub fn rebalance_now(&self) -> usize {
        let mut table = self.table.write();
        let count = table.shards.len();
        let total = table.location.len();
        if count < 2 || total == 0 {
            return 0;
        }

        let mean = total as f64 / count as f64;
        let threshold = self.config.imbalance_threshold;
        let upper = mean * (1.0 + threshold);
        let lower = mean * (1.0 - threshold);

        let mut moved = 0usize;
        loop {
            let loads: Vec<usize> = table.shards.iter().map(|s| s.members.len()).collect();
            let (hi, &hi_load) = match loads.iter().enumerate().max_by_key(|(_, l)| **l) {
                Some(max) => max,
                None => break,
            };
            let (lo, &lo_load) = match loads.iter().enumerate().min_by_key(|(_, l)| **l) {
                Some(min) => min,
                None => break,
            };
            // Only flagged pairs move, and a move must not push either side past the mean.
            let flagged = hi_load as f64 > upper || (lo_load as f64) < lower;
            if !flagged || hi_load <= lo_load + 1 || (hi_load as f64) <= mean {
                break;
            }

            let ShardTable { shards, location } = &mut *table;
            let Some(id) = shards[hi].members.keys().next().copied() else {
                break;
            };
            if let Some(record) = shards[hi].members.remove(&id) {
                shards[lo].members.insert(id, record);
                location.insert(id, lo);
                moved += 1;
            }
        }

        debug_assert_eq!(table.location.len(), total);
        drop(table);

        let mut counters = self.counters.lock();
        counters.0 += 1;
        counters.1 += moved as u64;
        if moved > 0 {
            info!(moved, mean, "shards rebalanced");
        } else {
            debug!(mean, "shards balanced, nothing to move");
        }
        moved
    }

    pub fn stats(&self) -> ShardStats {
        let (loads, total) = {
            let table = self.table.read();
            let loads: Vec<usize> = table.shards.iter().map(|s| s.members.len()).collect();
            (loads, table.location.len())
        };
        let (rebalances, moved_total) = *self.counters.lock();
        ShardStats {
            shard_count: self.config.count,
            loads,
            total,
            rebalances,
            moved_total,
        }
    }

    /// Periodic rebalance loop. Abort the handle to stop it.
    pub fn spawn_rebalancer(self: &Arc<Self>) -> JoinHandle<()> {
        let shards = Arc::clone(self);
        let interval = self.config.rebalance_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                shards.rebalance();
            }
        })
    }
}
