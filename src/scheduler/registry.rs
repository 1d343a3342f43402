//! Per-instance registry of in-flight execution/watchdog pairs.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Handles of the current pair for one widget instance.
#[derive(Debug)]
pub struct RegistryEntry {
    pub generation: u64,
    pub cancel: CancellationToken,
    pub execution: AbortHandle,
    pub watchdog: AbortHandle,
}

impl RegistryEntry {
    /// Cancel the pair. Tasks that already finished are left alone.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if !self.execution.is_finished() {
            self.execution.abort();
        }
        if !self.watchdog.is_finished() {
            self.watchdog.abort();
        }
    }
}

/// Identity of one scheduled pair, carried by its watchdog so that every
/// write it makes can be checked against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub widget_instance_id: i64,
    pub generation: u64,
}

/// Concurrent map from widget instance id to its current pair.
///
/// Generations increase monotonically, so a stale watchdog can never remove
/// or overwrite the entry of a newer schedule.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<i64, RegistryEntry>,
    generation: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store `entry` unless a newer generation is already registered. The
    /// superseded entry is dropped without being cancelled. A rejected entry
    /// is handed back.
    pub fn insert(&self, id: i64, entry: RegistryEntry) -> Result<(), RegistryEntry> {
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation < entry.generation {
                    occupied.insert(entry);
                    Ok(())
                } else {
                    Err(entry)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// Replace the entry held by `lease` with its successor. Fails when the
    /// lease was cancelled or superseded in the meantime.
    pub fn hand_over(&self, lease: Lease, entry: RegistryEntry) -> Result<(), RegistryEntry> {
        match self.entries.entry(lease.widget_instance_id) {
            Entry::Occupied(mut occupied) if is_live(occupied.get(), lease) => {
                occupied.insert(entry);
                Ok(())
            }
            _ => Err(entry),
        }
    }

    /// Run `f` only while `lease` is the live entry for its instance.
    ///
    /// The shard guard is held for the duration of `f`, so `remove` and
    /// `cancel_all` wait for it to finish and anything they persist lands
    /// after it. `f` must not touch the registry.
    pub fn while_current<T>(&self, lease: Lease, f: impl FnOnce() -> T) -> Option<T> {
        let guard = self.entries.get(&lease.widget_instance_id)?;
        if !is_live(&guard, lease) {
            return None;
        }
        let out = f();
        drop(guard);
        Some(out)
    }

    pub fn remove(&self, id: i64) -> Option<RegistryEntry> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Remove the entry for `id` only if it still belongs to `generation`.
    pub fn remove_if_current(&self, id: i64, generation: u64) -> bool {
        self.entries
            .remove_if(&id, |_, entry| entry.generation == generation)
            .is_some()
    }

    /// Cancel and drop every entry. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        self.entries.retain(|_, entry| {
            entry.cancel();
            cancelled += 1;
            false
        });
        cancelled
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn generation_of(&self, id: i64) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.generation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_live(entry: &RegistryEntry, lease: Lease) -> bool {
    entry.generation == lease.generation && !entry.cancel.is_cancelled()
}
