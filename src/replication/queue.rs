//! The per-replica work queue and its bookkeeping sets.
//!
//! The queue mirrors `/replicas/<me>/queue/` in memory: entries are appended
//! by the log puller in coordinator order and consumed by workers, which pick
//! the *earliest executable* entry rather than strictly the head.
//!
//! Two shared sets serialize work:
//!
//! - `future_parts`: names claimed by a worker but not yet materialized. A
//!   merge whose input is a future part is not executable yet.
//! - `currently_merging`: input names of every queued or in-flight merge.
//!   The leader's selector refuses to propose merges overlapping these.
//!
//! Membership is tied to entry lifetime through scoped tags ([`FuturePartTag`],
//! [`CurrentlyMergingTag`]): dropping a tag removes its names from the set, so
//! no code path can leak a claim.
//!
//! # Lock order
//!
//! `queue` → `future_parts` → `currently_merging`, never the reverse. All
//! three are short critical sections and are never held across await points.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use super::log_entry::{EntryKind, LogEntry};

/// Scoped claim of a part name in `future_parts`.
///
/// Holds a weak handle to the set so a tag outliving the queue (during
/// shutdown) degrades to a no-op instead of keeping the storage alive.
#[derive(Debug)]
pub struct FuturePartTag {
    set: Weak<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for FuturePartTag {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.lock().unwrap().remove(&self.name);
        }
    }
}

/// Scoped registration of a merge's input names in `currently_merging`.
#[derive(Debug)]
pub struct CurrentlyMergingTag {
    set: Weak<Mutex<HashSet<String>>>,
    names: Vec<String>,
}

impl Drop for CurrentlyMergingTag {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            let mut set = set.lock().unwrap();
            for name in &self.names {
                set.remove(name);
            }
        }
    }
}

/// A queued entry together with the tag keeping its merge inputs registered.
#[derive(Debug)]
struct QueuedEntry {
    entry: LogEntry,
    merging_tag: Option<CurrentlyMergingTag>,
}

/// An entry a worker has claimed: removed from the queue, its target part
/// registered as a future part. The tags travel with the claim; success drops
/// them, failure hands the merging tag back to the queue with the entry.
#[derive(Debug)]
pub struct ClaimedEntry {
    pub entry: LogEntry,
    future_tag: FuturePartTag,
    merging_tag: Option<CurrentlyMergingTag>,
}

impl ClaimedEntry {
    /// Release the future-part claim, keeping the merging registration.
    /// Used on the failure path before the entry is re-queued.
    fn release_future_claim(&mut self) {
        if let Some(set) = self.future_tag.set.upgrade() {
            set.lock().unwrap().remove(&self.future_tag.name);
        }
        self.future_tag.set = Weak::new();
    }
}

/// In-memory ordered work list, mirrored 1-to-1 with the coordinator queue.
#[derive(Debug)]
pub struct ReplicationQueue {
    entries: Mutex<VecDeque<QueuedEntry>>,
    future_parts: Arc<Mutex<HashSet<String>>>,
    currently_merging: Arc<Mutex<HashSet<String>>>,
}

impl Default for ReplicationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationQueue {
    pub fn new() -> Self {
        ReplicationQueue {
            entries: Mutex::new(VecDeque::new()),
            future_parts: Arc::new(Mutex::new(HashSet::new())),
            currently_merging: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn merging_tag_for(&self, entry: &LogEntry) -> Option<CurrentlyMergingTag> {
        if entry.kind != EntryKind::MergeParts {
            return None;
        }
        let mut set = self.currently_merging.lock().unwrap();
        for name in &entry.parts_to_merge {
            set.insert(name.clone());
        }
        Some(CurrentlyMergingTag {
            set: Arc::downgrade(&self.currently_merging),
            names: entry.parts_to_merge.clone(),
        })
    }

    /// Append an entry pulled from a peer log (or reloaded at startup),
    /// registering merge inputs as currently merging.
    pub fn append(&self, entry: LogEntry) {
        let merging_tag = self.merging_tag_for(&entry);
        self.entries
            .lock()
            .unwrap()
            .push_back(QueuedEntry { entry, merging_tag });
    }

    /// Claim the earliest executable entry, if any.
    ///
    /// `GET_PART` entries are always executable. A `MERGE_PARTS` entry is
    /// executable only when none of its inputs is a future part: an input
    /// still being produced by another worker must land first, otherwise the
    /// merge would fall back to a fetch that cannot succeed yet either.
    pub fn claim_next_executable(&self) -> Option<ClaimedEntry> {
        let mut entries = self.entries.lock().unwrap();
        let future_parts = Arc::clone(&self.future_parts);
        let idx = {
            let future = future_parts.lock().unwrap();
            entries.iter().position(|queued| match queued.entry.kind {
                EntryKind::GetPart => true,
                EntryKind::MergeParts => queued
                    .entry
                    .parts_to_merge
                    .iter()
                    .all(|name| !future.contains(name)),
            })?
        };
        let queued = entries.remove(idx).expect("index from position");
        let name = queued.entry.new_part_name.clone();
        future_parts.lock().unwrap().insert(name.clone());
        Some(ClaimedEntry {
            entry: queued.entry,
            future_tag: FuturePartTag {
                set: Arc::downgrade(&self.future_parts),
                name,
            },
            merging_tag: queued.merging_tag,
        })
    }

    /// Return a failed claim to the queue tail. The future-part claim is
    /// released; the merge-input registration moves back into the queue with
    /// the entry.
    pub fn requeue_tail(&self, mut claimed: ClaimedEntry) {
        claimed.release_future_claim();
        let merging_tag = claimed.merging_tag.take();
        self.entries.lock().unwrap().push_back(QueuedEntry {
            entry: claimed.entry,
            merging_tag,
        });
    }

    /// Re-prioritize after a failed fetch of `part_name`: if some queued
    /// merge consumes it, move every entry ahead of that merge whose target
    /// is another input of the same merge to the queue tail.
    ///
    /// Chasing the remaining individual inputs is pointless: once the merge
    /// runs it will fall back to fetching the already-merged part, which
    /// supersedes them all.
    ///
    /// Returns `true` if a consuming merge was found and entries were (or
    /// would have been) moved.
    pub fn defer_inputs_of_merge_containing(&self, part_name: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(merge_idx) = entries.iter().position(|queued| {
            queued.entry.kind == EntryKind::MergeParts
                && queued
                    .entry
                    .parts_to_merge
                    .iter()
                    .any(|name| name == part_name)
        }) else {
            return false;
        };
        let inputs: HashSet<String> = entries[merge_idx]
            .entry
            .parts_to_merge
            .iter()
            .cloned()
            .collect();

        let mut kept = VecDeque::with_capacity(entries.len());
        let mut deferred = Vec::new();
        for (idx, queued) in entries.drain(..).enumerate() {
            if idx < merge_idx && inputs.contains(&queued.entry.new_part_name) {
                deferred.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        kept.extend(deferred);
        *entries = kept;
        true
    }

    /// Number of queued `MERGE_PARTS` entries.
    pub fn merges_queued(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|queued| queued.entry.kind == EntryKind::MergeParts)
            .count()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Snapshot of the queued entries, in order.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|queued| queued.entry.clone())
            .collect()
    }

    /// Snapshot of `currently_merging`.
    pub fn currently_merging_snapshot(&self) -> HashSet<String> {
        self.currently_merging.lock().unwrap().clone()
    }

    /// Whether `name` is registered as currently merging.
    pub fn is_currently_merging(&self, name: &str) -> bool {
        self.currently_merging.lock().unwrap().contains(name)
    }
}
