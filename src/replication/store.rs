//! The seams to the data plane: local part storage and inter-replica bulk
//! transfer.
//!
//! The control plane never touches bytes on disk. It drives a [`PartStore`]
//! (owned by the surrounding engine) and a [`PartFetcher`] (the bulk-transfer
//! client), both behind async traits so tests can run whole clusters against
//! the in-memory implementations.

use async_trait::async_trait;
use bytes::Bytes;

use super::error::ReplicationResult;
use super::part::PartInfo;

#[cfg(any(test, feature = "test-utilities"))]
use std::collections::HashMap;
#[cfg(any(test, feature = "test-utilities"))]
use std::sync::Arc;

#[cfg(any(test, feature = "test-utilities"))]
use super::error::ReplicationError;

/// A part that exists locally but has not yet been committed under its final
/// name: the product of a merge or a fetch, parked in a temp location until
/// the store renames it into place.
#[derive(Debug, Clone)]
pub struct TempPart {
    pub info: PartInfo,
    /// Serialized checksums; published to the coordinator so peers can verify
    /// the parts they fetch.
    pub checksums: Bytes,
}

/// Local part storage, as seen by the control plane.
#[async_trait]
pub trait PartStore: Send + Sync {
    /// All committed local parts.
    async fn get_data_parts(&self) -> ReplicationResult<Vec<PartInfo>>;

    /// Any committed local part whose range contains `name`'s range, or
    /// `None`. May return the part itself or a strictly larger one.
    async fn get_containing_part(&self, name: &str) -> ReplicationResult<Option<PartInfo>>;

    /// Merge `parts` (all committed locally) into a new part named
    /// `new_part_name`, committing it and leaving the inputs in place as
    /// obsolete. Merging is deterministic: the same input set yields the same
    /// checksums on every replica.
    async fn merge_parts(
        &self,
        parts: &[PartInfo],
        new_part_name: &str,
    ) -> ReplicationResult<TempPart>;

    /// Commit a fetched temp part under its final name. Returns the local
    /// parts its range renders obsolete (removed from the committed set).
    async fn rename_temp_part_and_replace(
        &self,
        part: TempPart,
    ) -> ReplicationResult<Vec<PartInfo>>;

    /// Drop committed parts that are contained in a larger committed part.
    async fn clear_old_parts(&self) -> ReplicationResult<()>;

    /// Move a committed part aside under `<prefix><name>`, removing it from
    /// the committed set without deleting data.
    async fn rename_and_detach_part(&self, name: &str, prefix: &str) -> ReplicationResult<()>;

    /// Checksums of a committed part, for publication to the coordinator.
    async fn checksums_of(&self, name: &str) -> ReplicationResult<Bytes>;
}

/// Inter-replica bulk transfer: download a named part from a peer's part
/// service into a local temp part.
#[async_trait]
pub trait PartFetcher: Send + Sync {
    async fn fetch_part(
        &self,
        part_name: &str,
        peer_replica_path: &str,
        host: &str,
        port: u16,
    ) -> ReplicationResult<TempPart>;
}

// =============================================================================
// In-memory implementations (test-utilities)
// =============================================================================

/// In-memory part store for tests.
///
/// Parts are name-keyed `PartInfo`s plus a checksums blob; merge checksums are
/// derived deterministically from the target name and the input checksums so
/// independently merging replicas agree byte-for-byte.
#[cfg(any(test, feature = "test-utilities"))]
#[derive(Debug, Default)]
pub struct InMemoryPartStore {
    inner: std::sync::Mutex<InMemoryPartStoreState>,
}

#[cfg(any(test, feature = "test-utilities"))]
#[derive(Debug, Default)]
struct InMemoryPartStoreState {
    committed: HashMap<String, (PartInfo, Bytes)>,
    detached: HashMap<String, (PartInfo, Bytes)>,
}

#[cfg(any(test, feature = "test-utilities"))]
impl InMemoryPartStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a committed part, as if a writer had inserted it.
    pub fn seed_part(&self, name: &str) {
        let info = PartInfo::parse(name).expect("well-formed part name");
        let checksums = Self::insert_checksums(name);
        self.inner
            .lock()
            .unwrap()
            .committed
            .insert(name.to_string(), (info, checksums));
    }

    /// Names of all committed parts, sorted.
    pub fn part_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().committed.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of detached parts (with their prefixes), sorted.
    pub fn detached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().detached.keys().cloned().collect();
        names.sort();
        names
    }

    /// Checksums for a freshly inserted part. Deterministic in the name so
    /// every replica that materializes the part agrees.
    pub fn insert_checksums(name: &str) -> Bytes {
        Bytes::from(format!("insert:{name}"))
    }

    /// Checksums for a merged part: deterministic in the target name and the
    /// ordered input checksums.
    pub fn merge_checksums(new_part_name: &str, inputs: &[Bytes]) -> Bytes {
        let mut text = format!("merge:{new_part_name}");
        for input in inputs {
            text.push(':');
            text.push_str(&String::from_utf8_lossy(input));
        }
        Bytes::from(text)
    }

    fn clone_part(&self, name: &str) -> Option<(PartInfo, Bytes)> {
        self.inner.lock().unwrap().committed.get(name).cloned()
    }
}

#[cfg(any(test, feature = "test-utilities"))]
#[async_trait]
impl PartStore for InMemoryPartStore {
    async fn get_data_parts(&self) -> ReplicationResult<Vec<PartInfo>> {
        let state = self.inner.lock().unwrap();
        Ok(state.committed.values().map(|(info, _)| info.clone()).collect())
    }

    async fn get_containing_part(&self, name: &str) -> ReplicationResult<Option<PartInfo>> {
        let target = PartInfo::parse(name).ok_or_else(|| {
            ReplicationError::Store(format!("malformed part name {name:?}"))
        })?;
        let state = self.inner.lock().unwrap();
        Ok(state
            .committed
            .values()
            .map(|(info, _)| info)
            .find(|info| info.contains(&target))
            .cloned())
    }

    async fn merge_parts(
        &self,
        parts: &[PartInfo],
        new_part_name: &str,
    ) -> ReplicationResult<TempPart> {
        let info = PartInfo::parse(new_part_name).ok_or_else(|| {
            ReplicationError::Store(format!("malformed part name {new_part_name:?}"))
        })?;
        let mut input_checksums = Vec::with_capacity(parts.len());
        {
            let state = self.inner.lock().unwrap();
            for part in parts {
                let (_, checksums) = state.committed.get(&part.name()).ok_or_else(|| {
                    ReplicationError::Store(format!("merge input {} not committed", part.name()))
                })?;
                input_checksums.push(checksums.clone());
            }
        }
        let checksums = Self::merge_checksums(new_part_name, &input_checksums);
        let size = parts.iter().map(|p| p.size).sum();
        let temp = TempPart {
            info: PartInfo { size, ..info },
            checksums,
        };
        // Commit directly; a real store writes a tmp_ directory first.
        self.inner.lock().unwrap().committed.insert(
            new_part_name.to_string(),
            (temp.info.clone(), temp.checksums.clone()),
        );
        Ok(temp)
    }

    async fn rename_temp_part_and_replace(
        &self,
        part: TempPart,
    ) -> ReplicationResult<Vec<PartInfo>> {
        let mut state = self.inner.lock().unwrap();
        let obsolete: Vec<PartInfo> = state
            .committed
            .values()
            .map(|(info, _)| info.clone())
            .filter(|info| part.info.contains(info) && info.name() != part.info.name())
            .collect();
        for info in &obsolete {
            state.committed.remove(&info.name());
        }
        state
            .committed
            .insert(part.info.name(), (part.info.clone(), part.checksums));
        Ok(obsolete)
    }

    async fn clear_old_parts(&self) -> ReplicationResult<()> {
        let mut state = self.inner.lock().unwrap();
        let infos: Vec<PartInfo> = state.committed.values().map(|(i, _)| i.clone()).collect();
        state.committed.retain(|_, (info, _)| {
            !infos
                .iter()
                .any(|other| other.name() != info.name() && other.contains(info))
        });
        Ok(())
    }

    async fn rename_and_detach_part(&self, name: &str, prefix: &str) -> ReplicationResult<()> {
        let mut state = self.inner.lock().unwrap();
        let (info, checksums) = state
            .committed
            .remove(name)
            .ok_or_else(|| ReplicationError::Store(format!("no committed part {name:?}")))?;
        state
            .detached
            .insert(format!("{prefix}{name}"), (info, checksums));
        Ok(())
    }

    async fn checksums_of(&self, name: &str) -> ReplicationResult<Bytes> {
        self.clone_part(name)
            .map(|(_, checksums)| checksums)
            .ok_or_else(|| ReplicationError::Store(format!("no committed part {name:?}")))
    }
}

/// In-memory fetcher: resolves `host:port` to a peer's [`InMemoryPartStore`]
/// and copies the part out of it.
#[cfg(any(test, feature = "test-utilities"))]
#[derive(Debug, Default)]
pub struct InMemoryPartFetcher {
    peers: std::sync::Mutex<HashMap<String, Arc<InMemoryPartStore>>>,
    /// When set, every fetch fails: simulates all peers being unreachable.
    partitioned: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "test-utilities"))]
impl InMemoryPartFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `store` reachable at `host:port`.
    pub fn register_peer(&self, host: &str, port: u16, store: Arc<InMemoryPartStore>) {
        self.peers
            .lock()
            .unwrap()
            .insert(format!("{host}:{port}"), store);
    }

    /// Simulate (or heal) a network partition from every peer.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned
            .store(partitioned, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-utilities"))]
#[async_trait]
impl PartFetcher for InMemoryPartFetcher {
    async fn fetch_part(
        &self,
        part_name: &str,
        peer_replica_path: &str,
        host: &str,
        port: u16,
    ) -> ReplicationResult<TempPart> {
        let fetch_failed = |detail: &str| ReplicationError::FetchFailed {
            part_name: part_name.to_string(),
            replica: peer_replica_path.to_string(),
            detail: detail.to_string(),
        };
        if self.partitioned.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(fetch_failed("connection refused"));
        }
        let store = self
            .peers
            .lock()
            .unwrap()
            .get(&format!("{host}:{port}"))
            .cloned()
            .ok_or_else(|| fetch_failed("unknown peer endpoint"))?;
        let (info, checksums) = store
            .clone_part(part_name)
            .ok_or_else(|| fetch_failed("peer does not hold the part"))?;
        Ok(TempPart { info, checksums })
    }
}
