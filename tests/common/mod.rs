//! Shared test infrastructure: an in-process cluster of replicas over one
//! coordinator ensemble.

use std::sync::Arc;

use replitree::replication::{
    ColumnDef, Coordinator, CreateMode, InMemoryEnsemble, InMemoryPartFetcher, InMemoryPartStore,
    MergePolicy, PartFetcher, PartInfo, PartStore, ReplicaConfig, ReplicatedTable,
    ReplicationResult, SimpleMergePolicy, TableMetadata,
};

pub const TABLE_PATH: &str = "/tables/hits";
pub const PEER_PORT: u16 = 9009;

/// A cluster of replicas sharing one ensemble and one transfer fabric.
pub struct TestCluster {
    pub ensemble: Arc<InMemoryEnsemble>,
    pub fetcher: Arc<InMemoryPartFetcher>,
}

/// One started replica.
#[derive(Debug)]
pub struct TestReplica {
    pub name: String,
    pub store: Arc<InMemoryPartStore>,
    pub table: Arc<ReplicatedTable>,
}

impl TestCluster {
    pub fn new() -> Self {
        TestCluster {
            ensemble: InMemoryEnsemble::new(),
            fetcher: InMemoryPartFetcher::new(),
        }
    }

    pub fn metadata() -> TableMetadata {
        TableMetadata {
            date_column: "EventDate".to_string(),
            sampling_expression: String::new(),
            index_granularity: 8192,
            mode: 0,
            sign_column: String::new(),
            primary_key: "(CounterID, EventDate)".to_string(),
            columns: vec![
                ColumnDef::new("CounterID", "UInt32"),
                ColumnDef::new("EventDate", "Date"),
            ],
        }
    }

    /// Hostname a replica advertises for part transfer.
    pub fn host_of(name: &str) -> String {
        format!("{name}.local")
    }

    /// Start a replica with a fresh part store.
    pub async fn start_replica(&self, name: &str, attach: bool) -> ReplicationResult<TestReplica> {
        self.start_replica_with_store(name, attach, InMemoryPartStore::new())
            .await
    }

    /// Start a replica reusing an existing store (restart scenarios).
    pub async fn start_replica_with_store(
        &self,
        name: &str,
        attach: bool,
        store: Arc<InMemoryPartStore>,
    ) -> ReplicationResult<TestReplica> {
        self.start_replica_with(name, attach, store, Arc::new(SimpleMergePolicy::default()))
            .await
    }

    /// Start a replica with a custom merge policy.
    pub async fn start_replica_with(
        &self,
        name: &str,
        attach: bool,
        store: Arc<InMemoryPartStore>,
        policy: Arc<dyn MergePolicy>,
    ) -> ReplicationResult<TestReplica> {
        let host = Self::host_of(name);
        self.fetcher.register_peer(&host, PEER_PORT, store.clone());

        let mut config = ReplicaConfig::new(TABLE_PATH, name, host, PEER_PORT);
        if attach {
            config = config.attach();
        }

        let coordinator: Arc<dyn Coordinator> = self.ensemble.session();
        let store_dyn: Arc<dyn PartStore> = store.clone();
        let fetcher_dyn: Arc<dyn PartFetcher> = self.fetcher.clone();
        let table = ReplicatedTable::open(
            config,
            Self::metadata(),
            coordinator,
            store_dyn,
            fetcher_dyn,
            policy,
        )
        .await?;

        Ok(TestReplica {
            name: name.to_string(),
            store,
            table,
        })
    }

    /// A bare session for inspecting coordinator state from tests.
    pub fn session(&self) -> Arc<dyn Coordinator> {
        self.ensemble.session()
    }

    /// Sorted part names under `/replicas/<name>/parts`.
    pub async fn coordinator_parts(&self, name: &str) -> Vec<String> {
        let zk = self.session();
        let mut parts = zk
            .children(&format!("{TABLE_PATH}/replicas/{name}/parts"))
            .await
            .unwrap_or_default();
        parts.sort();
        parts
    }

    /// Data of `/replicas/<name>/parts/<part>/checksums`.
    pub async fn checksums_node(&self, name: &str, part: &str) -> Option<Vec<u8>> {
        let zk = self.session();
        zk.try_get(&format!("{TABLE_PATH}/replicas/{name}/parts/{part}/checksums"))
            .await
            .unwrap()
            .map(|(data, _)| data)
    }

    /// Seed a part on a replica directly: committed in the store and
    /// announced under `/parts`, with no log record. Models data that
    /// predates the replication log (e.g. created before a peer joined).
    pub async fn seed_announced_part(&self, replica: &str, part: &str) {
        let zk = self.session();
        zk.create(
            &format!("{TABLE_PATH}/replicas/{replica}/parts/{part}"),
            b"",
            CreateMode::Persistent,
        )
        .await
        .unwrap();
        zk.create(
            &format!("{TABLE_PATH}/replicas/{replica}/parts/{part}/checksums"),
            &InMemoryPartStore::insert_checksums(part),
            CreateMode::Persistent,
        )
        .await
        .unwrap();
    }
}

impl TestReplica {
    /// Write a part locally and announce it through the replication log, as
    /// the (external) write path would: allocate the insert's block number,
    /// commit the part under it, release the lock with the commit.
    ///
    /// Test fixtures name parts up front, so the name's range must match the
    /// number the ensemble hands out; inserts in a test run consume numbers
    /// in call order, starting from zero.
    pub async fn insert_part(&self, part: &str) -> ReplicationResult<()> {
        let info = PartInfo::parse(part).expect("well-formed part name");
        let lock = self.table.allocate_block_number().await?;
        assert_eq!(
            (lock.number, lock.number),
            (info.left, info.right),
            "part name {part} does not match the allocated block number"
        );
        self.store.seed_part(part);
        self.table.commit_part(part, lock).await
    }
}

/// Policy that never proposes a merge. For tests that need replication
/// without the leader interfering.
#[derive(Debug, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn select_parts_to_merge(
        &self,
        _parts: &[replitree::replication::PartInfo],
        _allowed: &[bool],
        _aggressive: bool,
        _only_small: bool,
    ) -> Option<Vec<replitree::replication::PartInfo>> {
        None
    }
}

/// Policy that stays dormant until the test enables it, so a scenario can
/// finish arranging its parts before the leader starts proposing merges.
#[derive(Debug, Default)]
pub struct TogglePolicy {
    enabled: std::sync::atomic::AtomicBool,
    inner: SimpleMergePolicy,
}

impl TogglePolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(TogglePolicy {
            enabled: std::sync::atomic::AtomicBool::new(false),
            inner: SimpleMergePolicy::default(),
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl MergePolicy for TogglePolicy {
    fn select_parts_to_merge(
        &self,
        parts: &[replitree::replication::PartInfo],
        allowed: &[bool],
        aggressive: bool,
        only_small: bool,
    ) -> Option<Vec<replitree::replication::PartInfo>> {
        if !self.enabled.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
        self.inner
            .select_parts_to_merge(parts, allowed, aggressive, only_small)
    }
}
