//! Configuration for a table replica.

use crate::constants::{DEFAULT_MERGING_THREADS, DEFAULT_REPLICATION_THREADS};

use super::error::{ReplicationError, ReplicationResult};

/// Everything needed to open one replica of a replicated table.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Coordinator path shared by every replica of this table, e.g.
    /// `/clickhouse/tables/01/hits`. A trailing slash is stripped.
    pub table_path: String,
    /// This replica's name, unique within the table.
    pub replica_name: String,
    /// Rejoin an existing replica (`true`) or create/add a new one (`false`).
    pub attach: bool,
    /// Host peers use to fetch parts from us.
    pub host: String,
    /// Port of the inter-server part service.
    pub port: u16,
    /// Number of queue worker tasks.
    pub replication_threads: usize,
    /// Cap on concurrently proposed merges while leading.
    pub merging_threads: usize,
}

impl ReplicaConfig {
    /// Config with defaults for everything but identity.
    pub fn new(
        table_path: impl Into<String>,
        replica_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let mut table_path = table_path.into();
        while table_path.ends_with('/') {
            table_path.pop();
        }
        ReplicaConfig {
            table_path,
            replica_name: replica_name.into(),
            attach: false,
            host: host.into(),
            port,
            replication_threads: DEFAULT_REPLICATION_THREADS,
            merging_threads: DEFAULT_MERGING_THREADS,
        }
    }

    /// Rejoin instead of creating.
    pub fn attach(mut self) -> Self {
        self.attach = true;
        self
    }

    /// Coordinator path of this replica's subtree.
    pub fn replica_path(&self) -> String {
        format!("{}/replicas/{}", self.table_path, self.replica_name)
    }

    /// Name the inter-server part endpoint is registered under.
    pub fn endpoint_name(&self) -> String {
        format!("ReplicatedMergeTree:{}", self.replica_path())
    }

    /// Validate invariants that would otherwise surface as confusing
    /// coordinator errors deep inside bootstrap.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.table_path.is_empty() || !self.table_path.starts_with('/') {
            return Err(ReplicationError::Config(format!(
                "table_path must be absolute, got {:?}",
                self.table_path
            )));
        }
        if self.replica_name.is_empty() || self.replica_name.contains('/') {
            return Err(ReplicationError::Config(format!(
                "replica_name must be a single path component, got {:?}",
                self.replica_name
            )));
        }
        if self.replication_threads == 0 {
            return Err(ReplicationError::Config(
                "replication_threads must be at least 1".to_string(),
            ));
        }
        if self.merging_threads == 0 {
            return Err(ReplicationError::Config(
                "merging_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_stripped() {
        let config = ReplicaConfig::new("/tables/hits/", "r1", "localhost", 9009);
        assert_eq!(config.table_path, "/tables/hits");
        assert_eq!(config.replica_path(), "/tables/hits/replicas/r1");
        assert_eq!(
            config.endpoint_name(),
            "ReplicatedMergeTree:/tables/hits/replicas/r1"
        );
    }

    #[test]
    fn validation_catches_bad_identity() {
        let config = ReplicaConfig::new("tables/hits", "r1", "localhost", 9009);
        assert!(config.validate().is_err());

        let config = ReplicaConfig::new("/tables/hits", "a/b", "localhost", 9009);
        assert!(config.validate().is_err());

        let mut config = ReplicaConfig::new("/tables/hits", "r1", "localhost", 9009);
        config.replication_threads = 0;
        assert!(config.validate().is_err());

        let config = ReplicaConfig::new("/tables/hits", "r1", "localhost", 9009);
        assert!(config.validate().is_ok());
    }
}
