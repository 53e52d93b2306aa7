//! Replication log records and their stable text codec.
//!
//! Every action a replica must take is one [`LogEntry`], published to the
//! producing replica's log and copied into every replica's queue by the log
//! puller. The textual format is part of the wire contract: records written
//! by one replica version must parse bit-exactly on every other.
//!
//! # Format
//!
//! ```text
//! format version: 1
//! source replica: <name>
//! get
//! <new_part_name>
//!
//! ```
//!
//! ```text
//! format version: 1
//! source replica: <name>
//! merge
//! <src1>
//! <src2>
//! into
//! <new_part_name>
//!
//! ```
//!
//! The record terminates with an extra newline. Unknown kinds are rejected.

use super::error::{ReplicationError, ReplicationResult};

/// What a log entry instructs a replica to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Materialize `new_part_name` by fetching it from a peer (the source
    /// replica already wrote it locally).
    GetPart,
    /// Merge `parts_to_merge` into `new_part_name`, or fetch the merged part
    /// if the inputs are not all present locally.
    MergeParts,
}

/// One replication action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// What to do.
    pub kind: EntryKind,
    /// The replica that produced the record.
    pub source_replica: String,
    /// The part this entry materializes.
    pub new_part_name: String,
    /// For merges, the ordered input part names; empty otherwise.
    pub parts_to_merge: Vec<String>,
    /// Once enqueued, the sequential child name under `/queue`: used to
    /// remove the node when the entry completes. Not part of the wire format.
    pub znode_name: String,
}

impl LogEntry {
    /// A `get` entry.
    pub fn get_part(source_replica: impl Into<String>, new_part_name: impl Into<String>) -> Self {
        LogEntry {
            kind: EntryKind::GetPart,
            source_replica: source_replica.into(),
            new_part_name: new_part_name.into(),
            parts_to_merge: Vec::new(),
            znode_name: String::new(),
        }
    }

    /// A `merge` entry.
    pub fn merge_parts(
        source_replica: impl Into<String>,
        parts_to_merge: Vec<String>,
        new_part_name: impl Into<String>,
    ) -> Self {
        LogEntry {
            kind: EntryKind::MergeParts,
            source_replica: source_replica.into(),
            new_part_name: new_part_name.into(),
            parts_to_merge,
            znode_name: String::new(),
        }
    }

    /// Serialize to the stable text format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("format version: 1\n");
        out.push_str("source replica: ");
        out.push_str(&self.source_replica);
        out.push('\n');
        match self.kind {
            EntryKind::GetPart => {
                out.push_str("get\n");
                out.push_str(&self.new_part_name);
            }
            EntryKind::MergeParts => {
                out.push_str("merge\n");
                for name in &self.parts_to_merge {
                    out.push_str(name);
                    out.push('\n');
                }
                out.push_str("into\n");
                out.push_str(&self.new_part_name);
            }
        }
        out.push('\n');
        out
    }

    /// Parse the stable text format. `znode_name` is left empty; the caller
    /// fills it in from the queue node the record was read from.
    pub fn parse(text: &str) -> ReplicationResult<LogEntry> {
        let malformed = |detail: &str| ReplicationError::MalformedLogEntry {
            detail: detail.to_string(),
        };

        let mut lines = text.lines();
        if lines.next() != Some("format version: 1") {
            return Err(malformed("bad or missing format version"));
        }
        let source_replica = lines
            .next()
            .and_then(|l| l.strip_prefix("source replica: "))
            .ok_or_else(|| malformed("missing source replica"))?
            .to_string();

        let kind_line = lines.next().ok_or_else(|| malformed("missing kind"))?;
        match kind_line {
            "get" => {
                let new_part_name = lines
                    .next()
                    .filter(|l| !l.is_empty())
                    .ok_or_else(|| malformed("get: missing part name"))?
                    .to_string();
                Ok(LogEntry {
                    kind: EntryKind::GetPart,
                    source_replica,
                    new_part_name,
                    parts_to_merge: Vec::new(),
                    znode_name: String::new(),
                })
            }
            "merge" => {
                let mut parts_to_merge = Vec::new();
                loop {
                    let line = lines
                        .next()
                        .ok_or_else(|| malformed("merge: truncated before 'into'"))?;
                    if line == "into" {
                        break;
                    }
                    if line.is_empty() {
                        return Err(malformed("merge: empty source part name"));
                    }
                    parts_to_merge.push(line.to_string());
                }
                let new_part_name = lines
                    .next()
                    .filter(|l| !l.is_empty())
                    .ok_or_else(|| malformed("merge: missing target part name"))?
                    .to_string();
                Ok(LogEntry {
                    kind: EntryKind::MergeParts,
                    source_replica,
                    new_part_name,
                    parts_to_merge,
                    znode_name: String::new(),
                })
            }
            other => Err(malformed(&format!("unknown kind {other:?}"))),
        }
    }

    /// Identity of an entry as replicated: everything except `znode_name`,
    /// which is assigned per-queue.
    pub fn replicated_identity(&self) -> (EntryKind, &str, &str, &[String]) {
        (
            self.kind,
            self.source_replica.as_str(),
            self.new_part_name.as_str(),
            self.parts_to_merge.as_slice(),
        )
    }
}
