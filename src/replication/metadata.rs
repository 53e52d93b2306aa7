//! Table metadata: the textual structure record replicas verify against.
//!
//! The first replica to create a table writes this record to `/metadata`;
//! every replica re-reads it at startup and requires byte-equivalence with its
//! own locally computed serialization. Any divergence aborts bootstrap: a
//! replica with a different column set would produce incompatible parts.
//!
//! The serialization is bit-exact by construction: both sides format the same
//! structure through the same code path and compare strings.

use super::error::{ReplicationError, ReplicationResult};

/// One column: name and type, as the surrounding engine declares them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Type name, already rendered (e.g. `UInt64`, `String`, `Date`).
    pub type_name: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Everything about a table's structure that replicas must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Name of the date column partitioning inserts.
    pub date_column: String,
    /// Formatted sampling expression, empty if none.
    pub sampling_expression: String,
    /// Rows per index granule.
    pub index_granularity: u64,
    /// Engine mode (plain / collapsing / summing ...), as an integer.
    pub mode: i32,
    /// Sign column for collapsing modes, empty otherwise.
    pub sign_column: String,
    /// Formatted primary key expression.
    pub primary_key: String,
    /// Ordered column list.
    pub columns: Vec<ColumnDef>,
}

/// Back-quote an identifier, escaping backslashes and backticks.
fn back_quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for c in name.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('`');
    out
}

impl TableMetadata {
    /// Serialize to the canonical text format stored at `/metadata`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("metadata format version: 1\n");
        out.push_str(&format!("date column: {}\n", self.date_column));
        out.push_str(&format!("sampling expression: {}\n", self.sampling_expression));
        out.push_str(&format!("index granularity: {}\n", self.index_granularity));
        out.push_str(&format!("mode: {}\n", self.mode));
        out.push_str(&format!("sign column: {}\n", self.sign_column));
        out.push_str(&format!("primary key: {}\n", self.primary_key));
        out.push_str("columns:\n");
        for column in &self.columns {
            out.push_str(&back_quote(&column.name));
            out.push(' ');
            out.push_str(&column.type_name);
            out.push('\n');
        }
        out
    }

    /// Verify that `stored` (read back from `/metadata`) matches this
    /// structure.
    ///
    /// A mismatch in a column name reports [`ReplicationError::UnknownIdentifier`]
    /// with both names; any other divergence (including column order, count,
    /// or type) reports [`ReplicationError::MetadataMismatch`]. Byte-identical
    /// text always passes.
    pub fn check_equals(&self, stored: &str) -> ReplicationResult<()> {
        let expected = self.to_text();
        if stored == expected {
            return Ok(());
        }

        // Not byte-identical. Walk the column section to produce the precise
        // error the operator needs.
        let stored_cols = Self::column_section(stored);
        let expected_cols = Self::column_section(&expected);
        if let (Some(stored_cols), Some(expected_cols)) = (stored_cols, expected_cols) {
            for (stored_line, column) in stored_cols.lines().zip(&self.columns) {
                let quoted = back_quote(&column.name);
                if let Some(rest) = stored_line.strip_prefix(&quoted) {
                    if rest.strip_prefix(' ') != Some(column.type_name.as_str()) {
                        return Err(ReplicationError::MetadataMismatch {
                            detail: format!(
                                "type of column {} differs: expected {}, found {:?}",
                                column.name, column.type_name, rest.trim_start()
                            ),
                        });
                    }
                } else {
                    let found = stored_line
                        .split(' ')
                        .next()
                        .unwrap_or(stored_line)
                        .trim_matches('`');
                    return Err(ReplicationError::UnknownIdentifier {
                        expected: column.name.clone(),
                        found: found.to_string(),
                    });
                }
            }
            if stored_cols.lines().count() != self.columns.len() {
                return Err(ReplicationError::MetadataMismatch {
                    detail: format!(
                        "column count differs: expected {}, found {}",
                        self.columns.len(),
                        stored_cols.lines().count()
                    ),
                });
            }
        }

        // Columns agree (or the section is unreadable): the divergence is in
        // a header field.
        for (stored_line, expected_line) in stored.lines().zip(expected.lines()) {
            if stored_line != expected_line {
                return Err(ReplicationError::MetadataMismatch {
                    detail: format!("expected {expected_line:?}, found {stored_line:?}"),
                });
            }
        }
        Err(ReplicationError::MetadataMismatch {
            detail: "stored metadata is a strict prefix or extension of the local one".to_string(),
        })
    }

    fn column_section(text: &str) -> Option<&str> {
        let idx = text.find("columns:\n")?;
        Some(&text[idx + "columns:\n".len()..])
    }
}
