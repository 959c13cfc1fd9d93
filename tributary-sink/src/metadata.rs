use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tributary_types::ChangeKind;

/// Counts of each change kind written to a file.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct CdcSummary {
    pub inserts: u64,
    pub update_befores: u64,
    pub update_afters: u64,
    pub deletes: u64,
}

impl CdcSummary {
    pub fn record(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Insert => self.inserts += 1,
            ChangeKind::UpdateBefore => self.update_befores += 1,
            ChangeKind::UpdateAfter => self.update_afters += 1,
            ChangeKind::Delete => self.deletes += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserts + self.update_befores + self.update_afters + self.deletes
    }
}

/// A closed, flushed part file, handed to the catalog once its checkpoint commits.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Fully qualified location of the committed file.
    pub path: String,
    /// Location relative to the table's base path.
    pub relative_path: String,
    pub bucket_id: String,
    pub partition_values: Vec<(String, String)>,
    pub subtask_index: u32,
    pub part_counter: u64,
    pub row_count: u64,
    pub size_bytes: u64,
    pub checkpoint_id: u32,
    pub cdc: Option<CdcSummary>,
}
