use serde::{Deserialize, Serialize};

use super::manifest::Manifest;
use super::{EntryId, EntryKind, EntryMeta};

/// Durable image of the metadata tree. Only committed manifests ever appear
/// here; buffered writes live in handles until a flush installs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub next_id: EntryId,
    /// Sorted by id; the root (id 1) comes first.
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: EntryId,
    pub parent: Option<EntryId>,
    pub name: String,
    pub kind: EntryKind,
    pub meta: EntryMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

impl TreeSnapshot {
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }
}
