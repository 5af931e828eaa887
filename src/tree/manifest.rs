use std::fmt;

use serde::{Deserialize, Serialize};

/// Content identifier of an immutable chunk (lowercase hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One piece of a file: `len` bytes starting at `offset`, stored as `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: ChunkId,
    pub offset: u64,
    pub len: u64,
}

impl ChunkRef {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Monotonic version of a file's manifest. Each committed flush that changes
/// content produces the next version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestVersion(pub u64);

impl ManifestVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Ordered chunk references reconstructing a file. Immutable once built; a
/// file moves to new content by swapping in a whole new `Manifest`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: ManifestVersion,
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
}

impl Manifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a manifest from chunk ids and lengths laid end to end.
    pub fn from_pieces(
        version: ManifestVersion,
        pieces: impl IntoIterator<Item = (ChunkId, u64)>,
    ) -> Self {
        let mut offset = 0;
        let chunks: Vec<ChunkRef> = pieces
            .into_iter()
            .filter(|(_, len)| *len > 0)
            .map(|(id, len)| {
                let r = ChunkRef { id, offset, len };
                offset += len;
                r
            })
            .collect();
        Self {
            version,
            size: offset,
            chunks,
        }
    }

    /// Check the structural invariants: chunks are contiguous from zero and
    /// their lengths sum to the declared size.
    pub fn validate(&self) -> Result<(), String> {
        let mut expected = 0u64;
        for (i, c) in self.chunks.iter().enumerate() {
            if c.len == 0 {
                return Err(format!("chunk {} ({}) has zero length", i, c.id));
            }
            if c.offset != expected {
                return Err(format!(
                    "chunk {} ({}) starts at {} but previous chunk ended at {}",
                    i, c.id, c.offset, expected
                ));
            }
            expected = c.end();
        }
        if expected != self.size {
            return Err(format!(
                "chunk lengths sum to {} but declared size is {}",
                expected, self.size
            ));
        }
        Ok(())
    }

    /// Chunks overlapping `[offset, offset + len)`, in file order.
    pub fn chunks_in_range(&self, offset: u64, len: u64) -> &[ChunkRef] {
        let end = offset.saturating_add(len).min(self.size);
        if offset >= end {
            return &[];
        }
        let first = self.chunks.partition_point(|c| c.end() <= offset);
        let last = self.chunks.partition_point(|c| c.offset < end);
        &self.chunks[first..last]
    }
}
