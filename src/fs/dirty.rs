//! Buffered, not yet committed writes of one handle.

use std::collections::BTreeMap;

/// Disjoint byte extents keyed by start offset. Extents never overlap or
/// touch: a write that overlaps or abuts existing extents merges with them,
/// its own bytes winning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyBuffer {
    extents: BTreeMap<u64, Vec<u8>>,
}

impl DirtyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Record `data` at `offset`, overwriting earlier bytes in that range.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;
        let touching: Vec<u64> = self
            .extents
            .range(..=end)
            .filter(|(start, bytes)| **start + bytes.len() as u64 >= offset)
            .map(|(start, _)| *start)
            .collect();

        let mut merged_start = offset;
        let mut merged_end = end;
        for start in &touching {
            if let Some(bytes) = self.extents.get(start) {
                merged_start = merged_start.min(*start);
                merged_end = merged_end.max(start + bytes.len() as u64);
            }
        }

        let mut buf = vec![0u8; (merged_end - merged_start) as usize];
        for start in touching {
            if let Some(bytes) = self.extents.remove(&start) {
                let at = (start - merged_start) as usize;
                buf[at..at + bytes.len()].copy_from_slice(&bytes);
            }
        }
        let at = (offset - merged_start) as usize;
        buf[at..at + data.len()].copy_from_slice(data);
        self.extents.insert(merged_start, buf);
    }

    /// Drop everything at or beyond `size`.
    pub fn truncate(&mut self, size: u64) {
        let beyond: Vec<u64> = self.extents.range(size..).map(|(s, _)| *s).collect();
        for start in beyond {
            self.extents.remove(&start);
        }
        if let Some((start, bytes)) = self.extents.range_mut(..size).next_back() {
            let keep = (size - *start) as usize;
            if bytes.len() > keep {
                bytes.truncate(keep);
            }
        }
    }

    /// One past the last dirty byte, or 0 when clean.
    pub fn end(&self) -> u64 {
        self.extents
            .iter()
            .next_back()
            .map(|(start, bytes)| start + bytes.len() as u64)
            .unwrap_or(0)
    }

    /// Total buffered bytes.
    pub fn len(&self) -> u64 {
        self.extents.values().map(|b| b.len() as u64).sum()
    }

    /// `(start, end)` of each extent in order.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.extents
            .iter()
            .map(|(start, bytes)| (*start, start + bytes.len() as u64))
            .collect()
    }

    pub fn extents(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.extents.iter().map(|(s, b)| (*s, b.as_slice()))
    }

    /// Copy dirty bytes overlapping `[offset, offset + buf.len())` into `buf`.
    pub fn overlay(&self, offset: u64, buf: &mut [u8]) {
        let end = offset + buf.len() as u64;
        for (start, bytes) in self.extents.range(..end) {
            let ext_end = start + bytes.len() as u64;
            if ext_end <= offset {
                continue;
            }
            let from = offset.max(*start);
            let to = end.min(ext_end);
            buf[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&bytes[(from - start) as usize..(to - start) as usize]);
        }
    }

    pub fn take(&mut self) -> DirtyBuffer {
        std::mem::take(self)
    }
}
