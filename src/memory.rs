//! Sparse memory image
//!
//! Address-indexed byte storage used to emulate device memory and to hold
//! memory dumps. Chunks are kept in a [`BTreeMap`] keyed by start address;
//! no two chunks overlap and chunks sharing a boundary are merged into one.
//!
//! Writes are anchored: when a write touches or overlaps existing chunks they
//! are merged with it and the freshly written bytes win in the overlap.
//! The image is single-writer; share it behind a `Mutex` when several threads
//! need it.
//!
//! # Example
//!
//! ```ignore
//! use telewatch_rs::memory::SparseMemoryImage;
//!
//! let mut image = SparseMemoryImage::new();
//! image.write(0x100, &[0u8; 16])?;
//! image.write(0x110, &[1u8; 16])?;
//! assert_eq!(image.chunk_count(), 1);
//! let bytes = image.read(0x108, 8)?;
//! ```

use crate::error::{Result, TelewatchError};
use std::collections::BTreeMap;

/// Sparse, chunked byte image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseMemoryImage {
    chunks: BTreeMap<u64, Vec<u8>>,
}

fn chunk_end(start: u64, data: &[u8]) -> u64 {
    start + data.len() as u64
}

impl SparseMemoryImage {
    /// Create an empty image
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-filled region
    pub fn add_region(&mut self, base_address: u64, size: usize) -> Result<()> {
        self.write(base_address, &vec![0u8; size])
    }

    /// Load a block of bytes (same as [`write`](Self::write))
    pub fn load(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.write(address, data)
    }

    /// Write `data` at `address`, merging it with any chunk it touches.
    ///
    /// On error the image is left unchanged.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = address.checked_add(data.len() as u64).ok_or_else(|| {
            TelewatchError::OutOfRange(format!(
                "write of {} bytes at 0x{:X} overflows the address space",
                data.len(),
                address
            ))
        })?;

        // Every chunk whose range touches [address, end]
        let touching: Vec<u64> = self
            .chunks
            .range(..=end)
            .rev()
            .take_while(|(start, bytes)| chunk_end(**start, bytes) >= address)
            .map(|(start, _)| *start)
            .collect();

        if touching.is_empty() {
            self.chunks.insert(address, data.to_vec());
            return Ok(());
        }

        self.agglomerate_anchored(address, data, touching)
    }

    /// Merge the anchor write with the chunks it touches.
    ///
    /// `touching` is in descending address order. Existing chunks must not
    /// overlap each other: every merge has to involve the anchor.
    fn agglomerate_anchored(&mut self, address: u64, data: &[u8], mut touching: Vec<u64>) -> Result<()> {
        touching.reverse();

        for pair in touching.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let a_end = chunk_end(a, &self.chunks[&a]);
            if a_end > b {
                return Err(TelewatchError::Consistency(format!(
                    "chunks at 0x{:X} and 0x{:X} overlap but neither is the write at 0x{:X}",
                    a, b, address
                )));
            }
        }

        let first = touching[0];
        let last = touching[touching.len() - 1];
        let merged_start = first.min(address);
        let merged_end = chunk_end(last, &self.chunks[&last]).max(chunk_end(address, data));

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for start in &touching {
            if let Some(bytes) = self.chunks.remove(start) {
                let offset = (start - merged_start) as usize;
                merged[offset..offset + bytes.len()].copy_from_slice(&bytes);
            }
        }
        let offset = (address - merged_start) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        tracing::trace!(
            "Merged {} chunk(s) into [0x{:X}, 0x{:X})",
            touching.len() + 1,
            merged_start,
            merged_end
        );
        self.chunks.insert(merged_start, merged);
        Ok(())
    }

    /// Merge every pair of adjacent chunks that share a boundary.
    ///
    /// Fails with a consistency error if two chunks overlap: without a write
    /// to anchor on there is no way to tell which bytes are current. The
    /// image is left unchanged in that case.
    pub fn agglomerate(&mut self) -> Result<()> {
        let mut prev_end: Option<(u64, u64)> = None;
        for (start, bytes) in &self.chunks {
            if let Some((prev_start, end)) = prev_end {
                if end > *start {
                    return Err(TelewatchError::Consistency(format!(
                        "chunks at 0x{:X} and 0x{:X} overlap with no anchoring write",
                        prev_start, start
                    )));
                }
            }
            prev_end = Some((*start, chunk_end(*start, bytes)));
        }

        let old = std::mem::take(&mut self.chunks);
        let mut current: Option<(u64, Vec<u8>)> = None;
        for (start, bytes) in old {
            current = match current {
                Some((cur_start, mut cur)) if chunk_end(cur_start, &cur) == start => {
                    cur.extend_from_slice(&bytes);
                    Some((cur_start, cur))
                }
                Some((cur_start, cur)) => {
                    self.chunks.insert(cur_start, cur);
                    Some((start, bytes))
                }
                None => Some((start, bytes)),
            };
        }
        if let Some((start, bytes)) = current {
            self.chunks.insert(start, bytes);
        }
        Ok(())
    }

    /// Read `length` bytes starting at `address`.
    ///
    /// The whole range must fall within a single chunk.
    pub fn read(&self, address: u64, length: usize) -> Result<Vec<u8>> {
        let (start, bytes) = self.chunks.range(..=address).next_back().ok_or_else(|| {
            TelewatchError::OutOfRange(format!("no memory chunk at or below 0x{:X}", address))
        })?;

        let offset = (address - start) as usize;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                TelewatchError::OutOfRange(format!(
                    "read of {} bytes at 0x{:X} exceeds chunk [0x{:X}, 0x{:X})",
                    length,
                    address,
                    start,
                    chunk_end(*start, bytes)
                ))
            })?;

        Ok(bytes[offset..end].to_vec())
    }

    /// True if `[address, address + length)` can be read
    pub fn contains(&self, address: u64, length: usize) -> bool {
        self.read(address, length).is_ok()
    }

    /// Iterate over `(start_address, bytes)` in address order
    pub fn chunks(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.chunks.iter().map(|(start, bytes)| (*start, bytes.as_slice()))
    }

    /// Number of chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total number of bytes stored
    pub fn total_size(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Remove every chunk
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Insert a chunk without merging. Only for building inconsistent
    /// images in tests.
    #[cfg(test)]
    fn insert_raw(&mut self, address: u64, data: Vec<u8>) {
        self.chunks.insert(address, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_chunks_merge() {
        let mut image = SparseMemoryImage::new();
        let low: Vec<u8> = (0..16).collect();
        let high: Vec<u8> = (16..32).collect();
        image.write(0x100, &low).unwrap();
        image.write(0x110, &high).unwrap();

        assert_eq!(image.chunk_count(), 1);
        let (start, bytes) = image.chunks().next().unwrap();
        assert_eq!(start, 0x100);
        assert_eq!(bytes.len(), 32);

        assert_eq!(image.read(0x108, 8).unwrap(), (8..16).collect::<Vec<u8>>());
        assert_eq!(image.read(0x10C, 8).unwrap(), (12..20).collect::<Vec<u8>>());
    }

    #[test]
    fn test_adjacent_merge_in_reverse_order() {
        let mut image = SparseMemoryImage::new();
        image.write(0x110, &[2u8; 16]).unwrap();
        image.write(0x100, &[1u8; 16]).unwrap();
        assert_eq!(image.chunk_count(), 1);
        assert_eq!(image.read(0x10F, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_overlap_prefers_latest_write() {
        let mut image = SparseMemoryImage::new();
        image.write(0x100, &[0xAA; 8]).unwrap();
        image.write(0x104, &[0xBB; 8]).unwrap();

        assert_eq!(image.chunk_count(), 1);
        assert_eq!(image.total_size(), 12);
        assert_eq!(
            image.read(0x100, 12).unwrap(),
            vec![0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0xBB]
        );
    }

    #[test]
    fn test_write_bridges_two_chunks() {
        let mut image = SparseMemoryImage::new();
        image.write(0x00, &[1; 4]).unwrap();
        image.write(0x10, &[3; 4]).unwrap();
        assert_eq!(image.chunk_count(), 2);

        image.write(0x02, &[2; 15]).unwrap();
        assert_eq!(image.chunk_count(), 1);
        let bytes = image.read(0x00, 0x14).unwrap();
        assert_eq!(&bytes[..2], &[1, 1]);
        assert!(bytes[2..0x11].iter().all(|b| *b == 2));
        assert_eq!(&bytes[0x11..], &[3, 3, 3]);
    }

    #[test]
    fn test_write_inside_existing_chunk() {
        let mut image = SparseMemoryImage::new();
        image.add_region(0x2000_0000, 64).unwrap();
        image.write(0x2000_0010, &[0xDE, 0xAD]).unwrap();

        assert_eq!(image.chunk_count(), 1);
        assert_eq!(image.total_size(), 64);
        assert_eq!(image.read(0x2000_000F, 4).unwrap(), vec![0, 0xDE, 0xAD, 0]);
    }

    #[test]
    fn test_same_start_shorter_write_keeps_tail() {
        let mut image = SparseMemoryImage::new();
        image.write(0x40, &[1; 8]).unwrap();
        image.write(0x40, &[9; 2]).unwrap();
        assert_eq!(image.read(0x40, 8).unwrap(), vec![9, 9, 1, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut image = SparseMemoryImage::new();
        assert!(matches!(image.read(0, 1), Err(TelewatchError::OutOfRange(_))));

        image.write(0x100, &[0; 16]).unwrap();
        assert!(matches!(image.read(0xFF, 1), Err(TelewatchError::OutOfRange(_))));
        assert!(matches!(image.read(0x108, 9), Err(TelewatchError::OutOfRange(_))));
        assert!(image.read(0x108, 8).is_ok());
        assert!(!image.contains(0x200, 1));
    }

    #[test]
    fn test_huge_read_length_is_out_of_range() {
        let mut image = SparseMemoryImage::new();
        image.write(0x100, &[0; 16]).unwrap();
        assert!(matches!(
            image.read(0x108, usize::MAX),
            Err(TelewatchError::OutOfRange(_))
        ));
        assert!(!image.contains(0x100, usize::MAX));
    }

    #[test]
    fn test_read_does_not_span_gaps() {
        let mut image = SparseMemoryImage::new();
        image.write(0x100, &[0; 4]).unwrap();
        image.write(0x108, &[0; 4]).unwrap();
        assert_eq!(image.chunk_count(), 2);
        assert!(image.read(0x102, 8).is_err());
    }

    #[test]
    fn test_inconsistent_chunks_rejected_without_corruption() {
        let mut image = SparseMemoryImage::new();
        image.insert_raw(0x100, vec![1; 8]);
        image.insert_raw(0x104, vec![2; 8]);
        let before = image.clone();

        // A write touching both overlapping chunks cannot be anchored
        let err = image.write(0x106, &[3]).unwrap_err();
        assert!(matches!(err, TelewatchError::Consistency(_)));
        assert_eq!(image, before);

        assert!(matches!(image.agglomerate(), Err(TelewatchError::Consistency(_))));
        assert_eq!(image, before);
    }

    #[test]
    fn test_agglomerate_merges_touching_chunks() {
        let mut image = SparseMemoryImage::new();
        image.insert_raw(0x0, vec![1; 4]);
        image.insert_raw(0x4, vec![2; 4]);
        image.insert_raw(0x10, vec![3; 4]);

        image.agglomerate().unwrap();
        assert_eq!(image.chunk_count(), 2);
        assert_eq!(image.read(0x0, 8).unwrap(), vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut image = SparseMemoryImage::new();
        image.write(0x100, &[]).unwrap();
        assert!(image.is_empty());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_chunks_never_touch_after_writes(
            writes in prop::collection::vec((0u64..0x200, 1usize..32), 1..40)
        ) {
            let mut image = SparseMemoryImage::new();
            for (i, (addr, len)) in writes.iter().enumerate() {
                image.write(*addr, &vec![i as u8; *len]).unwrap();
            }

            let chunks: Vec<(u64, usize)> = image.chunks().map(|(s, b)| (s, b.len())).collect();
            for pair in chunks.windows(2) {
                // Strictly separated: no overlap and no shared boundary
                prop_assert!(pair[0].0 + (pair[0].1 as u64) < pair[1].0);
            }
        }

        #[test]
        fn test_last_write_is_readable(
            writes in prop::collection::vec((0u64..0x200, 1usize..32), 1..20)
        ) {
            let mut image = SparseMemoryImage::new();
            for (i, (addr, len)) in writes.iter().enumerate() {
                image.write(*addr, &vec![i as u8 + 1; *len]).unwrap();
            }
            let (addr, len) = writes[writes.len() - 1];
            let expected = vec![writes.len() as u8; len];
            prop_assert_eq!(image.read(addr, len).unwrap(), expected);
        }
    }
}
