// SPDX-License-Identifier: AGPL-3.0-only

//! The extended region: variable-length, remappable storage for
//! subscription records and their arguments, allocated first-fit from a
//! hole list (spec.md §4.D "Extended region"). Growth beyond the current
//! mapping remaps the file; every accessor first checks the shared "size"
//! word against its own mapped length and remaps if behind (spec.md §4.D
//! "Remap discipline").

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, StoreResult};

const SIZE_WORD_BYTES: usize = 8;
const HOLE_COUNT_BYTES: usize = 8;
const MAX_HOLES: usize = 1024;
const HOLE_ENTRY_BYTES: usize = 16; // offset:u64, len:u64
const HOLE_TABLE_BYTES: usize = HOLE_COUNT_BYTES + MAX_HOLES * HOLE_ENTRY_BYTES;
const HEADER_BYTES: usize = SIZE_WORD_BYTES + HOLE_TABLE_BYTES;
const INITIAL_DATA_BYTES: usize = 256 * 1024;
const GROWTH_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    pub offset: u64,
    pub len: u64,
}

pub struct ExtendedRegion {
    path: PathBuf,
    mmap: MmapMut,
}

impl ExtendedRegion {
    pub fn open_or_create(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let needs_init = file.metadata()?.len() == 0;
        if needs_init {
            file.set_len((HEADER_BYTES + INITIAL_DATA_BYTES) as u64)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut region = Self { path: path.to_path_buf(), mmap };
        if needs_init {
            region.set_size(0);
            region.set_hole_count(0);
        }
        Ok(region)
    }

    fn size(&self) -> u64 {
        u64::from_le_bytes(self.mmap[0..8].try_into().unwrap())
    }

    fn set_size(&mut self, size: u64) {
        self.mmap[0..8].copy_from_slice(&size.to_le_bytes());
    }

    fn hole_count(&self) -> usize {
        u64::from_le_bytes(self.mmap[8..16].try_into().unwrap()) as usize
    }

    fn set_hole_count(&mut self, n: usize) {
        self.mmap[8..16].copy_from_slice(&(n as u64).to_le_bytes());
    }

    fn hole_at(&self, idx: usize) -> Hole {
        let off = 16 + idx * HOLE_ENTRY_BYTES;
        Hole {
            offset: u64::from_le_bytes(self.mmap[off..off + 8].try_into().unwrap()),
            len: u64::from_le_bytes(self.mmap[off + 8..off + 16].try_into().unwrap()),
        }
    }

    fn set_hole_at(&mut self, idx: usize, hole: Hole) {
        let off = 16 + idx * HOLE_ENTRY_BYTES;
        self.mmap[off..off + 8].copy_from_slice(&hole.offset.to_le_bytes());
        self.mmap[off + 8..off + 16].copy_from_slice(&hole.len.to_le_bytes());
    }

    fn holes(&self) -> Vec<Hole> {
        (0..self.hole_count()).map(|i| self.hole_at(i)).collect()
    }

    fn set_holes(&mut self, holes: &[Hole]) -> StoreResult<()> {
        if holes.len() > MAX_HOLES {
            return Err(Error::internal("extended region hole list overflowed its reserved capacity"));
        }
        for (i, h) in holes.iter().enumerate() {
            self.set_hole_at(i, *h);
        }
        self.set_hole_count(holes.len());
        Ok(())
    }

    fn mapped_data_len(&self) -> usize {
        self.mmap.len() - HEADER_BYTES
    }

    /// Remaps to at least `min_bytes` of data capacity beyond the header,
    /// growing the backing file first (spec.md §4.D "grow-and-remap
    /// guarded by a write lock"). Callers hold the ext-remap write lock.
    pub fn ensure_capacity(&mut self, min_bytes: usize) -> StoreResult<()> {
        if self.mapped_data_len() >= min_bytes {
            return Ok(());
        }
        let mut new_len = self.mapped_data_len().max(INITIAL_DATA_BYTES);
        while new_len < min_bytes {
            new_len *= GROWTH_FACTOR;
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len((HEADER_BYTES + new_len) as u64)?;
        self.mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(())
    }

    /// Revalidates this mapping's length against the shared size word and
    /// remaps if a writer has grown the file since the caller last looked
    /// (spec.md §4.D "clients compare local mapped size with shared size").
    pub fn revalidate(&mut self) -> StoreResult<()> {
        let needed = self.size() as usize;
        self.ensure_capacity(needed)
    }

    /// First-fit allocation from the hole list, growing the region if no
    /// hole is large enough (spec.md §4.D "Allocation is first-fit from
    /// the hole list"). Returns the data-relative offset (0 = first byte
    /// past the header).
    pub fn alloc(&mut self, len: usize) -> StoreResult<u64> {
        let len = len as u64;
        let mut holes = self.holes();
        if let Some(idx) = holes.iter().position(|h| h.len >= len) {
            let hole = holes[idx];
            let offset = hole.offset;
            if hole.len == len {
                holes.remove(idx);
            } else {
                holes[idx] = Hole { offset: hole.offset + len, len: hole.len - len };
            }
            self.set_holes(&holes)?;
            return Ok(offset);
        }
        let offset = self.size();
        self.ensure_capacity((offset + len) as usize)?;
        self.set_size(offset + len);
        Ok(offset)
    }

    /// Returns `[offset, offset+len)` to the hole list, coalescing with
    /// adjacent holes (spec.md §4.D "frees coalesce with adjacent holes").
    pub fn free(&mut self, offset: u64, len: u64) -> StoreResult<()> {
        let mut holes = self.holes();
        holes.push(Hole { offset, len });
        holes.sort_by_key(|h| h.offset);
        let mut merged: Vec<Hole> = Vec::with_capacity(holes.len());
        for h in holes {
            if let Some(last) = merged.last_mut() {
                if last.offset + last.len == h.offset {
                    last.len += h.len;
                    continue;
                }
            }
            merged.push(h);
        }
        self.set_holes(&merged)
    }

    pub fn read(&self, offset: u64, len: usize) -> &[u8] {
        let start = HEADER_BYTES + offset as usize;
        &self.mmap[start..start + len]
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) {
        let start = HEADER_BYTES + offset as usize;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_coalesces_adjacent_holes() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = ExtendedRegion::open_or_create(&dir.path().join("ext.shm")).unwrap();
        let a = region.alloc(100).unwrap();
        let b = region.alloc(100).unwrap();
        let c = region.alloc(100).unwrap();
        region.free(a, 100).unwrap();
        region.free(b, 100).unwrap();
        assert_eq!(region.holes().len(), 1);
        assert_eq!(region.holes()[0], Hole { offset: a, len: 200 });

        let reused = region.alloc(150).unwrap();
        assert_eq!(reused, a);
        let _ = c;
    }

    #[test]
    fn grows_when_no_hole_fits() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = ExtendedRegion::open_or_create(&dir.path().join("ext.shm")).unwrap();
        let big = region.alloc(INITIAL_DATA_BYTES * 3).unwrap();
        region.write(big, b"hello");
        assert_eq!(region.read(big, 5), b"hello");
    }
}
