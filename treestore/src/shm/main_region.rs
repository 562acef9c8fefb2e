// SPDX-License-Identifier: AGPL-3.0-only

//! The main region: a fixed-layout mapping holding global counters and the
//! per-module directory (spec.md §4.D "Main region"). The layout never
//! grows, so readers never need to revalidate their mapping length against
//! it (only the extended region does that, see [`super::extended`]).

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::{Error, StoreResult};

const MODULE_NAME_BYTES: usize = 64;
const MAX_MODULES: usize = 256;
const COUNTER_SLOTS: usize = 4;
const COUNTERS_BYTES: usize = COUNTER_SLOTS * 8;
const MODULE_COUNT_BYTES: usize = 8;
const HEADER_BYTES: usize = COUNTERS_BYTES + MODULE_COUNT_BYTES;
const MODULE_RECORD_BYTES: usize = MODULE_NAME_BYTES
    + 4  // revision
    + 4  // flags
    + 8  // data-lock header
    + 1  // replay-supported flag
    + 8 * 4; // change/op/rpc/notif subscription list heads
const TOTAL_BYTES: usize = HEADER_BYTES + MODULE_RECORD_BYTES * MAX_MODULES;

const FLAG_NONE: u32 = 0;

/// An empty subscription list head (spec.md §4.D: heads are offsets into
/// the extended region; `u64::MAX` means "no subscribers of this kind").
pub const NO_SUBSCRIBERS: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub revision: u32,
    pub flags: u32,
    pub data_lock_header: u64,
    pub replay_supported: bool,
    pub change_sub_head: u64,
    pub op_sub_head: u64,
    pub rpc_sub_head: u64,
    pub notif_sub_head: u64,
}

impl ModuleRecord {
    fn empty(name: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            revision,
            flags: FLAG_NONE,
            data_lock_header: 0,
            replay_supported: false,
            change_sub_head: NO_SUBSCRIBERS,
            op_sub_head: NO_SUBSCRIBERS,
            rpc_sub_head: NO_SUBSCRIBERS,
            notif_sub_head: NO_SUBSCRIBERS,
        }
    }
}

/// The mapped main region. Field-level access is serialized by the lock
/// manager's create-lock (for directory mutation) and per-module data
/// lock (for a single module record); this type does no locking of its
/// own beyond the global-counter atomics, which are always safe to race.
pub struct MainRegion {
    mmap: MmapMut,
}

impl MainRegion {
    pub fn open_or_create(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.set_len(TOTAL_BYTES as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap })
    }

    fn counter(&self, slot: usize) -> &AtomicU64 {
        debug_assert!(slot < COUNTER_SLOTS);
        let offset = slot * 8;
        // SAFETY: `offset` is within the mapping (COUNTERS_BYTES <= TOTAL_BYTES),
        // 8-byte aligned by construction, and every process maps the same
        // file at this offset, so racing fetch_add calls from different
        // processes are well-defined the same way they are from different
        // threads.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU64) }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.counter(0).fetch_add(1, Ordering::AcqRel) + 1
    }
    pub fn next_session_id(&self) -> u64 {
        self.counter(1).fetch_add(1, Ordering::AcqRel) + 1
    }
    pub fn next_subscription_id(&self) -> u64 {
        self.counter(2).fetch_add(1, Ordering::AcqRel) + 1
    }
    pub fn next_event_pipe_id(&self) -> u64 {
        self.counter(3).fetch_add(1, Ordering::AcqRel) + 1
    }

    fn module_count(&self) -> usize {
        u64::from_le_bytes(self.mmap[COUNTERS_BYTES..COUNTERS_BYTES + 8].try_into().unwrap()) as usize
    }

    fn set_module_count(&mut self, count: usize) {
        self.mmap[COUNTERS_BYTES..COUNTERS_BYTES + 8].copy_from_slice(&(count as u64).to_le_bytes());
    }

    fn record_offset(slot: usize) -> usize {
        HEADER_BYTES + slot * MODULE_RECORD_BYTES
    }

    fn read_record(&self, slot: usize) -> ModuleRecord {
        let off = Self::record_offset(slot);
        let buf = &self.mmap[off..off + MODULE_RECORD_BYTES];
        let name_bytes = &buf[..MODULE_NAME_BYTES];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MODULE_NAME_BYTES);
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
        let mut p = MODULE_NAME_BYTES;
        let revision = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        p += 4;
        let flags = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        p += 4;
        let data_lock_header = u64::from_le_bytes(buf[p..p + 8].try_into().unwrap());
        p += 8;
        let replay_supported = buf[p] != 0;
        p += 1;
        let heads: Vec<u64> = buf[p..p + 32].chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect();
        ModuleRecord {
            name,
            revision,
            flags,
            data_lock_header,
            replay_supported,
            change_sub_head: heads[0],
            op_sub_head: heads[1],
            rpc_sub_head: heads[2],
            notif_sub_head: heads[3],
        }
    }

    fn write_record(&mut self, slot: usize, rec: &ModuleRecord) -> StoreResult<()> {
        if rec.name.len() > MODULE_NAME_BYTES {
            return Err(Error::invalid_arg("module name exceeds the on-disk name field width"));
        }
        let off = Self::record_offset(slot);
        let buf = &mut self.mmap[off..off + MODULE_RECORD_BYTES];
        buf[..MODULE_NAME_BYTES].fill(0);
        buf[..rec.name.len()].copy_from_slice(rec.name.as_bytes());
        let mut p = MODULE_NAME_BYTES;
        buf[p..p + 4].copy_from_slice(&rec.revision.to_le_bytes());
        p += 4;
        buf[p..p + 4].copy_from_slice(&rec.flags.to_le_bytes());
        p += 4;
        buf[p..p + 8].copy_from_slice(&rec.data_lock_header.to_le_bytes());
        p += 8;
        buf[p] = rec.replay_supported as u8;
        p += 1;
        for head in [rec.change_sub_head, rec.op_sub_head, rec.rpc_sub_head, rec.notif_sub_head] {
            buf[p..p + 8].copy_from_slice(&head.to_le_bytes());
            p += 8;
        }
        Ok(())
    }

    /// Locates `name` in the directory, or registers it in the next free
    /// slot (spec.md §4.D "per-module directory"). Returns the slot index.
    pub fn find_or_register_module(&mut self, name: &str, revision: u32) -> StoreResult<usize> {
        let count = self.module_count();
        for slot in 0..count {
            if self.read_record(slot).name == name {
                return Ok(slot);
            }
        }
        if count >= MAX_MODULES {
            return Err(Error::internal("main region module directory is full"));
        }
        self.write_record(count, &ModuleRecord::empty(name, revision))?;
        self.set_module_count(count + 1);
        Ok(count)
    }

    pub fn module_slot(&self, name: &str) -> Option<usize> {
        (0..self.module_count()).find(|&slot| self.read_record(slot).name == name)
    }

    pub fn module(&self, slot: usize) -> ModuleRecord {
        self.read_record(slot)
    }

    pub fn set_module(&mut self, slot: usize, rec: &ModuleRecord) -> StoreResult<()> {
        self.write_record(slot, rec)
    }

    pub fn modules(&self) -> Vec<ModuleRecord> {
        (0..self.module_count()).map(|s| self.read_record(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_find_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MainRegion::open_or_create(&dir.path().join("main.shm")).unwrap();
        let slot = region.find_or_register_module("ietf-interfaces", 2024).unwrap();
        assert_eq!(region.module_slot("ietf-interfaces"), Some(slot));
        let rec = region.module(slot);
        assert_eq!(rec.revision, 2024);
        assert_eq!(rec.change_sub_head, NO_SUBSCRIBERS);

        let again = region.find_or_register_module("ietf-interfaces", 2024).unwrap();
        assert_eq!(again, slot);
    }

    #[test]
    fn counters_increment_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let region = MainRegion::open_or_create(&dir.path().join("main.shm")).unwrap();
        assert_eq!(region.next_connection_id(), 1);
        assert_eq!(region.next_connection_id(), 2);
        assert_eq!(region.next_session_id(), 1);
    }
}
