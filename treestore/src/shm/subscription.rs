// SPDX-License-Identifier: AGPL-3.0-only

//! A per-subscription region: one small fixed-layout segment per delivery
//! channel, holding the request/response state header plus an inline
//! payload (spec.md §4.D "Per-subscription region").

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Error, StoreResult};

const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
const STATE_OFFSET: usize = 0;
const EVENT_ID_OFFSET: usize = 8;
const PRIORITY_OFFSET: usize = 16;
const OPCODE_OFFSET: usize = 20;
const PAYLOAD_LEN_OFFSET: usize = 24;
const PAYLOAD_OFFSET: usize = 32;
const TOTAL_BYTES: usize = PAYLOAD_OFFSET + MAX_PAYLOAD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestState {
    Idle = 0,
    Pending = 1,
    Processing = 2,
    Done = 3,
    Aborted = 4,
}

impl RequestState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Pending,
            2 => Self::Processing,
            3 => Self::Done,
            4 => Self::Aborted,
            _ => Self::Idle,
        }
    }
}

pub struct SubscriptionRegion {
    mmap: MmapMut,
}

impl SubscriptionRegion {
    pub fn open_or_create(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.set_len(TOTAL_BYTES as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap })
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u32(u32::from_le_bytes(self.mmap[STATE_OFFSET..STATE_OFFSET + 4].try_into().unwrap()))
    }

    pub fn set_state(&mut self, state: RequestState) {
        self.mmap[STATE_OFFSET..STATE_OFFSET + 4].copy_from_slice(&(state as u32).to_le_bytes());
    }

    pub fn event_id(&self) -> u64 {
        u64::from_le_bytes(self.mmap[EVENT_ID_OFFSET..EVENT_ID_OFFSET + 8].try_into().unwrap())
    }

    pub fn set_event_id(&mut self, id: u64) {
        self.mmap[EVENT_ID_OFFSET..EVENT_ID_OFFSET + 8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn priority_watermark(&self) -> u32 {
        u32::from_le_bytes(self.mmap[PRIORITY_OFFSET..PRIORITY_OFFSET + 4].try_into().unwrap())
    }

    pub fn set_priority_watermark(&mut self, p: u32) {
        self.mmap[PRIORITY_OFFSET..PRIORITY_OFFSET + 4].copy_from_slice(&p.to_le_bytes());
    }

    pub fn operation_code(&self) -> u32 {
        u32::from_le_bytes(self.mmap[OPCODE_OFFSET..OPCODE_OFFSET + 4].try_into().unwrap())
    }

    pub fn set_operation_code(&mut self, op: u32) {
        self.mmap[OPCODE_OFFSET..OPCODE_OFFSET + 4].copy_from_slice(&op.to_le_bytes());
    }

    /// Writes `payload` inline, replacing whatever was there (spec.md
    /// §4.D "inline payload of the serialized edit/diff or RPC tree").
    pub fn set_payload(&mut self, payload: &[u8]) -> StoreResult<()> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::invalid_arg("event payload exceeds the subscription region's inline capacity"));
        }
        self.mmap[PAYLOAD_LEN_OFFSET..PAYLOAD_LEN_OFFSET + 4]
            .copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.mmap[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        let len = u32::from_le_bytes(self.mmap[PAYLOAD_LEN_OFFSET..PAYLOAD_LEN_OFFSET + 4].try_into().unwrap()) as usize;
        &self.mmap[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_and_payload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = SubscriptionRegion::open_or_create(&dir.path().join("sub.shm")).unwrap();
        assert_eq!(region.state(), RequestState::Idle);
        region.set_state(RequestState::Pending);
        region.set_event_id(42);
        region.set_payload(b"diff-bytes").unwrap();
        assert_eq!(region.state(), RequestState::Pending);
        assert_eq!(region.event_id(), 42);
        assert_eq!(region.payload(), b"diff-bytes");
    }
}
