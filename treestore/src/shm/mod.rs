// SPDX-License-Identifier: AGPL-3.0-only

//! Component D: the shared-memory layout (spec.md §4.D). Three classes of
//! region, each backed by a real `memmap2` mapping over a file under the
//! repository path — the same "files under a configured directory" shape
//! the teacher's storage engine uses for its data files, just mapped
//! instead of read/written with a cursor.

mod extended;
mod main_region;
mod subscription;

pub use extended::{ExtendedRegion, Hole};
pub use main_region::{MainRegion, ModuleRecord};
pub use subscription::SubscriptionRegion;

use std::path::{Path, PathBuf};

/// Where a region's backing file lives under the repository path (spec.md
/// §4.D "Naming").
pub fn main_region_path(repository_path: &Path) -> PathBuf {
    repository_path.join("main.shm")
}

pub fn extended_region_path(repository_path: &Path) -> PathBuf {
    repository_path.join("extended.shm")
}

/// Per-subscription segments are named by (channel, module-or-path-hash)
/// (spec.md §4.D "Naming"); [`treestore_common::path::subscription_segment_name`]
/// computes the stable name, this just roots it under the repository.
pub fn subscription_segment_path(repository_path: &Path, segment_name: &str) -> PathBuf {
    repository_path.join("sub").join(segment_name)
}
