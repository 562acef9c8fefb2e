// SPDX-License-Identifier: AGPL-3.0-only

//! Small constants and utilities shared by every crate in the workspace.
//!
//! This mirrors the role `libsky` plays for the teacher project: a single
//! place for version strings and path/hash helpers that both the library
//! and the admin binary need, so they never drift apart.

pub mod path;

/// Semantic version of the on-wire/on-disk formats this workspace produces.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default installation prefix used when `REPOSITORY_PATH` is unset.
pub const DEFAULT_REPOSITORY_PATH: &str = "/var/lib/treestore";

/// Environment variable overriding the repository root (spec.md §6).
pub const ENV_REPOSITORY_PATH: &str = "REPOSITORY_PATH";

/// Default cap, in bytes, for a single notification replay file (spec.md §6).
pub const DEFAULT_NOTIF_FILE_CAP_BYTES: usize = 1024 * 1024;

/// A generic result alias for code that has no use for a structured error.
pub type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
