// SPDX-License-Identifier: AGPL-3.0-only

//! Component B: the edit algebra (spec.md §4.B). This is the hub of the
//! engine — it turns one edit tree plus one data tree into a new data
//! tree and a canonical diff, following the per-operation table of
//! spec.md §4.B exactly (create/merge/replace/delete/remove/none/ether).

mod apply;

pub use apply::{apply_edit, ApplyOutcome};
