// SPDX-License-Identifier: AGPL-3.0-only

//! Component I: the module metadata store (spec.md §4.I). A small,
//! well-known record of installed modules plus a queue of scheduled
//! install/update/remove/feature-toggle operations, applied at connect
//! time. Schema parsing itself is a Non-goal (spec.md §1), so this module
//! never touches YANG text beyond caching it verbatim for a scheduled
//! install/update; the "construct a tentative schema context, validate,
//! reparse" step of spec.md §4.I is represented by the [`SchemaProvider`]
//! hook a caller supplies (the schema-aware tree library owns the real
//! parse).
//!
//! Persisted as YAML via `serde`/`serde_yaml` (SPEC_FULL.md §6.3), the
//! same way the teacher's own `config/cfgfile.rs` persists structured
//! state — this record is small, human-inspectable, and already shaped
//! like a `Deserialize` struct tree, unlike the arbitrary user data trees
//! [`crate::store::file`] exists to encode.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, StoreResult};

const MODULE_STORE_FILE: &str = "sys.module-store";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleEntry {
    pub name: String,
    pub revision: u32,
    #[serde(default)]
    pub enabled_features: Vec<String>,
    /// Other modules' data nodes that augment/reference this one; a
    /// non-empty list blocks `remove_module` (spec.md §4.I).
    #[serde(default)]
    pub inverse_data_deps: Vec<String>,
    #[serde(default)]
    pub replay_supported: bool,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl ModuleEntry {
    fn new(name: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            revision,
            enabled_features: Vec::new(),
            inverse_data_deps: Vec::new(),
            replay_supported: false,
            owner: None,
            group: None,
            mode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ScheduledOp {
    Install { module: String, revision: u32, yang_text: String, features: Vec<String>, initial_data: Option<Vec<u8>> },
    Update { module: String, revision: u32, yang_text: String },
    Remove { module: String },
    FeatureToggle { module: String, feature: String, enable: bool },
}

impl ScheduledOp {
    fn module_name(&self) -> &str {
        match self {
            ScheduledOp::Install { module, .. }
            | ScheduledOp::Update { module, .. }
            | ScheduledOp::Remove { module }
            | ScheduledOp::FeatureToggle { module, .. } => module,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    #[serde(default)]
    modules: Vec<ModuleEntry>,
    #[serde(default)]
    scheduled: Vec<ScheduledOp>,
}

/// The hook a caller (the real schema-aware tree library, in a full
/// deployment) supplies so [`ModuleStore::apply_scheduled`] can perform
/// the "construct a tentative schema context; validate dependencies;
/// reparse persisted data through it" step of spec.md §4.I without this
/// crate owning a YANG parser itself (Non-goal, spec.md §1).
pub trait SchemaProvider: Send + Sync {
    /// Whether every module `deps` names is currently installed (or
    /// installed as part of the same batch), so a scheduled install's
    /// dependencies are satisfiable.
    fn dependencies_satisfied(&self, deps: &[String]) -> bool;
    /// Re-validates any already-persisted data for `module` against the
    /// new schema text; `Err` aborts this one scheduled operation,
    /// leaving it queued (spec.md §4.I "on any failure the schedule is
    /// left in place").
    fn revalidate_data(&self, module: &str, yang_text: &str) -> StoreResult<()>;
}

/// A provider that accepts every schema change unconditionally; useful
/// for tests and for callers that perform their own validation upstream.
pub struct PermissiveSchemaProvider;

impl SchemaProvider for PermissiveSchemaProvider {
    fn dependencies_satisfied(&self, _deps: &[String]) -> bool {
        true
    }
    fn revalidate_data(&self, _module: &str, _yang_text: &str) -> StoreResult<()> {
        Ok(())
    }
}

pub struct ModuleStore {
    path: PathBuf,
    modules: RwLock<BTreeMap<String, ModuleEntry>>,
    scheduled: RwLock<Vec<ScheduledOp>>,
}

impl ModuleStore {
    /// Loads `<root>/data/sys.module-store`, or starts empty if absent.
    pub fn load(repository_path: &Path) -> StoreResult<Self> {
        let path = repository_path.join("data").join(MODULE_STORE_FILE);
        let persisted: Persisted = match fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str(&text).map_err(|e| Error::internal(format!("corrupt module store: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Persisted::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            modules: RwLock::new(persisted.modules.into_iter().map(|m| (m.name.clone(), m)).collect()),
            scheduled: RwLock::new(persisted.scheduled),
        })
    }

    fn persist(&self) -> StoreResult<()> {
        let persisted = Persisted {
            modules: self.modules.read().values().cloned().collect(),
            scheduled: self.scheduled.read().clone(),
        };
        let text = serde_yaml::to_string(&persisted).map_err(|e| Error::internal(format!("failed to serialize module store: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self.path.file_name().unwrap().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn installed(&self, module: &str) -> Option<ModuleEntry> {
        self.modules.read().get(module).cloned()
    }

    pub fn list_installed(&self) -> Vec<ModuleEntry> {
        self.modules.read().values().cloned().collect()
    }

    fn schedule(&self, op: ScheduledOp) -> StoreResult<()> {
        self.scheduled.write().push(op);
        self.persist()
    }

    pub fn install_module(&self, module: &str, revision: u32, yang_text: String, features: Vec<String>, initial_data: Option<Vec<u8>>) -> StoreResult<()> {
        if self.modules.read().contains_key(module) {
            return Err(Error::exists(format!("module '{module}' is already installed")));
        }
        self.schedule(ScheduledOp::Install { module: module.to_string(), revision, yang_text, features, initial_data })
    }

    pub fn update_module(&self, module: &str, revision: u32, yang_text: String) -> StoreResult<()> {
        if !self.modules.read().contains_key(module) {
            return Err(Error::not_found(format!("module '{module}' is not installed")));
        }
        self.schedule(ScheduledOp::Update { module: module.to_string(), revision, yang_text })
    }

    /// Schedules removal, refused while another installed module still
    /// depends on this one's data (spec.md §4.I "inverse data
    /// dependencies").
    pub fn remove_module(&self, module: &str) -> StoreResult<()> {
        let modules = self.modules.read();
        let entry = modules.get(module).ok_or_else(|| Error::not_found(format!("module '{module}' is not installed")))?;
        if !entry.inverse_data_deps.is_empty() {
            return Err(Error::operation_failed(format!(
                "module '{module}' is still depended on by: {}",
                entry.inverse_data_deps.join(", ")
            )));
        }
        drop(modules);
        self.schedule(ScheduledOp::Remove { module: module.to_string() })
    }

    pub fn enable_feature(&self, module: &str, feature: &str, enable: bool) -> StoreResult<()> {
        if !self.modules.read().contains_key(module) {
            return Err(Error::not_found(format!("module '{module}' is not installed")));
        }
        self.schedule(ScheduledOp::FeatureToggle { module: module.to_string(), feature: feature.to_string(), enable })
    }

    /// Not scheduled: replay support is a plain flag on an already
    /// installed module (spec.md §4.I "a replay-support flag").
    pub fn set_replay_support(&self, module: &str, on: bool) -> StoreResult<()> {
        let mut modules = self.modules.write();
        let entry = modules.get_mut(module).ok_or_else(|| Error::not_found(format!("module '{module}' is not installed")))?;
        entry.replay_supported = on;
        drop(modules);
        self.persist()
    }

    /// Updates the POSIX owner/group/mode recorded for `module` and
    /// applies them to its datastore files on disk (spec.md §6
    /// "Permissions"). `None` leaves that attribute unchanged.
    pub fn set_module_access(
        &self,
        repository_path: &Path,
        module: &str,
        owner: Option<String>,
        group: Option<String>,
        mode: Option<u32>,
    ) -> StoreResult<()> {
        {
            let mut modules = self.modules.write();
            let entry = modules.get_mut(module).ok_or_else(|| Error::not_found(format!("module '{module}' is not installed")))?;
            if owner.is_some() {
                entry.owner = owner;
            }
            if group.is_some() {
                entry.group = group;
            }
            if mode.is_some() {
                entry.mode = mode;
            }
        }
        self.persist()?;
        apply_file_permissions(repository_path, module, self.installed(module).expect("just updated above"))
    }

    /// Processes every queued operation once (spec.md §4.I "At connection
    /// time the first connection processes scheduled operations
    /// atomically"). Each operation is independent: a failure leaves that
    /// one operation queued and logs it, but does not block the rest.
    pub fn apply_scheduled(&self, provider: &dyn SchemaProvider) -> StoreResult<()> {
        let pending = self.scheduled.read().clone();
        let mut still_pending = Vec::new();
        for op in pending {
            match self.try_apply_one(&op, provider) {
                Ok(()) => log::info!("applied scheduled operation for module '{}'", op.module_name()),
                Err(e) => {
                    log::info!("leaving scheduled operation for module '{}' in place: {e}", op.module_name());
                    still_pending.push(op);
                }
            }
        }
        *self.scheduled.write() = still_pending;
        self.persist()
    }

    fn try_apply_one(&self, op: &ScheduledOp, provider: &dyn SchemaProvider) -> StoreResult<()> {
        match op {
            ScheduledOp::Install { module, revision, yang_text, features, .. } => {
                provider.revalidate_data(module, yang_text)?;
                let mut entry = ModuleEntry::new(module, *revision);
                entry.enabled_features = features.clone();
                self.modules.write().insert(module.clone(), entry);
                Ok(())
            }
            ScheduledOp::Update { module, revision, yang_text } => {
                provider.revalidate_data(module, yang_text)?;
                let mut modules = self.modules.write();
                let entry = modules.get_mut(module).ok_or_else(|| Error::internal("scheduled update for an uninstalled module"))?;
                entry.revision = *revision;
                Ok(())
            }
            ScheduledOp::Remove { module } => {
                let mut modules = self.modules.write();
                if let Some(entry) = modules.get(module) {
                    if !entry.inverse_data_deps.is_empty() {
                        return Err(Error::operation_failed("module gained inverse dependencies since removal was scheduled"));
                    }
                }
                modules.remove(module);
                Ok(())
            }
            ScheduledOp::FeatureToggle { module, feature, enable } => {
                let mut modules = self.modules.write();
                let entry = modules.get_mut(module).ok_or_else(|| Error::internal("scheduled feature toggle for an uninstalled module"))?;
                if *enable {
                    if !entry.enabled_features.iter().any(|f| f == feature) {
                        entry.enabled_features.push(feature.clone());
                    }
                } else {
                    entry.enabled_features.retain(|f| f != feature);
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn apply_file_permissions(repository_path: &Path, module: &str, entry: ModuleEntry) -> StoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    for datastore in ["running", "startup", "operational"] {
        let path = crate::store::file::datastore_path(repository_path, module, datastore);
        if !path.exists() {
            continue;
        }
        if let Some(mode) = entry.mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        if entry.owner.is_some() || entry.group.is_some() {
            chown_path(&path, entry.owner.as_deref(), entry.group.as_deref())?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_file_permissions(_repository_path: &Path, _module: &str, _entry: ModuleEntry) -> StoreResult<()> {
    Ok(())
}

#[cfg(unix)]
fn chown_path(path: &Path, owner: Option<&str>, group: Option<&str>) -> StoreResult<()> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| Error::invalid_arg("datastore path contains a NUL byte"))?;
    let uid = owner.map(resolve_uid).transpose()?.unwrap_or(u32::MAX);
    let gid = group.map(resolve_gid).transpose()?.unwrap_or(u32::MAX);
    // SAFETY: `c_path` is a valid NUL-terminated C string for the
    // duration of this call; `chown` only reads it.
    let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(unix)]
fn resolve_uid(name: &str) -> StoreResult<u32> {
    name.parse::<u32>().map_err(|_| Error::invalid_arg(format!("unknown user '{name}': numeric uid required")))
}

#[cfg(unix)]
fn resolve_gid(name: &str) -> StoreResult<u32> {
    name.parse::<u32>().map_err(|_| Error::invalid_arg(format!("unknown group '{name}': numeric gid required")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_apply_scheduled_registers_module() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleStore::load(dir.path()).unwrap();
        store.install_module("ietf-interfaces", 2024, "module ietf-interfaces { }".into(), vec!["if-mib".into()], None).unwrap();
        assert!(store.installed("ietf-interfaces").is_none());
        store.apply_scheduled(&PermissiveSchemaProvider).unwrap();
        let entry = store.installed("ietf-interfaces").unwrap();
        assert_eq!(entry.revision, 2024);
        assert_eq!(entry.enabled_features, vec!["if-mib".to_string()]);
    }

    #[test]
    fn remove_blocked_by_inverse_deps() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleStore::load(dir.path()).unwrap();
        store.install_module("m", 1, "module m {}".into(), vec![], None).unwrap();
        store.apply_scheduled(&PermissiveSchemaProvider).unwrap();
        {
            let mut modules = store.modules.write();
            modules.get_mut("m").unwrap().inverse_data_deps.push("other".into());
        }
        assert!(store.remove_module("m").is_err());
    }

    #[test]
    fn failed_revalidation_leaves_schedule_in_place() {
        struct Rejecting;
        impl SchemaProvider for Rejecting {
            fn dependencies_satisfied(&self, _deps: &[String]) -> bool {
                true
            }
            fn revalidate_data(&self, _module: &str, _yang_text: &str) -> StoreResult<()> {
                Err(Error::validation_failed("nope"))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleStore::load(dir.path()).unwrap();
        store.install_module("m", 1, "module m {}".into(), vec![], None).unwrap();
        store.apply_scheduled(&Rejecting).unwrap();
        assert!(store.installed("m").is_none());
        assert_eq!(store.scheduled.read().len(), 1);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ModuleStore::load(dir.path()).unwrap();
            store.install_module("m", 1, "module m {}".into(), vec![], None).unwrap();
            store.apply_scheduled(&PermissiveSchemaProvider).unwrap();
        }
        let reloaded = ModuleStore::load(dir.path()).unwrap();
        assert!(reloaded.installed("m").is_some());
    }
}
