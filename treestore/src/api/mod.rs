// SPDX-License-Identifier: AGPL-3.0-only

//! The public API veneer (spec.md §6 "Public API surface"). [`Repository`]
//! is the facade a caller actually holds: it owns the shared-memory main
//! region, the lock manager, the module metadata store, and the
//! subscription registry, and wires them together into the connection →
//! session → data/module-admin/subscribe operation set spec.md §6 names.
//!
//! Schema lookup (an explicit Non-goal: no YANG parser, spec.md §1) is
//! delegated to a caller-supplied [`SchemaResolver`] the same way
//! [`crate::module::SchemaProvider`] and `event`'s structural xpath filter
//! stand in for the rest of the missing schema engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::edit::apply_edit;
use crate::error::{Error, ErrorData, StoreResult};
use crate::event;
use crate::lock::LockManager;
use crate::module::{ModuleStore, SchemaProvider};
use crate::session::{Connection, Originator as SessionOriginator, Session};
use crate::shm::{self, MainRegion};
use crate::store;
use crate::subscription::{
    Channel, EventHandler, NewSubscription, Originator, ProviderType, Subscription, SubscriptionFlags,
    SubscriptionRegistry,
};
use crate::sync::Deadline;
use crate::tree::{InsertKind, Meta, NodeId, NodeKind, Operation, Origin, SchemaRef, Tree};

/// Resolves a module's root schema nodes by name; nested children are then
/// found by walking [`crate::tree::SchemaNode::child`], so this is the only
/// schema entry point a caller needs to supply.
pub trait SchemaResolver: Send + Sync {
    fn resolve_root(&self, module: &str, name: &str) -> Option<SchemaRef>;
}

/// One step of a data path: a plain node, or a list item identified by its
/// key leaves' values (spec.md §3 invariant 1: every list item's identity
/// is its key-leaf tuple).
pub enum PathStep<'a> {
    Node(&'a str),
    ListItem { name: &'a str, keys: &'a [(&'a str, &'a str)] },
}

impl PathStep<'_> {
    fn name(&self) -> &str {
        match self {
            PathStep::Node(n) => n,
            PathStep::ListItem { name, .. } => name,
        }
    }
}

/// The facade spec.md §6 describes: one per repository installation,
/// shared across every connection (spec.md §5 "global mutable state").
pub struct Repository {
    config: Config,
    repository_path: PathBuf,
    main_region: Mutex<MainRegion>,
    lock_manager: LockManager,
    module_store: ModuleStore,
    registry: Arc<SubscriptionRegistry>,
    schema: Arc<dyn SchemaResolver>,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    datastores: RwLock<HashMap<(String, String), Arc<Mutex<(u32, Tree)>>>>,
    content_id: AtomicU32,
}

impl Repository {
    pub fn open(config: Config, schema: Arc<dyn SchemaResolver>) -> StoreResult<Self> {
        let repository_path = config.repository_path();
        let main_region = MainRegion::open_or_create(&shm::main_region_path(&repository_path))?;
        let lock_manager = LockManager::new(&repository_path)?;
        let module_store = ModuleStore::load(&repository_path)?;
        Ok(Self {
            config,
            repository_path,
            main_region: Mutex::new(main_region),
            lock_manager,
            module_store,
            registry: Arc::new(SubscriptionRegistry::new()),
            schema,
            connections: RwLock::new(HashMap::new()),
            datastores: RwLock::new(HashMap::new()),
            content_id: AtomicU32::new(0),
        })
    }

    fn lock_deadline(&self) -> Deadline {
        Deadline::after(self.config.lock_timeout())
    }

    // ---- Connection (spec.md §6 "Connection") ----------------------------

    pub fn connect(&self) -> StoreResult<Arc<Connection>> {
        let id = self.main_region.lock().next_connection_id();
        let conn = Arc::new(Connection::new(id));
        self.connections.write().insert(id, conn.clone());
        Ok(conn)
    }

    pub fn disconnect(&self, connection_id: u64) -> StoreResult<()> {
        self.connections
            .write()
            .remove(&connection_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("connection {connection_id} not found")))
    }

    /// A content-version counter bumped on every successful `apply_changes`
    /// (spec.md §6 "`get_content_id(conn) -> u32`" — change detection, not
    /// addressed per module since the public surface takes only `conn`).
    pub fn get_content_id(&self, _connection: &Connection) -> u32 {
        self.content_id.load(Ordering::Acquire)
    }

    // ---- Session (spec.md §6 "Session") -----------------------------------

    pub fn session_start(&self, connection: &Connection, datastore: &str) -> StoreResult<Arc<Session>> {
        let id = self.main_region.lock().next_session_id();
        Ok(connection.start_session(id, datastore))
    }

    pub fn session_stop(&self, connection: &Connection, session_id: u64) -> StoreResult<()> {
        connection.stop_session(session_id)
    }

    pub fn switch_ds(&self, session: &Session, datastore: &str) {
        session.switch_ds(datastore);
    }

    pub fn set_originator(&self, session: &Session, name: Option<String>, data: Option<Vec<u8>>) {
        session.set_originator(name, data);
    }

    pub fn push_error_data(&self, session: &Session, data: ErrorData) {
        session.push_error_data(data);
    }

    // ---- Data (spec.md §6 "Data") ------------------------------------------

    fn resolve_root(&self, module: &str, name: &str) -> Option<SchemaRef> {
        self.schema.resolve_root(module, name)
    }

    fn datastore_slot(&self, module: &str, datastore: &str) -> StoreResult<Arc<Mutex<(u32, Tree)>>> {
        let key = (module.to_string(), datastore.to_string());
        if let Some(slot) = self.datastores.read().get(&key) {
            return Ok(slot.clone());
        }
        let mut w = self.datastores.write();
        if let Some(slot) = w.get(&key) {
            return Ok(slot.clone());
        }
        let resolver = |m: &str, n: &str| self.resolve_root(m, n);
        let loaded = store::file::read_datastore(&self.repository_path, module, datastore, resolver)?;
        let (revision, tree) = loaded.unwrap_or_else(|| (0, Tree::new()));
        let slot = Arc::new(Mutex::new((revision, tree)));
        w.insert(key, slot.clone());
        Ok(slot)
    }

    fn navigate(
        &self,
        tree: &Tree,
        module: &str,
        path: &[PathStep<'_>],
    ) -> StoreResult<Option<NodeId>> {
        let mut siblings = tree.roots.clone();
        let mut schema: Option<SchemaRef> = None;
        let mut found = None;
        for step in path {
            let child_schema = match &schema {
                Some(parent) => parent.child(step.name()).cloned(),
                None => self.resolve_root(module, step.name()),
            }
            .ok_or_else(|| Error::not_found(format!("unknown schema node '{}'", step.name())))?;

            found = siblings.iter().copied().find(|&id| {
                let node = tree.get(id);
                if !node.schema.identity_eq(&child_schema) {
                    return false;
                }
                match step {
                    PathStep::ListItem { keys, .. } => keys.iter().all(|(key_name, key_value)| {
                        node.children().iter().any(|&c| {
                            let cn = tree.get(c);
                            cn.schema.name.as_ref() == *key_name && cn.value() == Some(*key_value)
                        })
                    }),
                    PathStep::Node(_) => true,
                }
            });
            match found {
                Some(id) => {
                    siblings = tree.get(id).children().to_vec();
                    schema = Some(child_schema);
                }
                None => return Ok(None),
            }
        }
        Ok(found)
    }

    /// Retrieves a cloned copy of the subtree at `path` (spec.md §6
    /// "`get_subtree(sess, path, timeout) -> tree?`"). `None` means no such
    /// node exists.
    pub fn get_subtree(&self, session: &Session, module: &str, path: &[PathStep<'_>]) -> StoreResult<Option<Tree>> {
        let datastore = session.datastore.lock().clone();
        let locks = self.lock_manager.module_datastore(module, &datastore);
        let _guard = locks.data.read(self.lock_deadline())?;
        let slot = self.datastore_slot(module, &datastore)?;
        let (_, tree) = &*slot.lock();
        match self.navigate(tree, module, path)? {
            None => Ok(None),
            Some(node) => {
                let mut out = Tree::new();
                let cloned = tree.deep_clone_into(node, &mut out, false);
                out.attach_last(None, cloned);
                Ok(Some(out))
            }
        }
    }

    /// As [`Self::get_subtree`], but clips descendants past `max_depth`
    /// (spec.md §6 "`get_data(sess, xpath, max_depth, timeout) -> tree?`").
    /// The crude structural path used here in place of real xpath mirrors
    /// `event::diff_matches_xpath`'s own Non-goal stand-in.
    pub fn get_data(
        &self,
        session: &Session,
        module: &str,
        path: &[PathStep<'_>],
        max_depth: usize,
    ) -> StoreResult<Option<Tree>> {
        let Some(full) = self.get_subtree(session, module, path)? else {
            return Ok(None);
        };
        let mut out = Tree::new();
        let root = full.roots[0];
        let clipped = clone_clipped(&full, root, &mut out, max_depth);
        out.roots = vec![clipped];
        Ok(Some(out))
    }

    fn edit_navigate_or_create(
        &self,
        edit: &mut Tree,
        module: &str,
        path: &[PathStep<'_>],
    ) -> StoreResult<NodeId> {
        let mut parent: Option<NodeId> = None;
        let mut schema: Option<SchemaRef> = None;
        let mut node = None;
        for step in path {
            let child_schema = match &schema {
                Some(p) => p.child(step.name()).cloned(),
                None => self.resolve_root(module, step.name()),
            }
            .ok_or_else(|| Error::not_found(format!("unknown schema node '{}'", step.name())))?;

            let siblings = match parent {
                Some(p) => edit.get(p).children().to_vec(),
                None => edit.roots.clone(),
            };
            let existing = siblings.iter().copied().find(|&id| {
                let n = edit.get(id);
                if !n.schema.identity_eq(&child_schema) {
                    return false;
                }
                match step {
                    PathStep::ListItem { keys, .. } => keys.iter().all(|(key_name, key_value)| {
                        n.children().iter().any(|&c| {
                            let cn = edit.get(c);
                            cn.schema.name.as_ref() == *key_name && cn.value() == Some(*key_value)
                        })
                    }),
                    PathStep::Node(_) => true,
                }
            });

            let id = match existing {
                Some(id) => id,
                None => {
                    let wants_value = child_schema.kind.is_terminal() || matches!(child_schema.kind, NodeKind::LeafList { .. });
                    let value = if wants_value { Some("") } else { None };
                    let new_id = edit.create_node(child_schema.clone(), value)?;
                    edit.attach_last(parent, new_id);
                    if let PathStep::ListItem { keys, .. } = step {
                        for (key_name, key_value) in *keys {
                            let key_schema = child_schema
                                .child(key_name)
                                .ok_or_else(|| Error::internal(format!("list '{}' missing declared key schema", step.name())))?
                                .clone();
                            let key_node = edit.create_node(key_schema, Some(key_value))?;
                            edit.attach_last(Some(new_id), key_node);
                        }
                    }
                    new_id
                }
            };
            parent = Some(id);
            schema = Some(child_schema);
            node = Some(id);
        }
        node.ok_or_else(|| Error::invalid_arg("path must contain at least one step"))
    }

    /// Stages a leaf (or list-item) write in the session's pending edit
    /// tree (spec.md §6 "`set_item(sess, path, value, opts)`"); takes
    /// effect only once `apply_changes` succeeds.
    pub fn set_item(&self, session: &Session, module: &str, path: &[PathStep<'_>], value: Option<&str>) -> StoreResult<()> {
        let datastore = session.datastore.lock().clone();
        let mut edit = session.edit_for(&datastore);
        let node = self.edit_navigate_or_create(&mut edit, module, path)?;
        if let Some(v) = value {
            edit.get_mut(node).set_value(Some(v.into()));
        }
        edit.set_meta(node, Meta::Operation(Operation::Replace));
        Ok(())
    }

    /// Stages a delete (spec.md §6 "`delete_item(sess, path, opts)`").
    pub fn delete_item(&self, session: &Session, module: &str, path: &[PathStep<'_>]) -> StoreResult<()> {
        let datastore = session.datastore.lock().clone();
        let mut edit = session.edit_for(&datastore);
        let node = self.edit_navigate_or_create(&mut edit, module, path)?;
        edit.set_meta(node, Meta::Operation(Operation::Delete));
        Ok(())
    }

    /// Stages a user-ordered reposition (spec.md §6 "`move_item(sess, path,
    /// position, anchor, opts)`"). `anchor_predicate` is required for
    /// `Before`/`After` and ignored otherwise (spec.md §4.B "Insert
    /// semantics").
    pub fn move_item(
        &self,
        session: &Session,
        module: &str,
        path: &[PathStep<'_>],
        position: InsertKind,
        anchor_predicate: Option<&str>,
    ) -> StoreResult<()> {
        let datastore = session.datastore.lock().clone();
        let mut edit = session.edit_for(&datastore);
        let node = self.edit_navigate_or_create(&mut edit, module, path)?;
        edit.set_meta(node, Meta::Operation(Operation::Replace));
        edit.set_meta(node, Meta::Insert(position));
        if let Some(pred) = anchor_predicate {
            edit.set_meta(node, Meta::Key(pred.into()));
        }
        Ok(())
    }

    /// Discards the session's pending edit tree for its current datastore
    /// (spec.md §6 "`discard_changes(sess)`").
    pub fn discard_changes(&self, session: &Session) {
        let datastore = session.datastore.lock().clone();
        session.discard_edit(&datastore);
    }

    /// No-op schema validation hook (spec.md §6 "`validate(sess, module?,
    /// timeout)`"): real `must`/`when`/key constraint checking belongs to
    /// the schema engine this crate does not implement (Non-goal, spec.md
    /// §1); this exists so callers that expect the operation can call it.
    pub fn validate(&self, _session: &Session, _module: Option<&str>) -> StoreResult<()> {
        Ok(())
    }

    /// Applies the session's pending edit for its current datastore against
    /// the stored tree, runs the four-phase event protocol, and persists the
    /// result (spec.md §6 "`apply_changes(sess, timeout)`", §4.G).
    pub fn apply_changes(&self, session: &Session) -> StoreResult<Tree> {
        let datastore = session.datastore.lock().clone();
        let module = self.module_for_edit(session, &datastore)?;
        let locks = self.lock_manager.module_datastore(&module, &datastore);
        let deadline = self.lock_deadline();
        // Readers (`get_subtree` etc.) stay unblocked through the update and
        // change phases; the data lock is only escalated to exclusive right
        // before the datastore file is rewritten below (spec.md §4.E).
        let guard = locks.data.upgradable_read(deadline)?;

        let slot = self.datastore_slot(&module, &datastore)?;
        let mut locked = slot.lock();
        let (revision, ds) = &mut *locked;

        let edit_tree = session.edit_for(&datastore);
        let edit_roots = edit_tree.roots.clone();
        let mut diff = Tree::new();
        let originator = session_originator_to_subscription(&session.originator.lock());

        let outcome = apply_edit(ds, &edit_tree, &edit_roots, &mut diff, Origin::Unknown);
        drop(edit_tree);
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                session.record_error(&e, None);
                return Err(e);
            }
        };
        if !outcome.changed {
            session.discard_edit(&datastore);
            return Ok(diff);
        }

        let event_id = self.main_region.lock().next_subscription_id();
        let (diff, invoked) =
            match event::run_publish_change_phase(&self.registry, &module, &datastore, ds, diff, event_id, &originator) {
                Ok(r) => r,
                Err(e) => {
                    session.record_error(&e, None);
                    return Err(e);
                }
            };

        // PUB_CHANGE -> STORE -> PUB_DONE (spec.md §4.G): persistence happens
        // strictly between the change phase above and the done dispatch
        // below, and only now do writers need to be excluded.
        let write_guard = locks.data.upgrade(guard, deadline)?;
        *revision += 1;
        let write_result = store::file::write_datastore(&self.repository_path, &module, &datastore, *revision, ds);
        drop(write_guard);
        write_result?;

        event::finish_publish(&invoked, &module, &datastore, &diff, event_id, &originator);
        session.discard_edit(&datastore);
        self.content_id.fetch_add(1, Ordering::AcqRel);
        Ok(diff)
    }

    /// The edit algebra operates per module; a session's pending edit tree
    /// may span only one module per `apply_changes` call in this
    /// implementation (multi-module atomic commits are not modeled, the
    /// same simplification `LockManager::canonical_order` exists to bound).
    fn module_for_edit(&self, session: &Session, datastore: &str) -> StoreResult<String> {
        let edit = session.edit_for(datastore);
        let root = edit
            .roots
            .first()
            .ok_or_else(|| Error::invalid_arg("no pending changes to apply"))?;
        Ok(edit.get(*root).schema.module.to_string())
    }

    // ---- Module admin (spec.md §6 "Module admin") --------------------------

    pub fn install_module(&self, module: &str, revision: u32, yang_text: String, features: Vec<String>) -> StoreResult<()> {
        self.module_store.install_module(module, revision, yang_text, features, None)
    }

    pub fn remove_module(&self, module: &str) -> StoreResult<()> {
        self.module_store.remove_module(module)
    }

    pub fn update_module(&self, module: &str, revision: u32, yang_text: String) -> StoreResult<()> {
        self.module_store.update_module(module, revision, yang_text)
    }

    pub fn enable_feature(&self, module: &str, feature: &str) -> StoreResult<()> {
        self.module_store.enable_feature(module, feature, true)
    }

    pub fn disable_feature(&self, module: &str, feature: &str) -> StoreResult<()> {
        self.module_store.enable_feature(module, feature, false)
    }

    pub fn list_installed_modules(&self) -> Vec<crate::module::ModuleEntry> {
        self.module_store.list_installed()
    }

    pub fn set_replay_support(&self, module: &str, on: bool) -> StoreResult<()> {
        self.module_store.set_replay_support(module, on)
    }

    pub fn set_module_access(&self, module: &str, owner: Option<String>, group: Option<String>, mode: Option<u32>) -> StoreResult<()> {
        self.module_store.set_module_access(&self.repository_path, module, owner, group, mode)
    }

    /// Applies every scheduled module-admin operation (spec.md §4.I "At
    /// connection time the first connection processes scheduled
    /// operations"); callers typically run this once right after
    /// [`Self::connect`].
    pub fn apply_scheduled_modules(&self, provider: &dyn SchemaProvider) -> StoreResult<()> {
        self.module_store.apply_scheduled(provider)
    }

    // ---- Subscribe (spec.md §6 "Subscribe") --------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_change(
        &self,
        session: &Session,
        module: &str,
        xpath: Option<String>,
        handler: Arc<dyn EventHandler>,
        priority: u32,
        update: bool,
    ) -> Arc<Subscription> {
        let event_pipe_id = self.main_region.lock().next_event_pipe_id();
        self.registry.add(NewSubscription {
            channel: Channel::Change,
            module: module.to_string(),
            xpath,
            priority,
            owning_connection: session.connection_id,
            owning_session: session.id,
            event_pipe_id,
            flags: SubscriptionFlags { update, ..Default::default() },
            handler,
            ..Default::default()
        })
    }

    pub fn subscribe_oper_get(&self, session: &Session, module: &str, path: String, handler: Arc<dyn EventHandler>) -> Arc<Subscription> {
        let event_pipe_id = self.main_region.lock().next_event_pipe_id();
        self.registry.add(NewSubscription {
            channel: Channel::OperGet,
            module: module.to_string(),
            path: Some(path),
            owning_connection: session.connection_id,
            owning_session: session.id,
            event_pipe_id,
            provider_type: Some(ProviderType::State),
            handler,
            ..Default::default()
        })
    }

    pub fn subscribe_rpc(&self, session: &Session, path: &str, handler: Arc<dyn EventHandler>, priority: u32) -> Arc<Subscription> {
        let event_pipe_id = self.main_region.lock().next_event_pipe_id();
        self.registry.add(NewSubscription {
            channel: Channel::Rpc,
            module: path.to_string(),
            priority,
            owning_connection: session.connection_id,
            owning_session: session.id,
            event_pipe_id,
            handler,
            ..Default::default()
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_notification(
        &self,
        session: &Session,
        module: &str,
        xpath: Option<String>,
        start: Option<std::time::SystemTime>,
        stop: Option<std::time::SystemTime>,
        handler: Arc<dyn EventHandler>,
    ) -> Arc<Subscription> {
        let event_pipe_id = self.main_region.lock().next_event_pipe_id();
        self.registry.add(NewSubscription {
            channel: Channel::Notification,
            module: module.to_string(),
            xpath,
            notif_start: start,
            notif_stop: stop,
            owning_connection: session.connection_id,
            owning_session: session.id,
            event_pipe_id,
            handler,
            ..Default::default()
        })
    }

    pub fn unsubscribe(&self, subscription_id: u64) -> StoreResult<()> {
        self.registry.remove(subscription_id)
    }

    pub fn subscription_suspend(&self, subscription_id: u64) -> StoreResult<()> {
        self.registry.suspend(subscription_id)
    }

    pub fn subscription_resume(&self, subscription_id: u64) -> StoreResult<()> {
        self.registry.resume(subscription_id)
    }

    /// Wakes whatever event pipe the subscription is parked on (spec.md §6
    /// "`process_events(sub, sess?)`"); in this single-process
    /// implementation events are already delivered synchronously inside
    /// `apply_changes`, so this mostly exists for API completeness with the
    /// cross-process design spec.md §4.D describes.
    pub fn process_events(&self, subscription_id: u64) -> StoreResult<()> {
        let sub = self
            .registry
            .get(subscription_id)
            .ok_or_else(|| Error::not_found(format!("subscription {subscription_id} not found")))?;
        self.registry.wake(sub.event_pipe_id);
        Ok(())
    }
}

fn session_originator_to_subscription(o: &SessionOriginator) -> Originator {
    Originator { name: o.name.clone(), data: o.data.clone() }
}

fn clone_clipped(src: &Tree, node: NodeId, dest: &mut Tree, max_depth: usize) -> NodeId {
    let n = src.get(node);
    let id = dest.create_node(n.schema.clone(), n.value()).expect("clipped clone preserves schema/value invariants");
    dest.get_mut(id).set_default(n.is_default());
    if max_depth > 0 {
        for &child in n.children() {
            let cloned = clone_clipped(src, child, dest, max_depth - 1);
            dest.attach_last(Some(id), cloned);
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NodeKind, SchemaBuilder};

    struct TestSchema {
        interfaces: SchemaRef,
    }

    impl TestSchema {
        fn new() -> Self {
            let name = SchemaBuilder::new("m", "name", NodeKind::Leaf).build();
            let enabled = SchemaBuilder::new("m", "enabled", NodeKind::Leaf).default("true").build();
            let interface = SchemaBuilder::new("m", "interface", NodeKind::List { user_ordered: false })
                .keys(&["name"])
                .child(name)
                .child(enabled)
                .build();
            let interfaces = SchemaBuilder::new("m", "interfaces", NodeKind::Container { presence: false })
                .child(interface)
                .build();
            Self { interfaces }
        }
    }

    impl SchemaResolver for TestSchema {
        fn resolve_root(&self, module: &str, name: &str) -> Option<SchemaRef> {
            (module == "m" && name == "interfaces").then(|| self.interfaces.clone())
        }
    }

    fn repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.repository.path = Some(dir.path().to_path_buf());
        let repo = Repository::open(cfg, Arc::new(TestSchema::new())).unwrap();
        (dir, repo)
    }

    #[test]
    fn set_item_then_apply_changes_creates_list_item() {
        let (_dir, repo) = repo();
        let conn = repo.connect().unwrap();
        let sess = repo.session_start(&conn, "running").unwrap();

        let path = [
            PathStep::Node("interfaces"),
            PathStep::ListItem { name: "interface", keys: &[("name", "eth0")] },
            PathStep::Node("enabled"),
        ];
        repo.set_item(&sess, "m", &path, Some("false")).unwrap();
        let diff = repo.apply_changes(&sess).unwrap();
        assert_eq!(diff.roots.len(), 1);

        let get_path = [PathStep::Node("interfaces")];
        let fetched = repo.get_subtree(&sess, "m", &get_path).unwrap().unwrap();
        assert_eq!(fetched.get(fetched.roots[0]).children().len(), 1);
    }

    #[test]
    fn apply_changes_persists_across_repository_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.repository.path = Some(dir.path().to_path_buf());
        {
            let repo = Repository::open(cfg, Arc::new(TestSchema::new())).unwrap();
            let conn = repo.connect().unwrap();
            let sess = repo.session_start(&conn, "running").unwrap();
            let path = [
                PathStep::Node("interfaces"),
                PathStep::ListItem { name: "interface", keys: &[("name", "eth0")] },
                PathStep::Node("enabled"),
            ];
            repo.set_item(&sess, "m", &path, Some("false")).unwrap();
            repo.apply_changes(&sess).unwrap();
        }

        let mut cfg = Config::default();
        cfg.repository.path = Some(dir.path().to_path_buf());
        let repo = Repository::open(cfg, Arc::new(TestSchema::new())).unwrap();
        let conn = repo.connect().unwrap();
        let sess = repo.session_start(&conn, "running").unwrap();
        let fetched = repo.get_subtree(&sess, "m", &[PathStep::Node("interfaces")]).unwrap().unwrap();
        assert_eq!(fetched.get(fetched.roots[0]).children().len(), 1);
    }

    #[test]
    fn discard_changes_drops_pending_edit() {
        let (_dir, repo) = repo();
        let conn = repo.connect().unwrap();
        let sess = repo.session_start(&conn, "running").unwrap();
        let path = [
            PathStep::Node("interfaces"),
            PathStep::ListItem { name: "interface", keys: &[("name", "eth0")] },
        ];
        repo.set_item(&sess, "m", &path, None).unwrap();
        repo.discard_changes(&sess);
        assert_eq!(sess.edit_for("running").roots.len(), 0);
    }
}
