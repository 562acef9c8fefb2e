// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests exercising `Repository` end to end: scenarios S5
//! (concurrent applies on disjoint modules) and S6 (update-phase
//! refinement, and its failure path) of spec.md §8, plus a couple of
//! public-API-level checks the per-module unit tests (which already cover
//! S1-S4 against the edit algebra directly) don't reach.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use treestore::config::Config;
use treestore::subscription::{
    CallbackOutcome, ChangeEvent, Channel, EventHandler, NewSubscription, Phase, SubscriptionFlags,
};
use treestore::tree::{NodeKind, SchemaBuilder, SchemaRef, Tree};
use treestore::{PathStep, Repository, SchemaResolver};

struct LeafSchema {
    module: &'static str,
    leaf: SchemaRef,
}

impl LeafSchema {
    fn new(module: &'static str, name: &str) -> Self {
        Self { module, leaf: SchemaBuilder::new(module, name, NodeKind::Leaf).build() }
    }
}

impl SchemaResolver for LeafSchema {
    fn resolve_root(&self, module: &str, name: &str) -> Option<SchemaRef> {
        (module == self.module && name == self.leaf.name.as_ref()).then(|| self.leaf.clone())
    }
}

fn open_repo(dir: &std::path::Path, resolver: Arc<dyn SchemaResolver>) -> Repository {
    let mut cfg = Config::default();
    cfg.repository.path = Some(dir.to_path_buf());
    Repository::open(cfg, resolver).unwrap()
}

#[test]
fn s5_concurrent_applies_on_disjoint_modules_both_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let repo_a = Arc::new(open_repo(dir.path(), Arc::new(LeafSchema::new("a", "x"))));
    let repo_b = Arc::new(open_repo(dir.path(), Arc::new(LeafSchema::new("b", "y"))));

    let ra = repo_a.clone();
    let t1 = std::thread::spawn(move || {
        let conn = ra.connect().unwrap();
        let sess = ra.session_start(&conn, "running").unwrap();
        ra.set_item(&sess, "a", &[PathStep::Node("x")], Some("1")).unwrap();
        ra.apply_changes(&sess).unwrap();
    });

    let rb = repo_b.clone();
    let t2 = std::thread::spawn(move || {
        let conn = rb.connect().unwrap();
        let sess = rb.session_start(&conn, "running").unwrap();
        rb.set_item(&sess, "b", &[PathStep::Node("y")], Some("2")).unwrap();
        rb.apply_changes(&sess).unwrap();
    });

    t1.join().unwrap();
    t2.join().unwrap();

    let conn = repo_a.connect().unwrap();
    let sess = repo_a.session_start(&conn, "running").unwrap();
    let a = repo_a.get_subtree(&sess, "a", &[PathStep::Node("x")]).unwrap().unwrap();
    assert_eq!(a.get(a.roots[0]).value(), Some("1"));

    let conn = repo_b.connect().unwrap();
    let sess = repo_b.session_start(&conn, "running").unwrap();
    let b = repo_b.get_subtree(&sess, "b", &[PathStep::Node("y")]).unwrap().unwrap();
    assert_eq!(b.get(b.roots[0]).value(), Some("2"));
}

struct RefiningHandler {
    extra_leaf: SchemaRef,
}

impl EventHandler for RefiningHandler {
    fn receive_change_event(&self, event: &ChangeEvent<'_>) -> CallbackOutcome {
        if event.phase != Phase::Update {
            return CallbackOutcome::Ok;
        }
        let mut edit = Tree::new();
        let n = edit.create_node(self.extra_leaf.clone(), Some("added")).unwrap();
        edit.set_meta(n, treestore::tree::Meta::Operation(treestore::tree::Operation::Create));
        edit.attach_last(None, n);
        CallbackOutcome::Refine(edit)
    }
}

struct ObservingHandler {
    seen_diff_roots: Arc<Mutex<usize>>,
}

impl EventHandler for ObservingHandler {
    fn receive_change_event(&self, event: &ChangeEvent<'_>) -> CallbackOutcome {
        if event.phase == Phase::Change {
            *self.seen_diff_roots.lock().unwrap() = event.diff.roots.len();
        }
        CallbackOutcome::Ok
    }
}

#[test]
fn s6_update_phase_refinement_is_visible_to_change_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let schema = LeafSchema::new("m", "x");
    let extra = SchemaBuilder::new("m", "extra", NodeKind::Leaf).build();
    let repo = open_repo(dir.path(), Arc::new(schema));

    let conn = repo.connect().unwrap();
    let sess = repo.session_start(&conn, "running").unwrap();

    repo.subscribe_change(
        &sess,
        "m",
        None,
        Arc::new(RefiningHandler { extra_leaf: extra }),
        10,
        true,
    );
    let seen = Arc::new(Mutex::new(0));
    repo.subscribe_change(&sess, "m", None, Arc::new(ObservingHandler { seen_diff_roots: seen.clone() }), 5, false);

    repo.set_item(&sess, "m", &[PathStep::Node("x")], Some("1")).unwrap();
    let diff = repo.apply_changes(&sess).unwrap();

    assert_eq!(diff.roots.len(), 2, "the committed diff should carry the original write plus the refinement");
    assert_eq!(*seen.lock().unwrap(), 2, "the change-phase subscriber should observe the merged diff");
}

struct FailingUpdateHandler;

impl EventHandler for FailingUpdateHandler {
    fn receive_change_event(&self, event: &ChangeEvent<'_>) -> CallbackOutcome {
        if event.phase == Phase::Update {
            CallbackOutcome::Fail { message: "rejected".into(), format_tag: None, data: Some(vec![9, 9]) }
        } else {
            CallbackOutcome::Ok
        }
    }
}

#[test]
fn s6_failed_update_callback_leaves_datastore_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path(), Arc::new(LeafSchema::new("m", "x")));

    let conn = repo.connect().unwrap();
    let sess = repo.session_start(&conn, "running").unwrap();
    repo.subscribe_change(
        &sess,
        "m",
        None,
        Arc::new(FailingUpdateHandler),
        10,
        true,
    );

    repo.set_item(&sess, "m", &[PathStep::Node("x")], Some("1")).unwrap();
    let err = repo.apply_changes(&sess).unwrap_err();
    assert_eq!(err.kind_name(), "CALLBACK_FAILED");
    assert_eq!(err.error_data(), Some(&[9u8, 9][..]));

    let fetched = repo.get_subtree(&sess, "m", &[PathStep::Node("x")]).unwrap();
    assert!(fetched.is_none(), "a failed update-phase callback must leave the datastore untouched");
}

#[test]
fn discard_changes_then_reapply_does_not_resurrect_discarded_edit() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path(), Arc::new(LeafSchema::new("m", "x")));
    let conn = repo.connect().unwrap();
    let sess = repo.session_start(&conn, "running").unwrap();

    repo.set_item(&sess, "m", &[PathStep::Node("x")], Some("discarded")).unwrap();
    repo.discard_changes(&sess);

    repo.set_item(&sess, "m", &[PathStep::Node("x")], Some("kept")).unwrap();
    repo.apply_changes(&sess).unwrap();

    let fetched = repo.get_subtree(&sess, "m", &[PathStep::Node("x")]).unwrap().unwrap();
    assert_eq!(fetched.get(fetched.roots[0]).value(), Some("kept"));
}

#[test]
fn subscription_suspend_excludes_it_from_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path(), Arc::new(LeafSchema::new("m", "x")));
    let conn = repo.connect().unwrap();
    let sess = repo.session_start(&conn, "running").unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    struct CountingHandler(Arc<AtomicUsize>);
    impl EventHandler for CountingHandler {
        fn receive_change_event(&self, _event: &ChangeEvent<'_>) -> CallbackOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            CallbackOutcome::Ok
        }
    }
    let sub = repo.subscribe_change(&sess, "m", None, Arc::new(CountingHandler(invocations.clone())), 1, false);
    repo.subscription_suspend(sub.id).unwrap();

    repo.set_item(&sess, "m", &[PathStep::Node("x")], Some("1")).unwrap();
    repo.apply_changes(&sess).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    repo.subscription_resume(sub.id).unwrap();
    repo.set_item(&sess, "m", &[PathStep::Node("x")], Some("2")).unwrap();
    repo.apply_changes(&sess).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn module_admin_install_is_scheduled_until_applied() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(dir.path(), Arc::new(LeafSchema::new("m", "x")));
    repo.install_module("ietf-interfaces", 2024, "module ietf-interfaces {}".into(), vec!["if-mib".into()]).unwrap();
    assert!(repo.list_installed_modules().is_empty());
    repo.apply_scheduled_modules(&treestore::module::PermissiveSchemaProvider).unwrap();
    let installed = repo.list_installed_modules();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].name, "ietf-interfaces");
    assert_eq!(installed[0].enabled_features, vec!["if-mib".to_string()]);

    // a second install of the same (now-installed) module is rejected up front.
    assert!(repo
        .install_module("ietf-interfaces", 2025, "module ietf-interfaces {}".into(), vec![])
        .is_err());
}

#[allow(dead_code)]
fn unused_subscription_flags_reference() -> SubscriptionFlags {
    // keeps SubscriptionFlags/NewSubscription/Channel imports meaningful if
    // a future test needs to build a `NewSubscription` by hand instead of
    // going through `Repository::subscribe_change`.
    SubscriptionFlags { update: false, ..Default::default() }
}

#[allow(dead_code)]
fn unused_new_subscription_reference() -> NewSubscription {
    NewSubscription { channel: Channel::Change, ..Default::default() }
}
