// SPDX-License-Identifier: AGPL-3.0-only

//! Component G: the event-delivery state machine (spec.md §4.G). Each
//! subscription carries its own `Arc<dyn EventHandler>` (spec.md §9,
//! concretized in `subscription::handler`), so dispatch here is just
//! walking the registry in priority order and invoking whichever
//! capability the current phase calls for.

use std::collections::HashSet;
use std::sync::Arc;

use crate::diff::merge_diffs;
use crate::edit::apply_edit;
use crate::error::{Error, StoreResult};
use crate::subscription::{CallbackOutcome, Channel, ChangeEvent, NotificationEvent, Originator, Phase, RpcEvent};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::sync::Deadline;
use crate::tree::{Origin, Tree};

/// Subscribers invoked during the change phase, carried forward so the
/// `done` phase (spec.md §4.G) can be dispatched to exactly the same set
/// once the caller has finished whatever must happen in between (§4.G
/// `PUB_CHANGE → STORE → PUB_DONE` ordering — persistence is the caller's
/// job, not this module's).
pub type InvokedSubscribers = Vec<Arc<Subscription>>;

/// Crude structural xpath filter: a subscription's filter passes if some
/// diff node's path is prefixed by (or prefixes) the filter xpath. A real
/// xpath evaluator is out of scope the same way schema parsing is (spec.md
/// Non-goals); this is the pragmatic stand-in "per-subscriber filtering"
/// needs without one.
fn diff_matches_xpath(diff: &Tree, xpath: &str) -> bool {
    fn walk(t: &Tree, node: crate::tree::NodeId, xpath: &str) -> bool {
        let p = t.path(node, true);
        if p.starts_with(xpath) || xpath.starts_with(&p) {
            return true;
        }
        t.get(node).children().iter().any(|&c| walk(t, c, xpath))
    }
    diff.roots.iter().any(|&r| walk(diff, r, xpath))
}

fn passes_filter(sub: &Subscription, diff: &Tree) -> bool {
    match &sub.xpath {
        Some(x) => diff_matches_xpath(diff, x),
        None => true,
    }
}

fn callback_error(message: String, format_tag: Option<String>, data: Option<Vec<u8>>) -> Error {
    let mut err = Error::callback_failed(message);
    if let Some(d) = data {
        err = err.with_error_data(d);
    }
    let _ = format_tag;
    err
}

/// Runs the update phase, applying any refinement edits and folding their
/// diffs into `diff` (spec.md §4.G "Update phase"). On failure, publication
/// halts immediately and no abort is sent (the update event has no
/// committed state yet).
fn run_update_phase(
    registry: &SubscriptionRegistry,
    module: &str,
    datastore: &str,
    ds: &mut Tree,
    diff: &mut Tree,
    event_id: u64,
    originator: &Originator,
) -> StoreResult<()> {
    let subs = registry
        .list_for(module, Channel::Change)
        .into_iter()
        .filter(|s| s.flags.update)
        .collect::<Vec<_>>();
    for sub in subs {
        if !passes_filter(&sub, diff) {
            sub.record_filtered_out();
            continue;
        }
        let event = ChangeEvent { id: event_id, module, datastore, diff, phase: Phase::Update, originator };
        match sub.handler.receive_change_event(&event) {
            CallbackOutcome::Ok => {}
            CallbackOutcome::Refine(edit) => {
                let mut refinement_diff = Tree::new();
                let edit_roots = edit.roots.clone();
                apply_edit(ds, &edit, &edit_roots, &mut refinement_diff, Origin::Unknown)?;
                merge_diffs(diff, &refinement_diff)?;
            }
            CallbackOutcome::Fail { message, format_tag, data } => {
                return Err(callback_error(message, format_tag, data));
            }
        }
    }
    Ok(())
}

/// Runs the change phase: subscribers without `update`, grouped by
/// priority and invoked high-to-low; a failure aborts already-invoked
/// subscribers with the same event id and fails the transaction (spec.md
/// §4.G "Change phase"). On success, returns the subscribers invoked here
/// so the caller can dispatch `done` to the same set once persistence has
/// happened — this function never sends `done` itself.
fn run_change_phase(
    registry: &SubscriptionRegistry,
    module: &str,
    datastore: &str,
    diff: &Tree,
    event_id: u64,
    originator: &Originator,
) -> StoreResult<InvokedSubscribers> {
    let subs = registry
        .list_for(module, Channel::Change)
        .into_iter()
        .filter(|s| !s.flags.update)
        .collect::<Vec<_>>();

    let mut invoked = Vec::new();
    let mut failure = None;

    for sub in &subs {
        if !passes_filter(sub, diff) {
            sub.record_filtered_out();
            continue;
        }
        invoked.push(sub.clone());
        let event = ChangeEvent { id: event_id, module, datastore, diff, phase: Phase::Change, originator };
        match sub.handler.receive_change_event(&event) {
            CallbackOutcome::Ok | CallbackOutcome::Refine(_) => {}
            CallbackOutcome::Fail { message, format_tag, data } => {
                failure = Some(callback_error(message, format_tag, data));
                break;
            }
        }
    }

    if let Some(err) = failure {
        for sub in &invoked {
            let event = ChangeEvent { id: event_id, module, datastore, diff, phase: Phase::Abort, originator };
            let _ = sub.handler.receive_change_event(&event);
        }
        return Err(err);
    }

    Ok(invoked)
}

/// Dispatches `done` to exactly the subscribers `run_change_phase` invoked
/// (spec.md §4.G, invariant 6: "done" never reaches a subscriber without a
/// prior "change" for the same event id). Called only after the caller has
/// durably stored the transaction (§4.G `PUB_CHANGE → STORE → PUB_DONE`).
fn run_done_phase(
    invoked: &InvokedSubscribers,
    module: &str,
    datastore: &str,
    diff: &Tree,
    event_id: u64,
    originator: &Originator,
) {
    for sub in invoked {
        let event = ChangeEvent { id: event_id, module, datastore, diff, phase: Phase::Done, originator };
        let _ = sub.handler.receive_change_event(&event);
    }
}

/// Runs the update and change phases of a publish (spec.md §4.G). `ds` is
/// the working copy the update phase's refinements mutate; `diff` starts
/// as the diff `apply_changes` produced and is returned revised with any
/// refinements folded in, together with the subscribers the change phase
/// invoked. The caller MUST persist the transaction and then call
/// [`finish_publish`] — `done` is not sent here (§4.G ordering:
/// `PUB_CHANGE → STORE → PUB_DONE`).
pub fn run_publish_change_phase(
    registry: &SubscriptionRegistry,
    module: &str,
    datastore: &str,
    ds: &mut Tree,
    mut diff: Tree,
    event_id: u64,
    originator: &Originator,
) -> StoreResult<(Tree, InvokedSubscribers)> {
    run_update_phase(registry, module, datastore, ds, &mut diff, event_id, originator)?;
    let invoked = run_change_phase(registry, module, datastore, &diff, event_id, originator)?;
    Ok((diff, invoked))
}

/// Completes a publish started by [`run_publish_change_phase`], sending
/// `done` to the subscribers it returned. Call this only after the
/// transaction has been durably stored.
pub fn finish_publish(
    invoked: &InvokedSubscribers,
    module: &str,
    datastore: &str,
    diff: &Tree,
    event_id: u64,
    originator: &Originator,
) {
    run_done_phase(invoked, module, datastore, diff, event_id, originator);
}

/// RPC delivery: request/reply to exactly one subscriber, the
/// highest-priority live one (spec.md §4.G "RPC ... request/reply to
/// exactly one subscriber chosen by priority").
pub fn deliver_rpc(
    registry: &SubscriptionRegistry,
    path: &str,
    input: &Tree,
    event_id: u64,
    originator: &Originator,
    _deadline: Deadline,
) -> StoreResult<Tree> {
    let sub = registry
        .list_for(path, Channel::Rpc)
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found(format!("no rpc subscriber registered for '{path}'")))?;
    let event = RpcEvent { id: event_id, path, input, originator };
    sub.handler.receive_rpc(&event)
}

/// Notification delivery: fire-and-forget to all live subscribers whose
/// time window includes now (spec.md §4.G "notifications are fire-and-
/// forget to all live subscribers whose time window includes `now`").
pub fn deliver_notification(
    registry: &SubscriptionRegistry,
    module: &str,
    notification: &Tree,
    event_id: u64,
    originator: &Originator,
) {
    let now = std::time::SystemTime::now();
    let mut notified: HashSet<u64> = HashSet::new();
    for sub in registry.list_for(module, Channel::Notification) {
        if notified.contains(&sub.id) {
            continue;
        }
        let in_window = sub.notif_start.map(|s| s <= now).unwrap_or(true)
            && sub.notif_stop.map(|e| now <= e).unwrap_or(true);
        if !in_window || !passes_filter(&sub, notification) {
            continue;
        }
        let event = NotificationEvent { id: event_id, module, notification, originator };
        sub.handler.receive_notification(&event);
        notified.insert(sub.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{EventHandler, NewSubscription};
    use crate::tree::{NodeKind, SchemaBuilder};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct RecordingHandler {
        phases_seen: Mutex<Vec<Phase>>,
        fail_on_change: AtomicBool,
    }

    impl EventHandler for RecordingHandler {
        fn receive_change_event(&self, event: &ChangeEvent<'_>) -> CallbackOutcome {
            self.phases_seen.lock().unwrap().push(event.phase);
            if event.phase == Phase::Change && self.fail_on_change.load(Ordering::Relaxed) {
                CallbackOutcome::Fail { message: "boom".into(), format_tag: None, data: None }
            } else {
                CallbackOutcome::Ok
            }
        }
    }

    fn leaf_diff() -> Tree {
        let mut diff = Tree::new();
        let schema = SchemaBuilder::new("m", "x", NodeKind::Leaf).build();
        let n = diff.create_node(schema, Some("1")).unwrap();
        diff.set_meta(n, crate::tree::Meta::Operation(crate::tree::Operation::Create));
        diff.attach_last(None, n);
        diff
    }

    #[test]
    fn change_phase_aborts_invoked_subscribers_on_failure() {
        let registry = SubscriptionRegistry::new();
        let h1 = Arc::new(RecordingHandler { phases_seen: Mutex::new(Vec::new()), fail_on_change: AtomicBool::new(false) });
        let h2 = Arc::new(RecordingHandler { phases_seen: Mutex::new(Vec::new()), fail_on_change: AtomicBool::new(true) });
        registry.add(NewSubscription { channel: Channel::Change, module: "m".into(), priority: 10, handler: h1.clone(), ..Default::default() });
        registry.add(NewSubscription { channel: Channel::Change, module: "m".into(), priority: 5, handler: h2.clone(), ..Default::default() });

        let mut ds = Tree::new();
        let result = run_publish_change_phase(&registry, "m", "running", &mut ds, leaf_diff(), 1, &Originator::default());
        assert!(result.is_err());
        assert_eq!(*h1.phases_seen.lock().unwrap(), vec![Phase::Change, Phase::Abort]);
        assert_eq!(*h2.phases_seen.lock().unwrap(), vec![Phase::Change]);
    }

    #[test]
    fn change_phase_succeeds_and_sends_done_only_after_finish_publish() {
        let registry = SubscriptionRegistry::new();
        let h1 = Arc::new(RecordingHandler { phases_seen: Mutex::new(Vec::new()), fail_on_change: AtomicBool::new(false) });
        registry.add(NewSubscription { channel: Channel::Change, module: "m".into(), priority: 10, handler: h1.clone(), ..Default::default() });

        let mut ds = Tree::new();
        let (diff, invoked) =
            run_publish_change_phase(&registry, "m", "running", &mut ds, leaf_diff(), 1, &Originator::default()).unwrap();
        // `done` must not have been sent yet: the caller hasn't "stored" anything.
        assert_eq!(*h1.phases_seen.lock().unwrap(), vec![Phase::Change]);

        finish_publish(&invoked, "m", "running", &diff, 1, &Originator::default());
        assert_eq!(*h1.phases_seen.lock().unwrap(), vec![Phase::Change, Phase::Done]);
    }

    #[test]
    fn update_phase_refinement_is_applied_before_change_phase() {
        let registry = SubscriptionRegistry::new();
        struct Refiner;
        impl EventHandler for Refiner {
            fn receive_change_event(&self, event: &ChangeEvent<'_>) -> CallbackOutcome {
                if event.phase != Phase::Update {
                    return CallbackOutcome::Ok;
                }
                let mut edit = Tree::new();
                let schema = SchemaBuilder::new("m", "y", NodeKind::Leaf).build();
                let n = edit.create_node(schema, Some("2")).unwrap();
                edit.set_meta(n, crate::tree::Meta::Operation(crate::tree::Operation::Create));
                edit.attach_last(None, n);
                CallbackOutcome::Refine(edit)
            }
        }
        registry.add(NewSubscription {
            channel: Channel::Change,
            module: "m".into(),
            priority: 1,
            flags: crate::subscription::SubscriptionFlags { update: true, ..Default::default() },
            handler: Arc::new(Refiner),
            ..Default::default()
        });
        let mut ds = Tree::new();
        let (diff, invoked) =
            run_publish_change_phase(&registry, "m", "running", &mut ds, leaf_diff(), 1, &Originator::default()).unwrap();
        assert_eq!(diff.roots.len(), 2);
        finish_publish(&invoked, "m", "running", &diff, 1, &Originator::default());
    }
}
