// SPDX-License-Identifier: AGPL-3.0-only

//! Component F: the subscription registry (spec.md §4.F). In a real
//! deployment each record here is mirrored into the extended region's
//! (module, channel) linked list so other processes can see it; this type
//! is the in-process view every session consults, backed by the same
//! `parking_lot::RwLock` discipline the lock manager uses elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::error::{Error, StoreResult};

mod handler;

pub use handler::{
    CallbackOutcome, ChangeEvent, EventHandler, NoopHandler, NotificationEvent, Originator, Phase, RpcEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Change,
    OperGet,
    Rpc,
    Notification,
}

/// The schema-atom classification of an operational-get subscription's
/// selected xpath (spec.md §4.F "provider type").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Config,
    State,
    Mixed,
    None,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionFlags {
    pub done_only: bool,
    pub passive: bool,
    pub update: bool,
    pub oper_merge: bool,
}

pub struct Subscription {
    pub id: u64,
    pub channel: Channel,
    pub module: String,
    pub datastore: Option<String>,
    pub path: Option<String>,
    pub xpath: Option<String>,
    pub priority: u32,
    pub owning_connection: u64,
    pub owning_session: u64,
    pub event_pipe_id: u64,
    pub flags: SubscriptionFlags,
    pub provider_type: Option<ProviderType>,
    pub notif_start: Option<SystemTime>,
    pub notif_stop: Option<SystemTime>,
    /// The capability set this subscriber implements (spec.md §9). Held
    /// directly on the record rather than in a side table, matching
    /// "callbacks as objects ... held in the subscription record".
    pub handler: Arc<dyn EventHandler>,
    suspended: AtomicBool,
    filtered_out: AtomicU64,
}

impl Subscription {
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn filtered_out_count(&self) -> u64 {
        self.filtered_out.load(Ordering::Relaxed)
    }

    pub fn record_filtered_out(&self) {
        self.filtered_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Notification replay applies when the subscription has a past
    /// `start_time` (spec.md §4.G "replay supplied from the persistent
    /// store when a subscription has a past `start_time`").
    pub fn wants_replay(&self) -> bool {
        matches!(self.notif_start, Some(t) if t <= SystemTime::now())
    }
}

pub struct NewSubscription {
    pub channel: Channel,
    pub module: String,
    pub datastore: Option<String>,
    pub path: Option<String>,
    pub xpath: Option<String>,
    pub priority: u32,
    pub owning_connection: u64,
    pub owning_session: u64,
    pub event_pipe_id: u64,
    pub flags: SubscriptionFlags,
    pub provider_type: Option<ProviderType>,
    pub notif_start: Option<SystemTime>,
    pub notif_stop: Option<SystemTime>,
    pub handler: Arc<dyn EventHandler>,
}

impl Default for NewSubscription {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            module: String::new(),
            datastore: None,
            path: None,
            xpath: None,
            priority: 0,
            owning_connection: 0,
            owning_session: 0,
            event_pipe_id: 0,
            flags: SubscriptionFlags::default(),
            provider_type: None,
            notif_start: None,
            notif_stop: None,
            handler: Arc::new(NoopHandler),
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Change
    }
}

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Registers, lists, and removes subscriptions, and routes event-pipe
/// wake-ups (spec.md §4.F). `next_id` mirrors the main region's monotonic
/// subscription-id counter; callers that do own a [`crate::shm::MainRegion`]
/// should source ids from `next_subscription_id` instead.
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    subs: RwLock<HashMap<u64, Arc<Subscription>>>,
    event_pipes: RwLock<HashMap<u64, Waker>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subs: RwLock::new(HashMap::new()),
            event_pipes: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_event_pipe(&self, id: u64, wake: Waker) {
        self.event_pipes.write().insert(id, wake);
    }

    pub fn unregister_event_pipe(&self, id: u64) {
        self.event_pipes.write().remove(&id);
    }

    pub fn wake(&self, event_pipe_id: u64) {
        if let Some(w) = self.event_pipes.read().get(&event_pipe_id) {
            w();
        }
    }

    /// Adds a subscription (spec.md §4.F "Add/remove operations acquire
    /// the channel's write lock, splice into/out of the module's linked
    /// list ... and wake the owning event pipe").
    pub fn add(&self, new: NewSubscription) -> Arc<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let sub = Arc::new(Subscription {
            id,
            channel: new.channel,
            module: new.module,
            datastore: new.datastore,
            path: new.path,
            xpath: new.xpath,
            priority: new.priority,
            owning_connection: new.owning_connection,
            owning_session: new.owning_session,
            event_pipe_id: new.event_pipe_id,
            flags: new.flags,
            provider_type: new.provider_type,
            notif_start: new.notif_start,
            notif_stop: new.notif_stop,
            handler: new.handler,
            suspended: AtomicBool::new(false),
            filtered_out: AtomicU64::new(0),
        });
        self.subs.write().insert(id, sub.clone());
        self.wake(sub.event_pipe_id);
        sub
    }

    pub fn remove(&self, id: u64) -> StoreResult<()> {
        self.subs.write().remove(&id).map(|_| ()).ok_or_else(|| Error::not_found(format!("subscription {id} not found")))
    }

    pub fn suspend(&self, id: u64) -> StoreResult<()> {
        let subs = self.subs.read();
        let sub = subs.get(&id).ok_or_else(|| Error::not_found(format!("subscription {id} not found")))?;
        sub.suspended.store(true, Ordering::Release);
        Ok(())
    }

    pub fn resume(&self, id: u64) -> StoreResult<()> {
        let subs = self.subs.read();
        let sub = subs.get(&id).ok_or_else(|| Error::not_found(format!("subscription {id} not found")))?;
        sub.suspended.store(false, Ordering::Release);
        Ok(())
    }

    /// Live (non-suspended) subscriptions for `(module, channel)`, in
    /// priority descending order — the order the event protocol's update
    /// and change phases deliver in (spec.md §4.G).
    pub fn list_for(&self, module: &str, channel: Channel) -> Vec<Arc<Subscription>> {
        let mut out: Vec<Arc<Subscription>> = self
            .subs
            .read()
            .values()
            .filter(|s| s.module == module && s.channel == channel && !s.is_suspended())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out
    }

    pub fn get(&self, id: u64) -> Option<Arc<Subscription>> {
        self.subs.read().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_sub(module: &str, priority: u32, update: bool) -> NewSubscription {
        NewSubscription {
            channel: Channel::Change,
            module: module.to_string(),
            priority,
            flags: SubscriptionFlags { update, ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn list_for_orders_by_priority_descending() {
        let reg = SubscriptionRegistry::new();
        reg.add(new_sub("m", 1, false));
        reg.add(new_sub("m", 5, false));
        reg.add(new_sub("m", 3, false));
        let listed = reg.list_for("m", Channel::Change);
        let prios: Vec<u32> = listed.iter().map(|s| s.priority).collect();
        assert_eq!(prios, vec![5, 3, 1]);
    }

    #[test]
    fn suspended_subscriptions_are_excluded() {
        let reg = SubscriptionRegistry::new();
        let sub = reg.add(new_sub("m", 1, false));
        reg.suspend(sub.id).unwrap();
        assert!(reg.list_for("m", Channel::Change).is_empty());
        reg.resume(sub.id).unwrap();
        assert_eq!(reg.list_for("m", Channel::Change).len(), 1);
    }
}
