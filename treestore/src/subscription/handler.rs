// SPDX-License-Identifier: AGPL-3.0-only

//! The subscriber capability set (spec.md §9 "Subscriber callbacks as
//! objects, not function pointers alone"): a subscription holds one
//! `Arc<dyn EventHandler>`, polymorphic over `{ receive_change_event,
//! receive_rpc, produce_oper, receive_notification }`, so a given
//! subscription only implements the capabilities its channel needs and
//! the rest fall back to the default "not interested" response.

use crate::error::{Error, StoreResult};
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Update,
    Change,
    Done,
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct Originator {
    pub name: Option<String>,
    pub data: Option<Vec<u8>>,
}

pub struct ChangeEvent<'a> {
    pub id: u64,
    pub module: &'a str,
    pub datastore: &'a str,
    pub diff: &'a Tree,
    pub phase: Phase,
    pub originator: &'a Originator,
}

pub struct RpcEvent<'a> {
    pub id: u64,
    pub path: &'a str,
    pub input: &'a Tree,
    pub originator: &'a Originator,
}

pub struct NotificationEvent<'a> {
    pub id: u64,
    pub module: &'a str,
    pub notification: &'a Tree,
    pub originator: &'a Originator,
}

pub enum CallbackOutcome {
    Ok,
    /// Update-phase only: a refinement edit to apply before the change
    /// phase runs (spec.md §4.G "Update phase").
    Refine(Tree),
    Fail { message: String, format_tag: Option<String>, data: Option<Vec<u8>> },
}

pub trait EventHandler: Send + Sync {
    fn receive_change_event(&self, _event: &ChangeEvent<'_>) -> CallbackOutcome {
        CallbackOutcome::Ok
    }
    fn receive_rpc(&self, _event: &RpcEvent<'_>) -> StoreResult<Tree> {
        Err(Error::operation_failed("this subscriber does not implement receive_rpc"))
    }
    fn produce_oper(&self, _path: &str) -> StoreResult<Tree> {
        Err(Error::operation_failed("this subscriber does not implement produce_oper"))
    }
    fn receive_notification(&self, _event: &NotificationEvent<'_>) {}
}

/// The capability-less handler a subscription gets until a real one is
/// supplied; every method keeps the trait's default "not interested".
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
