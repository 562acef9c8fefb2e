// SPDX-License-Identifier: AGPL-3.0-only

//! Component H: connection and session lifecycle (spec.md §4.H). A
//! connection owns the process's end of shared memory plus a session
//! list; a session tracks one client's target datastore, pending edit
//! tree, originator metadata, and last error. Ids are sourced from the
//! main region's monotonic counters (spec.md §4.H "all ids are monotonic
//! within the main region ... tolerate id reuse of long-disconnected
//! consumers").

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{Error, ErrorData, StoreResult};
use crate::tree::Tree;

#[derive(Debug, Clone, Default)]
pub struct Originator {
    pub name: Option<String>,
    pub data: Option<Vec<u8>>,
}

/// The structured error record stashed on a session at the public API
/// boundary (spec.md §7 "a structured error record ... is stored on the
/// session and returned to the caller; subsequent `get_error` retrieves it").
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub message: String,
    pub path: Option<String>,
    pub error_data: Option<ErrorData>,
}

impl ErrorRecord {
    pub fn from_error(err: &Error, path: Option<String>) -> Self {
        Self {
            kind: err.kind_name(),
            message: err.to_string(),
            path,
            error_data: err.error_data().map(|d| d.to_vec()),
        }
    }
}

/// A record pushed through the notification-buffer thread to be written
/// to the replay store (spec.md §4.H "notification buffer thread").
pub struct NotificationRecord {
    pub module: String,
    pub timestamp: SystemTime,
    pub payload: Vec<u8>,
}

/// Coalesces outbound notifications into a producer-consumer queue
/// drained by a dedicated writer thread (spec.md §4.H). `stop` signals
/// the thread and joins it so every already-queued record is flushed
/// before the session finishes tearing down.
pub struct NotificationBuffer {
    tx: Option<mpsc::Sender<NotificationRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationBuffer {
    pub fn spawn(mut sink: impl FnMut(NotificationRecord) + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel::<NotificationRecord>();
        let handle = std::thread::Builder::new()
            .name("treestore-notif-buffer".into())
            .spawn(move || {
                while let Ok(record) = rx.recv() {
                    sink(record);
                }
            })
            .expect("failed to spawn notification buffer thread");
        Self { tx: Some(tx), handle: Some(handle) }
    }

    pub fn push(&self, record: NotificationRecord) -> StoreResult<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| Error::internal("notification buffer already stopped"))?
            .send(record)
            .map_err(|_| Error::internal("notification buffer thread is no longer receiving"))
    }
}

impl Drop for NotificationBuffer {
    fn drop(&mut self) {
        // Drop the sender first to close the channel, so the writer
        // thread's `recv` loop sees end-of-stream after flushing every
        // record already queued, then join to guarantee the flush
        // finished before the session finishes tearing down.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Fields populated only while a session is acting as an event session
/// delivering a callback (spec.md §4.H "event-time fields when acting as
/// an event session").
#[derive(Debug, Clone, Default)]
pub struct EventTime {
    pub event_id: Option<u64>,
    pub phase: Option<crate::subscription::Phase>,
}

pub struct Session {
    pub id: u64,
    pub connection_id: u64,
    pub datastore: Mutex<String>,
    /// One pending edit tree per datastore name the session has touched
    /// (spec.md §4.H "pending edit tree per datastore").
    pending_edits: Mutex<HashMap<String, Tree>>,
    pub originator: Mutex<Originator>,
    last_error: Mutex<Option<ErrorRecord>>,
    pub event_time: Mutex<EventTime>,
    pub notifications: Option<NotificationBuffer>,
}

impl Session {
    fn new(id: u64, connection_id: u64, datastore: &str) -> Self {
        Self {
            id,
            connection_id,
            datastore: Mutex::new(datastore.to_string()),
            pending_edits: Mutex::new(HashMap::new()),
            originator: Mutex::new(Originator::default()),
            last_error: Mutex::new(None),
            event_time: Mutex::new(EventTime::default()),
            notifications: None,
        }
    }

    pub fn switch_ds(&self, datastore: &str) {
        *self.datastore.lock() = datastore.to_string();
    }

    pub fn set_originator(&self, name: Option<String>, data: Option<Vec<u8>>) {
        *self.originator.lock() = Originator { name, data };
    }

    /// Starts (or returns the existing) pending edit tree for `datastore`
    /// (spec.md §3 "edit tree ... built incrementally by a client session").
    pub fn edit_for<'a>(&'a self, datastore: &str) -> parking_lot::MappedMutexGuard<'a, Tree> {
        let mut edits = self.pending_edits.lock();
        edits.entry(datastore.to_string()).or_insert_with(Tree::new);
        parking_lot::MutexGuard::map(edits, |m| m.get_mut(datastore).unwrap())
    }

    pub fn discard_edit(&self, datastore: &str) {
        self.pending_edits.lock().remove(datastore);
    }

    pub fn record_error(&self, err: &Error, path: Option<String>) {
        *self.last_error.lock() = Some(ErrorRecord::from_error(err, path));
    }

    pub fn push_error_data(&self, data: ErrorData) {
        let mut last = self.last_error.lock();
        if let Some(record) = last.as_mut() {
            record.error_data = Some(data);
        }
    }

    pub fn get_error(&self) -> Option<ErrorRecord> {
        self.last_error.lock().clone()
    }
}

/// Owns a process's end of shared memory plus its session list, guarded
/// by one mutex the way spec.md §4.H describes ("a per-connection mutex
/// protecting those lists").
pub struct Connection {
    pub id: u64,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl Connection {
    pub fn new(id: u64) -> Self {
        Self { id, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn start_session(&self, session_id: u64, datastore: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(session_id, self.id, datastore));
        self.sessions.lock().insert(session_id, session.clone());
        session
    }

    pub fn stop_session(&self, session_id: u64) -> StoreResult<()> {
        self.sessions
            .lock()
            .remove(&session_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("session {session_id} not found on this connection")))
    }

    pub fn session(&self, session_id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn session_pending_edit_persists_across_calls() {
        use crate::tree::{NodeKind, SchemaBuilder};
        let conn = Connection::new(1);
        let sess = conn.start_session(1, "running");
        {
            let mut edit = sess.edit_for("running");
            let schema = SchemaBuilder::new("m", "x", NodeKind::Leaf).build();
            let n = edit.create_node(schema, Some("1")).unwrap();
            edit.attach_last(None, n);
        }
        assert_eq!(sess.edit_for("running").roots.len(), 1);
        sess.discard_edit("running");
        assert_eq!(sess.edit_for("running").roots.len(), 0);
    }

    #[test]
    fn error_record_round_trips_through_push_error_data() {
        let conn = Connection::new(1);
        let sess = conn.start_session(1, "running");
        sess.record_error(&Error::not_found("x"), Some("/m:x".into()));
        sess.push_error_data(vec![1, 2, 3]);
        let err = sess.get_error().unwrap();
        assert_eq!(err.kind, "NOT_FOUND");
        assert_eq!(err.error_data, Some(vec![1, 2, 3]));
    }

    #[test]
    fn notification_buffer_flushes_queued_records_on_drop() {
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let buf = NotificationBuffer::spawn(move |_record| {
            received_clone.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..5 {
            buf.push(NotificationRecord { module: "m".into(), timestamp: SystemTime::now(), payload: vec![i] }).unwrap();
        }
        drop(buf);
        assert_eq!(received.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn connection_stop_session_is_idempotent_error() {
        let conn = Connection::new(1);
        conn.start_session(1, "running");
        assert!(conn.stop_session(1).is_ok());
        assert!(conn.stop_session(1).is_err());
    }
}
