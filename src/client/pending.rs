//! Correlation of IQ requests with their responses.
//!
//! Every in-flight request owns exactly one table entry until it is
//! resolved by the reader, times out, or the session tears down. Waiters
//! are woken through oneshot channels; callbacks run on their own task so
//! a slow callback never stalls the reader.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::stanza::Iq;

/// Process-local counter; ids stay unique across sessions because each
/// session mixes in a fresh salt.
static COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct IdGenerator {
    salt: std::sync::RwLock<String>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            salt: std::sync::RwLock::new(fresh_salt()),
        }
    }

    /// New salt for a new session.
    pub fn regenerate(&self) {
        *self.salt.write().expect("id salt lock") = fresh_salt();
    }

    pub fn next(&self) -> String {
        let salt = self.salt.read().expect("id salt lock");
        format!("{}-{}", salt, COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

fn fresh_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

type IqCallback = Box<dyn FnOnce(String, Iq) + Send + Sync>;

enum Pending {
    Waiter(oneshot::Sender<Iq>),
    Callback(IqCallback),
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<String, Pending>,
}

impl PendingTable {
    pub fn insert_waiter(&self, id: &str) -> oneshot::Receiver<Iq> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id.to_string(), Pending::Waiter(tx));
        rx
    }

    pub fn insert_callback(&self, id: &str, callback: IqCallback) {
        self.entries
            .insert(id.to_string(), Pending::Callback(callback));
    }

    /// Hands a response to whoever waits for it. Returns false for
    /// orphans (no entry under that id).
    pub fn resolve(&self, response: Iq) -> bool {
        let Some((id, pending)) = self.entries.remove(&response.id) else {
            return false;
        };

        match pending {
            Pending::Waiter(tx) => {
                // The waiter may have timed out concurrently; that is fine.
                if tx.send(response).is_err() {
                    debug!("IQ waiter for {id} gone before response arrived");
                }
            }
            Pending::Callback(callback) => {
                // Off the reader: a slow callback must not stall dispatch.
                tokio::spawn(async move { callback(id, response) });
            }
        }
        true
    }

    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Session teardown: drop every entry. Waiters observe their channel
    /// closing (on top of the shared cancellation signal).
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
