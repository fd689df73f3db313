//! Per-container operation locks.
//!
//! The first caller for an id becomes the owner and gets a `LockGuard`.
//! Later callers get a `Waiter` that resolves to whatever outcome the owner
//! publishes. Dropping the guard releases the id on every path, including
//! panics and early returns; waiters of an owner that never published see
//! `None`.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

type Slot<T> = watch::Receiver<Option<T>>;

pub struct OperationLocks<T> {
    held: Arc<DashMap<String, Slot<T>>>,
}

impl<T> Default for OperationLocks<T> {
    fn default() -> Self {
        Self {
            held: Arc::new(DashMap::new()),
        }
    }
}

pub enum Acquire<T> {
    Owner(LockGuard<T>),
    Waiter(Waiter<T>),
}

pub struct LockGuard<T> {
    id: String,
    tx: watch::Sender<Option<T>>,
    held: Arc<DashMap<String, Slot<T>>>,
}

pub struct Waiter<T> {
    rx: Slot<T>,
}

impl<T: Clone + Send + Sync> OperationLocks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, id: &str) -> Acquire<T> {
        match self.held.entry(id.to_string()) {
            Entry::Occupied(entry) => Acquire::Waiter(Waiter {
                rx: entry.get().clone(),
            }),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                Acquire::Owner(LockGuard {
                    id: id.to_string(),
                    tx,
                    held: self.held.clone(),
                })
            }
        }
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl<T> LockGuard<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish the outcome to every waiter and release the lock.
    pub fn finish(self, outcome: T) {
        self.tx.send_replace(Some(outcome));
    }
}

impl<T> Drop for LockGuard<T> {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}

impl<T: Clone> Waiter<T> {
    /// Wait for the owner's outcome. `None` if the owner went away without
    /// publishing one.
    pub async fn outcome(mut self) -> Option<T> {
        let published = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|value| (*value).clone());
        match published {
            Ok(outcome) => outcome,
            Err(_) => self.rx.borrow().clone(),
        }
    }
}
