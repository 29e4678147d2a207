//! Append-only listener lists.
//!
//! Listeners are added at any time and never removed. Notification iterates over
//! a snapshot, so a listener added while another notification is running is
//! picked up by the next event and never disturbs the one in flight.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

pub struct ListenerList<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Append a listener. There is no way to remove it afterwards.
    pub fn add(&self, listener: Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Current listeners, in registration order
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerList<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.len())
            .finish()
    }
}
