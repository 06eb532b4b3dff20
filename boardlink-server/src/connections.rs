//! Live client connections.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-unique id of one websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counted set of live connections.
///
/// The count is always the size of the set, so adding and removing can't
/// drift apart.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: ConnectionId) -> bool {
        self.lock().insert(id)
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ConnectionId>> {
        // A panic while holding this lock leaves the set itself consistent.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_follows_membership() {
        let registry = ConnectionRegistry::new();
        let a = ConnectionId::next();
        let b = ConnectionId::next();

        assert!(registry.add(a));
        assert!(registry.add(b));
        assert!(!registry.add(b));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }
}
