//! Per-connection rate limit on forced device list refreshes.
//!
//! Only applies while at least two clients are connected: a lone client may
//! refresh as often as it likes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::connections::ConnectionRegistry;

#[derive(Debug, Default)]
struct State {
    last: Option<Instant>,
    frozen: bool,
}

pub struct Cooldown {
    duration: Duration,
    state: Mutex<State>,
    connections: Arc<ConnectionRegistry>,
}

impl Cooldown {
    pub fn new(duration: Duration, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            duration,
            state: Mutex::new(State::default()),
            connections,
        }
    }

    fn active(&self) -> bool {
        self.connections.len() >= 2
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_blocked(&self) -> bool {
        if !self.active() {
            return false;
        }
        let state = self.state();
        state.frozen
            || state
                .last
                .is_some_and(|last| last.elapsed() < self.duration)
    }

    /// Begin a cooldown window now. Also clears a freeze.
    pub fn start(&self) {
        let active = self.active();
        let mut state = self.state();
        state.frozen = false;
        if active {
            state.last = Some(Instant::now());
        }
    }

    /// Block until [`unlock`](Self::unlock) or [`start`](Self::start).
    pub fn freeze(&self) {
        if !self.active() {
            return;
        }
        self.state().frozen = true;
    }

    pub fn unlock(&self) {
        let mut state = self.state();
        state.frozen = false;
        state.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionId;

    fn registry_with(n: usize) -> Arc<ConnectionRegistry> {
        let registry = Arc::new(ConnectionRegistry::new());
        for _ in 0..n {
            registry.add(ConnectionId::next());
        }
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_connection_never_blocked() {
        let cooldown = Cooldown::new(Duration::from_secs(2), registry_with(1));

        cooldown.start();
        assert!(!cooldown.is_blocked());
        cooldown.freeze();
        assert!(!cooldown.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_until_duration_elapses() {
        let cooldown = Cooldown::new(Duration::from_secs(2), registry_with(2));
        assert!(!cooldown.is_blocked());

        cooldown.start();
        assert!(cooldown.is_blocked());

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(cooldown.is_blocked());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cooldown.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_clears_window() {
        let cooldown = Cooldown::new(Duration::from_secs(2), registry_with(3));

        cooldown.start();
        cooldown.unlock();
        assert!(!cooldown.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_holds_until_start() {
        let cooldown = Cooldown::new(Duration::from_secs(2), registry_with(2));

        cooldown.freeze();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cooldown.is_blocked());

        cooldown.start();
        assert!(cooldown.is_blocked());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cooldown.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_client_leaving_lifts_block() {
        let registry = registry_with(1);
        let other = ConnectionId::next();
        registry.add(other);

        let cooldown = Cooldown::new(Duration::from_secs(2), registry.clone());
        cooldown.start();
        assert!(cooldown.is_blocked());

        registry.remove(other);
        assert!(!cooldown.is_blocked());
    }
}
