//! Ranking recompute gate
//!
//! A bulk ranking rewrite elsewhere in the system raises a flag while it
//! runs. Writes that feed rankings (event completions) must not interleave
//! with it: they poll the flag and back off until it clears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared "recompute in progress" flag with a poll/backoff wait
#[derive(Debug, Clone)]
pub struct RecomputeGate {
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl RecomputeGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            poll_interval,
        }
    }

    /// Mark a recompute as running until the guard is dropped
    pub fn begin(&self) -> RecomputeGuard {
        self.running.store(true, Ordering::SeqCst);
        RecomputeGuard {
            running: self.running.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep-poll until no recompute is running
    pub async fn wait_idle(&self) {
        while self.is_running() {
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for RecomputeGate {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Clears the recompute flag on drop
#[derive(Debug)]
pub struct RecomputeGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RecomputeGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_clears_flag() {
        let gate = RecomputeGate::default();
        assert!(!gate.is_running());

        let guard = gate.begin();
        assert!(gate.is_running());

        drop(guard);
        assert!(!gate.is_running());
    }

    #[test]
    fn test_wait_idle_ready_when_idle() {
        let gate = RecomputeGate::new(Duration::from_secs(60));
        let mut wait = tokio_test::task::spawn(gate.wait_idle());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_wait_idle_blocks_until_recompute_ends() {
        let gate = RecomputeGate::new(Duration::from_millis(5));
        let guard = gate.begin();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
