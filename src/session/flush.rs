//! Display-state write-back
//!
//! Released records are written to the store by a single flusher task, in
//! release order. The ledger keeps each released profile until its write
//! lands, and for a while after, so a reconnect never starts from an older
//! copy than the one its previous session left behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::Metrics;
use crate::store::{Profile, Store};

/// How long a written entry stays visible to reconnects
pub const RETAIN_WRITTEN: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    seq: u64,
    profile: Profile,
    written_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct LedgerState {
    seq: u64,
    entries: HashMap<String, Entry>,
}

/// Released display state, newest per player
#[derive(Debug, Default)]
pub struct FlushLedger {
    state: Mutex<LedgerState>,
}

impl FlushLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of the latest release. Read it before loading a profile from
    /// the store; anything released after it may be newer than that read.
    pub fn mark(&self) -> u64 {
        self.state.lock().seq
    }

    /// Latest released profile, whether or not it has been written
    pub fn latest(&self, uuid: &str) -> Option<Profile> {
        self.state
            .lock()
            .entries
            .get(uuid)
            .map(|entry| entry.profile.clone())
    }

    /// Profile released after `mark`, if any
    pub fn released_since(&self, uuid: &str, mark: u64) -> Option<Profile> {
        self.state
            .lock()
            .entries
            .get(uuid)
            .filter(|entry| entry.seq > mark)
            .map(|entry| entry.profile.clone())
    }

    /// Number of releases not yet written
    pub fn unwritten(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.written_at.is_none())
            .count()
    }

    pub(crate) fn record(&self, uuid: &str, profile: Profile) -> u64 {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state.entries.retain(|_, entry| {
            entry
                .written_at
                .map_or(true, |at| at.elapsed() < RETAIN_WRITTEN)
        });
        state.entries.insert(
            uuid.to_string(),
            Entry {
                seq,
                profile,
                written_at: None,
            },
        );
        seq
    }

    fn written(&self, uuid: &str, seq: u64) {
        if let Some(entry) = self.state.lock().entries.get_mut(uuid) {
            if entry.seq == seq {
                entry.written_at = Some(Instant::now());
            }
        }
    }
}

#[derive(Debug)]
struct Flush {
    uuid: String,
    seq: u64,
    profile: Profile,
}

/// Ordered writer of released display state
pub struct Flusher {
    queue: mpsc::UnboundedSender<Flush>,
    ledger: Arc<FlushLedger>,
    task: JoinHandle<()>,
}

impl Flusher {
    pub fn spawn(store: Arc<dyn Store>, ledger: Arc<FlushLedger>, metrics: Arc<Metrics>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Flush>();
        let writer_ledger = ledger.clone();
        let task = tokio::spawn(async move {
            while let Some(flush) = rx.recv().await {
                match store.save_profile(&flush.uuid, &flush.profile).await {
                    Ok(()) => writer_ledger.written(&flush.uuid, flush.seq),
                    // Stays unwritten in the ledger; a reconnect still picks it up
                    Err(e) => {
                        Metrics::incr(&metrics.profile_flush_failures);
                        tracing::warn!("Failed to flush display state for {}: {}", flush.uuid, e);
                    }
                }
            }
        });
        Self {
            queue,
            ledger,
            task,
        }
    }

    pub fn release(&self, uuid: String, profile: Profile) {
        let seq = self.ledger.record(&uuid, profile.clone());
        if self.queue.send(Flush { uuid, seq, profile }).is_err() {
            tracing::error!("Flusher stopped; display state kept in memory only");
        }
    }

    /// Write everything queued so far, then stop
    pub async fn finish(self) {
        drop(self.queue);
        if let Err(e) = self.task.await {
            tracing::error!("Flusher panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockStore, StoreError};
    use std::sync::atomic::Ordering;

    fn sprite(name: &str, index: i32) -> Profile {
        Profile {
            sprite_name: name.to_string(),
            sprite_index: index,
            ..Profile::default()
        }
    }

    #[test]
    fn test_released_since_mark() {
        let ledger = FlushLedger::new();
        let before = ledger.mark();
        ledger.record("a", sprite("kid", 1));
        let after = ledger.mark();

        assert_eq!(ledger.released_since("a", before), Some(sprite("kid", 1)));
        assert_eq!(ledger.released_since("a", after), None);
        assert_eq!(ledger.latest("a"), Some(sprite("kid", 1)));
        assert_eq!(ledger.latest("b"), None);
    }

    #[test]
    fn test_newest_release_wins() {
        let ledger = FlushLedger::new();
        let first = ledger.record("a", sprite("kid", 1));
        ledger.record("a", sprite("hero", 3));

        // A late write of the older release must not mark the newer one written
        ledger.written("a", first);
        assert_eq!(ledger.unwritten(), 1);
        assert_eq!(ledger.latest("a"), Some(sprite("hero", 3)));
    }

    #[tokio::test]
    async fn test_finish_writes_in_release_order() {
        let store = Arc::new(MemoryStore::new());
        let uuid = store.register_guest("10.2.2.2".parse().unwrap());
        let ledger = Arc::new(FlushLedger::new());
        let flusher = Flusher::spawn(store.clone(), ledger.clone(), Arc::new(Metrics::new()));

        flusher.release(uuid.clone(), sprite("kid", 1));
        flusher.release(uuid.clone(), sprite("hero", 3));
        flusher.finish().await;

        assert_eq!(store.load_profile(&uuid).await.unwrap(), sprite("hero", 3));
        assert_eq!(ledger.unwritten(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_stays_in_ledger() {
        let mut store = MockStore::new();
        store
            .expect_save_profile()
            .returning(|_, _| Err(StoreError::Backend("disk full".to_string())));
        let ledger = Arc::new(FlushLedger::new());
        let metrics = Arc::new(Metrics::new());
        let flusher = Flusher::spawn(Arc::new(store), ledger.clone(), metrics.clone());

        flusher.release("a".to_string(), sprite("hero", 3));
        flusher.finish().await;

        assert_eq!(metrics.profile_flush_failures.load(Ordering::Relaxed), 1);
        assert_eq!(ledger.unwritten(), 1);
        assert_eq!(ledger.latest("a"), Some(sprite("hero", 3)));
    }
}
