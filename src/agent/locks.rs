use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-conversation run exclusion. At most one orchestration run may be
/// active for a given conversation; a second caller waits for the first to
/// finish rather than interleaving turns.
#[derive(Default)]
pub struct ConversationLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one conversation, waiting if a run is in flight.
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // Entries whose only holder is the map itself have no guard and
            // no waiter; drop them so the map tracks active conversations
            // rather than every id ever seen
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_conversation_runs_serialize() {
        let locks = Arc::new(ConversationLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("conv-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_conversations_do_not_block() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("conv-a").await;
        // Must not deadlock
        let _b = locks.acquire("conv-b").await;
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = ConversationLocks::new();
        for i in 0..100 {
            let guard = locks.acquire(&format!("conv-{}", i)).await;
            drop(guard);
        }

        // The next acquire sweeps everything idle; only it remains tracked
        let guard = locks.acquire("conv-live").await;
        assert_eq!(locks.tracked().await, 1);
        drop(guard);
    }

    #[tokio::test]
    async fn held_entries_survive_pruning() {
        let locks = ConversationLocks::new();
        let held = locks.acquire("conv-held").await;
        let other = locks.acquire("conv-other").await;
        drop(other);

        let _fresh = locks.acquire("conv-fresh").await;
        // conv-held is still guarded, conv-other was swept
        assert_eq!(locks.tracked().await, 2);
        drop(held);
    }
}
