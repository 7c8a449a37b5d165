use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Unused entries are pruned once the map grows past this.
const PRUNE_THRESHOLD: usize = 1024;

/// Per-item mutexes serializing read-modify-write of one record. Operations
/// on different items never contend.
#[derive(Default)]
pub struct ItemLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ItemLocks {
    pub async fn lock(&self, item_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(item_id.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_item_is_serialized() {
        let locks = Arc::new(ItemLocks::default());
        let guard = locks.lock("X1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("X1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different item is not blocked.
        let _b = locks.lock("X2").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = ItemLocks::default();
        for i in 0..=PRUNE_THRESHOLD {
            drop(locks.lock(&i.to_string()).await);
        }
        let _held = locks.lock("held").await;
        assert!(locks.len() <= 2);
    }
}
