//! Coalesces concurrent async requests under a string key so publish and
//! schema registration don't race themselves (§4.6).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum InFlightError {
    #[error("operation rejected: client is cleaning up")]
    CleaningUp,
}

enum Slot<T> {
    Pending(broadcast::Sender<T>),
}

/// Map from key to a pending task's broadcast sender; callers that arrive
/// while a task is in flight subscribe to the same broadcast instead of
/// starting their own.
pub struct InFlightMap<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    cleaning_up: Mutex<bool>,
}

impl<T: Clone + Send + 'static> Default for InFlightMap<T> {
    fn default() -> Self {
        InFlightMap {
            slots: Mutex::new(HashMap::new()),
            cleaning_up: Mutex::new(false),
        }
    }
}

impl<T: Clone + Send + 'static> InFlightMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `factory` for `key` unless a task is already pending, in which
    /// case wait on that one instead. The entry is removed once the winning
    /// task completes, regardless of outcome, so a later call after failure
    /// starts a fresh attempt.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        factory: F,
    ) -> Result<T, InFlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send,
    {
        if *self.cleaning_up.lock().unwrap() {
            return Err(InFlightError::CleaningUp);
        }

        let mut receiver = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(key) {
                Some(Slot::Pending(tx)) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    slots.insert(key.to_owned(), Slot::Pending(tx.clone()));
                    drop(slots);

                    let key_owned = key.to_owned();
                    let fut = factory();
                    // The winner drives the factory future to completion and
                    // broadcasts the result to anyone who joined in the meantime.
                    let result = self.run_and_retire(key_owned, tx, fut).await;
                    return Ok(result);
                }
            }
        };

        Ok(receiver
            .recv()
            .await
            .expect("sender outlives all receivers while task is pending"))
    }

    async fn run_and_retire<Fut>(&self, key: String, tx: broadcast::Sender<T>, fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let result = fut.await;
        self.slots.lock().unwrap().remove(&key);
        let _ = tx.send(result.clone());
        result
    }

    /// Refuse all future `get_or_create` calls with [`InFlightError::CleaningUp`].
    /// Tasks already in flight are left to finish.
    pub fn begin_teardown(&self) {
        *self.cleaning_up.lock().unwrap() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_callers_share_one_task() {
        let map = Arc::new(InFlightMap::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let map = map.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                map.get_or_create("publish:/t", || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        42u32
                    }
                })
                .await
                .unwrap()
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_is_removed_after_completion_allowing_retry() {
        let map = InFlightMap::<u32>::new();
        let first = map.get_or_create("k", || async { 1u32 }).await.unwrap();
        assert_eq!(first, 1);
        let second = map.get_or_create("k", || async { 2u32 }).await.unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn teardown_rejects_new_requests() {
        let map = InFlightMap::<u32>::new();
        map.begin_teardown();
        let result = map.get_or_create("k", || async { 1u32 }).await;
        assert_eq!(result, Err(InFlightError::CleaningUp));
    }
}
