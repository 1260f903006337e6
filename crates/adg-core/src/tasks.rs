use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Scheduled {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct Registry<K> {
    next_generation: u64,
    live: HashMap<K, Scheduled>,
}

/// Cancellable deferred tasks keyed by identity.
///
/// Scheduling under a key that already has a live task cancels the old one.
/// A task forgets its key when it fires, unless the key was rescheduled in
/// the meantime. The task body must re-validate whatever state it acts on.
#[derive(Debug)]
pub struct DelayedTasks<K> {
    registry: Arc<Mutex<Registry<K>>>,
}

impl<K> Default for DelayedTasks<K> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_generation: 0,
                live: HashMap::new(),
            })),
        }
    }
}

fn lock<K>(registry: &Mutex<Registry<K>>) -> MutexGuard<'_, Registry<K>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Eq + Hash + Clone + Send + 'static> DelayedTasks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let generation = {
            let mut reg = lock(&self.registry);
            reg.next_generation += 1;
            let generation = reg.next_generation;
            let prev = reg.live.insert(
                key.clone(),
                Scheduled {
                    generation,
                    token: token.clone(),
                },
            );
            if let Some(prev) = prev {
                prev.token.cancel();
            }
            generation
        };

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            tokio::select! {
              biased;
              _ = token.cancelled() => {}
              _ = tokio::time::sleep(delay) => {
                  {
                      let mut reg = lock(&registry);
                      if reg.live.get(&key).is_some_and(|s| s.generation == generation) {
                          reg.live.remove(&key);
                      }
                  }
                  task.await;
              }
            }
        });
    }

    /// Cancel the task for `key`. Returns whether one was live.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.registry).live.remove(key) {
            Some(s) => {
                s.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        lock(&self.registry)
            .live
            .get(key)
            .is_some_and(|s| !s.token.is_cancelled())
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).live.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.registry).live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tasks = DelayedTasks::new();
        let h = hits.clone();
        tasks.schedule(1, Duration::from_secs(30), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tasks = DelayedTasks::new();
        let h = hits.clone();
        tasks.schedule("k", Duration::from_secs(5), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tasks.is_scheduled(&"k"));
        assert!(tasks.cancel(&"k"));
        assert!(!tasks.cancel(&"k"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous_task() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tasks = DelayedTasks::new();
        for add in [1, 10] {
            let h = hits.clone();
            tasks.schedule("k", Duration::from_secs(5), async move {
                h.fetch_add(add, Ordering::SeqCst);
            });
        }
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_tasks_forget_their_keys() {
        let tasks = DelayedTasks::new();
        for id in 0..5 {
            tasks.schedule(id, Duration::from_secs(60), async {});
        }
        assert_eq!(tasks.len(), 5);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_task_leaves_the_new_one_cancellable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tasks = DelayedTasks::new();
        tasks.schedule("k", Duration::from_secs(5), async {});
        tokio::time::sleep(Duration::from_secs(4)).await;

        let h = hits.clone();
        tasks.schedule("k", Duration::from_secs(5), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tasks.is_scheduled(&"k"));
        assert!(tasks.cancel(&"k"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(tasks.is_empty());
    }
}
