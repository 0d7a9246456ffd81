//! Per-key single-flight work queue.
//!
//! Jobs pushed under the same key run one after another in push order on a
//! dedicated worker task; jobs under different keys run concurrently. A
//! worker is spawned lazily on the first push for a key and exits once its
//! key is removed and its backlog is drained.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

type Job = BoxFuture<'static, ()>;

pub struct KeyedQueue<K> {
    workers: Mutex<HashMap<K, mpsc::UnboundedSender<Job>>>,
}

impl<K> Default for KeyedQueue<K> {
    fn default() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<K, mpsc::UnboundedSender<Job>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job` behind every job already pushed under `key`.
    pub fn push<F>(&self, key: K, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut job: Job = Box::pin(job);
        let mut workers = self.workers();

        if let Some(tx) = workers.get(&key) {
            match tx.send(job) {
                Ok(()) => return,
                // Worker died (a job panicked); start a fresh one.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        // The receiver is alive: it was moved into the task just spawned.
        let _ = tx.send(job);
        workers.insert(key, tx);
    }

    /// Retire the worker for `key` after its backlog drains.
    pub fn remove(&self, key: &K) {
        self.workers().remove(key);
    }

    /// Retire every worker after their backlogs drain.
    pub fn clear(&self) {
        self.workers().clear();
    }

    /// Number of keys with a live worker.
    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers().is_empty()
    }
}
