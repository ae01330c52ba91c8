//! The job broker: one priority-ordered index per queue, an
//! allocation set per client, and a wakeup for blocked `get`s.
//!
//! All state sits behind one mutex with short critical sections; the
//! async side never holds it across an await. Waiters arm the
//! [`Notify`] before re-checking, so a `put`, `abort`, `delete`, or
//! disconnect-driven requeue can never slip between the check and the
//! sleep.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;

use tracing::debug;

pub type ClientId = u64;
pub type JobId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub pri: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AbortError {
    #[error("unknown or unallocated job")]
    NoJob,

    #[error("job {0} is allocated to another client")]
    NotOwner(JobId),
}

struct JobEntry {
    queue: String,
    payload: serde_json::Value,
    pri: u64,
    holder: Option<ClientId>,
}

#[derive(Default)]
struct State {
    last_id: JobId,
    jobs: HashMap<JobId, JobEntry>,
    /// Per-queue index ordered by (priority, id); the maximum element
    /// is the next job handed out.
    queues: HashMap<String, BTreeSet<(u64, JobId)>>,
    allocations: HashMap<ClientId, HashSet<JobId>>,
}

#[derive(Default)]
pub struct Broker {
    state: Mutex<State>,
    changed: Notify,
}

impl Broker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a queued job and wakes the waiters. Ids start at 1 and
    /// are never reused.
    pub fn put(&self, queue: &str, payload: serde_json::Value, pri: u64) -> JobId {
        let id = {
            let mut state = self.state.lock();
            state.last_id += 1;
            let id = state.last_id;

            state.jobs.insert(
                id,
                JobEntry {
                    queue: queue.to_string(),
                    payload,
                    pri,
                    holder: None,
                },
            );
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .insert((pri, id));

            id
        };

        debug!("put job {id} on {queue} at pri {pri}");
        self.changed.notify_waiters();

        id
    }

    /// Allocates the highest-priority queued job across `queues` to
    /// `client`, if any queue has one.
    pub fn try_take(&self, client: ClientId, queues: &[String]) -> Option<Job> {
        let mut state = self.state.lock();

        let best = queues
            .iter()
            .filter_map(|queue| state.queues.get(queue)?.last().copied())
            .max()?;

        let (pri, id) = best;
        let entry = state.jobs.get_mut(&id)?;
        let queue = entry.queue.clone();
        let payload = entry.payload.clone();
        entry.holder = Some(client);

        state.queues.get_mut(&queue)?.remove(&(pri, id));
        state.allocations.entry(client).or_default().insert(id);

        debug!("job {id} allocated to client {client}");
        Some(Job {
            id,
            queue,
            payload,
            pri,
        })
    }

    /// Like [`Broker::try_take`], but waits for a matching job.
    pub async fn take_wait(&self, client: ClientId, queues: &[String]) -> Job {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_take(client, queues) {
                return job;
            }

            notified.await;
        }
    }

    /// Returns an allocated job to its queue. Only the holder may
    /// abort; a queued or unknown id reports [`AbortError::NoJob`].
    ///
    /// # Errors
    /// * [`AbortError::NoJob`] for unknown or unallocated ids.
    /// * [`AbortError::NotOwner`] when another client holds the job.
    pub fn abort(&self, client: ClientId, id: JobId) -> Result<(), AbortError> {
        {
            let mut state = self.state.lock();

            let holder = state
                .jobs
                .get(&id)
                .and_then(|entry| entry.holder)
                .ok_or(AbortError::NoJob)?;
            if holder != client {
                return Err(AbortError::NotOwner(id));
            }

            Self::requeue(&mut state, id);
            if let Some(allocated) = state.allocations.get_mut(&client) {
                allocated.remove(&id);
            }
        }

        debug!("job {id} aborted by client {client}");
        self.changed.notify_waiters();

        Ok(())
    }

    /// Removes a job entirely, queued or allocated, regardless of who
    /// holds it. Returns false for unknown ids.
    pub fn delete(&self, id: JobId) -> bool {
        let deleted = {
            let mut state = self.state.lock();

            let Some(entry) = state.jobs.remove(&id) else {
                return false;
            };

            match entry.holder {
                Some(holder) => {
                    if let Some(allocated) = state.allocations.get_mut(&holder) {
                        allocated.remove(&id);
                    }
                }
                None => {
                    if let Some(index) = state.queues.get_mut(&entry.queue) {
                        index.remove(&(entry.pri, id));
                    }
                }
            }

            true
        };

        debug!("job {id} deleted");
        self.changed.notify_waiters();

        deleted
    }

    /// Returns every job the client holds to its queue. Called on
    /// client disconnect, always.
    pub fn disconnect(&self, client: ClientId) {
        let requeued = {
            let mut state = self.state.lock();

            let Some(allocated) = state.allocations.remove(&client) else {
                return;
            };

            for &id in &allocated {
                Self::requeue(&mut state, id);
            }

            allocated.len()
        };

        if requeued > 0 {
            debug!("client {client} disconnected, {requeued} jobs requeued");
            self.changed.notify_waiters();
        }
    }

    fn requeue(state: &mut State, id: JobId) {
        if let Some(entry) = state.jobs.get_mut(&id) {
            entry.holder = None;
            let key = (entry.pri, id);
            let queue = entry.queue.clone();
            state.queues.entry(queue).or_default().insert(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_put_get_highest_priority() {
        let broker = Broker::new();

        broker.put("q1", json!({"task": "a"}), 5);
        let high = broker.put("q1", json!({"task": "b"}), 10);
        broker.put("q2", json!({"task": "c"}), 7);

        let queues = vec!["q1".to_string(), "q2".to_string()];
        let job = broker.try_take(1, &queues).unwrap();
        assert_eq!(high, job.id);
        assert_eq!(10, job.pri);
        assert_eq!("q1", job.queue);

        // Next best spans queues.
        assert_eq!(7, broker.try_take(1, &queues).unwrap().pri);
        assert_eq!(5, broker.try_take(1, &queues).unwrap().pri);
        assert!(broker.try_take(1, &queues).is_none());
    }

    #[test]
    fn test_get_only_named_queues() {
        let broker = Broker::new();
        broker.put("q1", json!(1), 5);

        assert!(broker.try_take(1, &["q2".to_string()]).is_none());
    }

    #[test]
    fn test_abort_requeues() {
        let broker = Broker::new();
        let id = broker.put("q1", json!("payload"), 5);

        let queues = vec!["q1".to_string()];
        assert_eq!(id, broker.try_take(1, &queues).unwrap().id);

        // Someone else cannot abort it.
        assert_eq!(Err(AbortError::NotOwner(id)), broker.abort(2, id));

        broker.abort(1, id).unwrap();
        assert_eq!(id, broker.try_take(2, &queues).unwrap().id);

        // Aborting a queued or unknown job reports no-job.
        assert_eq!(Err(AbortError::NoJob), broker.abort(2, 999));
    }

    #[test]
    fn test_delete_allocated_job() {
        let broker = Broker::new();
        let id = broker.put("q1", json!("payload"), 5);

        let queues = vec!["q1".to_string()];
        broker.try_take(1, &queues).unwrap();

        // Delete works against an allocation held by someone else.
        assert!(broker.delete(id));
        assert!(!broker.delete(id));

        // The job does not come back on disconnect.
        broker.disconnect(1);
        assert!(broker.try_take(2, &queues).is_none());
    }

    #[test]
    fn test_disconnect_requeues_everything() {
        let broker = Broker::new();
        let first = broker.put("q1", json!(1), 5);
        let second = broker.put("q2", json!(2), 9);

        let queues = vec!["q1".to_string(), "q2".to_string()];
        broker.try_take(1, &queues).unwrap();
        broker.try_take(1, &queues).unwrap();
        assert!(broker.try_take(2, &queues).is_none());

        broker.disconnect(1);

        assert_eq!(second, broker.try_take(2, &queues).unwrap().id);
        assert_eq!(first, broker.try_take(2, &queues).unwrap().id);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let broker = Broker::new();
        let first = broker.put("q1", json!(1), 5);
        broker.delete(first);

        let second = broker.put("q1", json!(2), 5);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_take_wait_wakes_on_put() {
        let broker = std::sync::Arc::new(Broker::new());

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.take_wait(1, &["q1".to_string()]).await })
        };

        // Let the waiter block, then feed it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let id = broker.put("q1", json!("late"), 3);

        let job = waiter.await.unwrap();
        assert_eq!(id, job.id);
    }
}
