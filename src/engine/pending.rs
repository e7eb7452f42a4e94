use std::time::Duration;

use hashbrown::{hash_map::Entry, HashMap};
use parking_lot::Mutex;
use tokio::{select, sync::Notify, time::Instant};

use crate::{
    error::{Error, Result},
    net::EndpointRef,
    Identifier, WorkerID,
};

/// One worker's answer for one identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialResult<P> {
    pub worker: WorkerID,
    pub payload: P,
}

/// How an entry left the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Every expected worker answered.
    Completed,
    /// The request timed out first; the aggregate may be short.
    ForceFlushed,
}

struct PendingEntry<P> {
    requestor: EndpointRef,
    created: Instant,
    collected: Vec<PartialResult<P>>,
    expected: usize,
}

impl<P> PendingEntry<P> {
    fn retire(self, id: Identifier, completion: Completion) -> Retired<P> {
        Retired {
            id,
            requestor: self.requestor,
            created: self.created,
            collected: self.collected,
            expected: self.expected,
            completion,
        }
    }
}

/// An entry that has been removed from the table and must be delivered.
/// Owning one is the only way to deliver, so an aggregate can't go out twice.
#[derive(Debug)]
pub struct Retired<P> {
    pub id: Identifier,
    pub requestor: EndpointRef,
    pub created: Instant,
    /// Partial results in arrival order.
    pub collected: Vec<PartialResult<P>>,
    pub expected: usize,
    pub completion: Completion,
}

impl<P> Retired<P> {
    /// True if fewer workers answered than were asked.
    pub fn is_short(&self) -> bool {
        self.collected.len() < self.expected
    }
}

/// What happened to a posted partial result.
#[derive(Debug)]
pub enum Posted<P> {
    /// Stored; the entry is still waiting for more workers.
    Accumulating { collected: usize, expected: usize },
    /// Stored, and it was the last one. The entry is already retired.
    Completed(Retired<P>),
    /// This worker had already answered; the result was discarded.
    Duplicate,
}

/// Aggregation state for every in-flight identifier.
///
/// A single lock covers admission, appends, and the completion check plus
/// removal, so two contexts can never both see an entry reach its expected
/// count and both deliver it.
pub struct PendingRequestTable<P> {
    entries: Mutex<HashMap<Identifier, PendingEntry<P>>>,
    /// Woken whenever a retirement leaves the table empty.
    emptied: Notify,
}

impl<P> Default for PendingRequestTable<P> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            emptied: Notify::new(),
        }
    }
}

impl<P> PendingRequestTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `id`, expecting `expected` workers to answer.
    pub fn admit(
        &self,
        id: Identifier,
        requestor: EndpointRef,
        expected: usize,
        now: Instant,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            Err(Error::AlreadyPending(id))?
        }
        entries.insert(
            id,
            PendingEntry {
                requestor,
                created: now,
                collected: Vec::with_capacity(expected),
                expected,
            },
        );
        Ok(())
    }

    /// Appends a partial result. Results for identifiers that aren't pending
    /// fail with `LateArrival` and are never used to resurrect an entry.
    pub fn post(
        &self,
        id: Identifier,
        result: PartialResult<P>,
    ) -> Result<Posted<P>> {
        let mut entries = self.entries.lock();
        let mut entry = match entries.entry(id) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(_) => Err(Error::LateArrival {
                id,
                worker: result.worker,
            })?,
        };
        let pending = entry.get_mut();
        if pending.collected.iter().any(|r| r.worker == result.worker) {
            return Ok(Posted::Duplicate);
        }
        pending.collected.push(result);

        if pending.collected.len() < pending.expected {
            return Ok(Posted::Accumulating {
                collected: pending.collected.len(),
                expected: pending.expected,
            });
        }
        let retired = entry.remove().retire(id, Completion::Completed);
        self.notify_if_empty(&entries);
        Ok(Posted::Completed(retired))
    }

    /// Retires every entry that has either filled up or been waiting longer
    /// than `timeout`.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<Retired<P>> {
        let mut entries = self.entries.lock();
        let due = entries
            .iter()
            .filter_map(|(id, entry)| {
                if entry.collected.len() >= entry.expected {
                    Some((*id, Completion::Completed))
                } else if now.saturating_duration_since(entry.created) > timeout
                {
                    Some((*id, Completion::ForceFlushed))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        let retired = due
            .into_iter()
            .filter_map(|(id, completion)| {
                entries.remove(&id).map(|entry| entry.retire(id, completion))
            })
            .collect::<Vec<_>>();
        if !retired.is_empty() {
            self.notify_if_empty(&entries);
        }
        retired
    }

    /// Force-flushes everything still pending.
    pub fn retire_all(&self) -> Vec<Retired<P>> {
        let retired = self
            .entries
            .lock()
            .drain()
            .map(|(id, entry)| entry.retire(id, Completion::ForceFlushed))
            .collect();
        self.emptied.notify_waiters();
        retired
    }

    /// Waits until nothing is pending or `deadline` passes. Returns true if
    /// the table emptied in time.
    pub async fn wait_until_empty(&self, deadline: Instant) -> bool {
        loop {
            // registered before the check so an emptying in between isn't
            // missed
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            select! {
                _ = tokio::time::sleep_until(deadline) => return self.is_empty(),
                _ = &mut emptied => {}
            }
        }
    }

    fn notify_if_empty(&self, entries: &HashMap<Identifier, PendingEntry<P>>) {
        if entries.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    pub fn contains(&self, id: Identifier) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;

    use super::*;

    fn partial(worker: WorkerID, payload: &[i32]) -> PartialResult<Vec<i32>> {
        PartialResult {
            worker,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn completes_in_arrival_order_exactly_once() {
        let table = PendingRequestTable::new();
        let now = Instant::now();
        table.admit(42, "validator".into(), 3, now).unwrap();

        assert!(matches!(
            table.post(42, partial(0, &[1, 2, 3])).unwrap(),
            Posted::Accumulating { collected: 1, expected: 3 }
        ));
        assert!(matches!(
            table.post(42, partial(1, &[4, 5])).unwrap(),
            Posted::Accumulating { collected: 2, expected: 3 }
        ));
        let retired = match table.post(42, partial(2, &[6])).unwrap() {
            Posted::Completed(retired) => retired,
            other => panic!("expected completion, got {:?}", other),
        };

        assert_eq!(retired.completion, Completion::Completed);
        assert_eq!(retired.requestor, EndpointRef::new("validator"));
        let payloads = retired
            .collected
            .into_iter()
            .map(|r| r.payload)
            .collect::<Vec<_>>();
        assert_eq!(payloads, vec![vec![1, 2, 3], vec![4, 5], vec![6]]);
        assert!(table.is_empty());

        // a straggler can't bring the entry back
        assert!(matches!(
            table.post(42, partial(2, &[6])),
            Err(Error::LateArrival { id: 42, worker: 2 })
        ));
        assert!(table.expire(now, Duration::ZERO).is_empty());
    }

    #[test]
    fn duplicate_workers_are_ignored() {
        let table = PendingRequestTable::new();
        table.admit(1, "v".into(), 2, Instant::now()).unwrap();
        table.post(1, partial(0, &[1])).unwrap();
        assert!(matches!(
            table.post(1, partial(0, &[1])).unwrap(),
            Posted::Duplicate
        ));
        assert!(table.contains(1));
    }

    #[test]
    fn double_admission_is_rejected() {
        let table = PendingRequestTable::<Vec<i32>>::new();
        let now = Instant::now();
        table.admit(5, "v".into(), 1, now).unwrap();
        assert!(matches!(
            table.admit(5, "v".into(), 1, now),
            Err(Error::AlreadyPending(5))
        ));
    }

    #[test]
    fn timed_out_entries_are_force_flushed_short() {
        let table = PendingRequestTable::new();
        let start = Instant::now();
        let timeout = Duration::from_millis(100);
        table.admit(1, "v".into(), 3, start).unwrap();
        table.admit(2, "v".into(), 3, start + timeout).unwrap();
        table.post(1, partial(0, &[9])).unwrap();

        assert!(table.expire(start + timeout, timeout).is_empty());

        let flushed = table.expire(start + timeout * 2, timeout);
        assert_eq!(flushed.len(), 1);
        let flushed = &flushed[0];
        assert_eq!(flushed.id, 1);
        assert_eq!(flushed.completion, Completion::ForceFlushed);
        assert!(flushed.is_short());
        assert_eq!(flushed.collected.len(), 1);
        assert!(table.contains(2));
    }

    #[test]
    fn empty_fan_out_completes_on_sweep() {
        let table = PendingRequestTable::<Vec<i32>>::new();
        let now = Instant::now();
        table.admit(3, "v".into(), 0, now).unwrap();
        let done = table.expire(now, Duration::from_secs(60));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].completion, Completion::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_posts_complete_exactly_once() {
        const WORKERS: u32 = 8;
        for _ in 0..50 {
            let table = Arc::new(PendingRequestTable::new());
            table
                .admit(42, "v".into(), WORKERS as usize, Instant::now())
                .unwrap();
            let start = Arc::new(Barrier::new(WORKERS as usize));

            let posts = (0..WORKERS)
                .map(|worker| {
                    let table = table.clone();
                    let start = start.clone();
                    tokio::spawn(async move {
                        start.wait().await;
                        table.post(42, partial(worker, &[worker as i32]))
                    })
                })
                .collect::<Vec<_>>();

            let mut completed = 0;
            for post in posts {
                match post.await.unwrap().unwrap() {
                    Posted::Completed(retired) => {
                        completed += 1;
                        assert_eq!(retired.collected.len(), WORKERS as usize);
                    }
                    Posted::Accumulating { .. } => {}
                    Posted::Duplicate => panic!("workers are distinct"),
                }
            }
            assert_eq!(completed, 1);
            assert!(table.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_empty_wakes_on_the_last_retirement() {
        let table = Arc::new(PendingRequestTable::new());
        table.admit(1, "v".into(), 1, Instant::now()).unwrap();
        let started = Instant::now();

        let poster = {
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                table.post(1, partial(0, &[1])).unwrap();
            })
        };
        assert!(
            table
                .wait_until_empty(started + Duration::from_secs(10))
                .await
        );
        assert_eq!(started.elapsed(), Duration::from_millis(30));
        poster.await.unwrap();

        table.admit(2, "v".into(), 1, Instant::now()).unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(!table.wait_until_empty(deadline).await);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn retire_all_flushes_everything() {
        let table = PendingRequestTable::<Vec<i32>>::new();
        let now = Instant::now();
        for id in 0..4 {
            table.admit(id, "v".into(), 2, now).unwrap();
        }
        let flushed = table.retire_all();
        assert_eq!(flushed.len(), 4);
        assert!(flushed
            .iter()
            .all(|r| r.completion == Completion::ForceFlushed));
        assert!(table.is_empty());
    }
}
