use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{select, sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    Identifier,
};

/// A request that has been admitted and not yet answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outstanding {
    pub issued_at: Instant,
    pub reissues: u32,
}

/// The answer to "may the next request go out now?"
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead; the identifier is now outstanding.
    Admitted(Identifier),
    /// Under the concurrency ceiling, but the schedule says to wait until
    /// the given instant.
    NotYet(Instant),
    /// `max_outstanding` requests are already in flight.
    Saturated,
}

struct State {
    /// Requests admitted since `start`.
    sequence: u64,
    next_id: Identifier,
    outstanding: HashMap<Identifier, Outstanding>,
}

/// Paces new requests and bounds how many can be in flight.
///
/// The Nth request is scheduled at `start + N / rate`. It is admitted only
/// once that time has passed *and* fewer than `max_outstanding` requests are
/// awaiting an answer. The schedule caps the rate, the ceiling caps the
/// concurrency, and when consumers stall the ceiling wins: admission waits
/// instead of piling up work.
pub struct RateLimitedAdmission {
    start: Instant,
    rate_hz: f64,
    max_outstanding: usize,
    state: Mutex<State>,
    released: Notify,
    /// Woken whenever the last outstanding request goes away.
    idle: Notify,
}

impl RateLimitedAdmission {
    pub fn new(
        rate_hz: f64,
        max_outstanding: usize,
        start: Instant,
    ) -> Result<Self> {
        if !(rate_hz.is_finite() && rate_hz > 0.) {
            Err(Error::InvalidConfig(format!(
                "request rate must be positive, got {}",
                rate_hz
            )))?
        }
        if max_outstanding == 0 {
            Err(Error::InvalidConfig(
                "max outstanding requests must be at least 1".into(),
            ))?
        }
        Ok(Self {
            start,
            rate_hz,
            max_outstanding,
            state: Mutex::new(State {
                sequence: 0,
                next_id: 0,
                outstanding: HashMap::with_capacity(max_outstanding),
            }),
            released: Notify::new(),
            idle: Notify::new(),
        })
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// When the request with the given sequence number is due.
    pub fn scheduled_at(&self, sequence: u64) -> Instant {
        self.start + Duration::from_secs_f64(sequence as f64 / self.rate_hz)
    }

    pub fn try_admit(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();
        if state.outstanding.len() >= self.max_outstanding {
            return Admission::Saturated;
        }
        let due = self.scheduled_at(state.sequence);
        if now < due {
            return Admission::NotYet(due);
        }

        let mut id = state.next_id;
        while state.outstanding.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        state.next_id = id.wrapping_add(1);
        state.sequence += 1;
        state.outstanding.insert(
            id,
            Outstanding {
                issued_at: now,
                reissues: 0,
            },
        );
        Admission::Admitted(id)
    }

    /// Waits for the next admission. Returns `None` once `cancel` fires.
    pub async fn admit(&self, cancel: &CancellationToken) -> Option<Identifier> {
        loop {
            // register interest before checking, so a release between the
            // check and the wait isn't missed
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_admit(Instant::now()) {
                Admission::Admitted(id) => return Some(id),
                Admission::NotYet(due) => select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep_until(due) => {}
                },
                Admission::Saturated => select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut released => {}
                },
            }
        }
    }

    /// Closes the loop on `id`, freeing its slot. Returns what was
    /// outstanding, or `None` if the id wasn't (or is no longer) in flight.
    pub fn complete(&self, id: Identifier) -> Option<Outstanding> {
        let mut state = self.state.lock();
        let removed = state.outstanding.remove(&id);
        if removed.is_some() {
            self.released.notify_one();
            if state.outstanding.is_empty() {
                self.idle.notify_waiters();
            }
        }
        removed
    }

    /// Waits until nothing is outstanding or `deadline` passes. Returns true
    /// if every request was answered in time.
    pub async fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.outstanding() == 0 {
                return true;
            }
            select! {
                _ = tokio::time::sleep_until(deadline) => return self.outstanding() == 0,
                _ = &mut idle => {}
            }
        }
    }

    /// Requests issued (or last re-issued) more than `older_than` ago.
    pub fn stale(
        &self,
        now: Instant,
        older_than: Duration,
    ) -> Vec<(Identifier, Outstanding)> {
        let mut stale = self
            .state
            .lock()
            .outstanding
            .iter()
            .filter(|(_, o)| {
                now.saturating_duration_since(o.issued_at) > older_than
            })
            .map(|(id, o)| (*id, *o))
            .collect::<Vec<_>>();
        stale.sort_unstable_by_key(|(id, _)| *id);
        stale
    }

    /// Records that `id` was sent again at `now`.
    pub fn reissued(&self, id: Identifier, now: Instant) {
        if let Some(o) = self.state.lock().outstanding.get_mut(&id) {
            o.issued_at = now;
            o.reissues += 1;
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn is_outstanding(&self, id: Identifier) -> bool {
        self.state.lock().outstanding.contains_key(&id)
    }

    /// Forgets every outstanding request.
    pub fn clear(&self) {
        self.state.lock().outstanding.clear();
        self.released.notify_waiters();
        self.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn follows_the_schedule() {
        let start = Instant::now();
        let admission = RateLimitedAdmission::new(10., 100, start).unwrap();

        assert_eq!(admission.try_admit(start), Admission::Admitted(0));
        assert_eq!(
            admission.try_admit(start),
            Admission::NotYet(start + Duration::from_millis(100))
        );
        assert_eq!(
            admission.try_admit(start + Duration::from_millis(100)),
            Admission::Admitted(1)
        );
        assert_eq!(
            admission.scheduled_at(5),
            start + Duration::from_millis(500)
        );
    }

    #[test]
    fn ceiling_holds_even_when_schedule_allows() {
        let start = Instant::now();
        let admission = RateLimitedAdmission::new(1000., 2, start).unwrap();
        let later = start + Duration::from_secs(10);

        assert_eq!(admission.try_admit(later), Admission::Admitted(0));
        assert_eq!(admission.try_admit(later), Admission::Admitted(1));
        assert_eq!(admission.try_admit(later), Admission::Saturated);

        assert!(admission.complete(0).is_some());
        assert!(admission.complete(0).is_none());
        assert_eq!(admission.try_admit(later), Admission::Admitted(2));
    }

    #[test]
    fn rejects_nonsense_configuration() {
        let now = Instant::now();
        assert!(RateLimitedAdmission::new(0., 1, now).is_err());
        assert!(RateLimitedAdmission::new(f64::NAN, 1, now).is_err());
        assert!(RateLimitedAdmission::new(1., 0, now).is_err());
    }

    #[test]
    fn stale_requests_can_be_reissued() {
        let start = Instant::now();
        let admission = RateLimitedAdmission::new(1000., 10, start).unwrap();
        admission.try_admit(start);
        admission.try_admit(start + Duration::from_millis(5));

        let now = start + Duration::from_millis(104);
        let stale = admission.stale(now, Duration::from_millis(100));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, 0);

        admission.reissued(0, now);
        assert!(admission.stale(now, Duration::from_millis(100)).is_empty());
        assert_eq!(admission.complete(0).unwrap().reissues, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_until_a_slot_is_released() {
        let admission = std::sync::Arc::new(
            RateLimitedAdmission::new(10., 2, Instant::now()).unwrap(),
        );
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert_eq!(admission.admit(&cancel).await, Some(0));
        assert_eq!(admission.admit(&cancel).await, Some(1));
        assert!(start.elapsed() >= Duration::from_millis(100));

        let releaser = {
            let admission = admission.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                admission.complete(0);
            })
        };
        assert_eq!(admission.admit(&cancel).await, Some(2));
        assert!(start.elapsed() >= Duration::from_secs(1));
        releaser.await.unwrap();

        cancel.cancel();
        assert_eq!(admission.admit(&cancel).await, None);
        assert_eq!(admission.outstanding(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wait_ends_with_the_last_answer() {
        let admission = std::sync::Arc::new(
            RateLimitedAdmission::new(1000., 4, Instant::now()).unwrap(),
        );
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(admission.try_admit(later), Admission::Admitted(0));
        assert_eq!(admission.try_admit(later), Admission::Admitted(1));

        let answers = {
            let admission = admission.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                admission.complete(0);
                tokio::time::sleep(Duration::from_millis(10)).await;
                admission.complete(1);
            })
        };
        let started = Instant::now();
        assert!(admission.wait_idle(started + Duration::from_secs(5)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(20));
        answers.await.unwrap();

        admission.try_admit(Instant::now() + Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_millis(40);
        assert!(!admission.wait_idle(deadline).await);
        assert_eq!(admission.outstanding(), 1);
    }

    proptest! {
        #[test]
        fn never_exceeds_max_outstanding(
            max in 1usize..20,
            rate in 1u32..10_000,
            steps in prop::collection::vec((0u64..50, prop::option::of(0u32..40)), 0..300),
        ) {
            let start = Instant::now();
            let admission =
                RateLimitedAdmission::new(rate as f64, max, start).unwrap();
            let mut now = start;
            for (advance_ms, completion) in steps {
                now += Duration::from_millis(advance_ms);
                let _ = admission.try_admit(now);
                prop_assert!(admission.outstanding() <= max);
                if let Some(id) = completion {
                    admission.complete(id);
                }
            }
        }

        #[test]
        fn zero_throughput_saturates(max in 1usize..50) {
            let start = Instant::now();
            let admission = RateLimitedAdmission::new(1e6, max, start).unwrap();
            let later = start + Duration::from_secs(3600);
            for _ in 0..max * 3 {
                admission.try_admit(later);
            }
            prop_assert_eq!(admission.outstanding(), max);
            prop_assert_eq!(admission.try_admit(later), Admission::Saturated);
        }
    }
}
