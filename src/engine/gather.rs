use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    counters::Counters,
    pending::{Completion, PartialResult, PendingRequestTable, Posted, Retired},
};
use crate::{
    error::{Error, Result},
    net::{sender::RetryingSender, wire::Message, EndpointRef},
    Identifier,
};

/// Turns the partial results gathered for an identifier into the message
/// sent back to the requestor.
pub type Aggregate<P> =
    Box<dyn Fn(Identifier, Vec<PartialResult<P>>) -> Message + Send + Sync>;

/// Drives entries of a `PendingRequestTable` to completion and delivers the
/// aggregates.
///
/// Completion is checked on every accepted result and by a periodic sweep
/// that catches entries no longer receiving traffic. Delivery is attempted
/// once per entry: if the retries run out the aggregate is dropped, never
/// resent.
pub struct GatherEngine<P> {
    table: PendingRequestTable<P>,
    request_timeout: Duration,
    sender: RetryingSender,
    aggregate: Aggregate<P>,
    counters: Arc<Counters>,
}

impl<P: Send + 'static> GatherEngine<P> {
    pub fn new(
        sender: RetryingSender,
        request_timeout: Duration,
        aggregate: Aggregate<P>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            table: PendingRequestTable::new(),
            request_timeout,
            sender,
            aggregate,
            counters,
        }
    }

    pub fn table(&self) -> &PendingRequestTable<P> {
        &self.table
    }

    /// Opens an entry for `id` that completes once `expected` workers have
    /// answered.
    pub fn admit(
        &self,
        id: Identifier,
        requestor: EndpointRef,
        expected: usize,
    ) -> Result<()> {
        self.table.admit(id, requestor, expected, Instant::now())?;
        self.counters.requests_received.incr();
        trace!(id, expected, "admitted request");
        Ok(())
    }

    /// Adds a partial result. Returns the retired entry if this result
    /// completed it; late and duplicate results are logged and dropped.
    pub fn accept(
        &self,
        id: Identifier,
        result: PartialResult<P>,
    ) -> Option<Retired<P>> {
        self.counters.lists_received.incr();
        let worker = result.worker;
        match self.table.post(id, result) {
            Ok(Posted::Completed(retired)) => {
                trace!(id, worker, "request complete");
                Some(retired)
            }
            Ok(Posted::Accumulating {
                collected,
                expected,
            }) => {
                trace!(id, worker, collected, expected, "accumulating");
                None
            }
            Ok(Posted::Duplicate) => {
                self.counters.duplicate_results.incr();
                warn!(id, worker, "discarding duplicate result");
                None
            }
            Err(Error::LateArrival { .. }) => {
                self.counters.late_arrivals.incr();
                warn!(id, worker, "discarding result for a retired request");
                None
            }
            Err(e) => {
                warn!(id, worker, "discarding result: {}", e);
                None
            }
        }
    }

    /// Retires everything that is full or has outlived the request timeout.
    pub fn sweep(&self, now: Instant) -> Vec<Retired<P>> {
        self.table.expire(now, self.request_timeout)
    }

    /// Builds the aggregate and sends it to the requestor.
    pub async fn deliver(&self, retired: Retired<P>) -> bool {
        let Retired {
            id,
            requestor,
            collected,
            expected,
            completion,
            created,
        } = retired;
        if completion == Completion::ForceFlushed {
            self.counters.force_flushed.incr();
            warn!(
                id,
                destination = %requestor,
                collected = collected.len(),
                expected,
                timeout_ms = self.request_timeout.as_millis() as u64,
                "request timed out, delivering what was gathered"
            );
        }
        let msg = (self.aggregate)(id, collected);
        if self.sender.deliver_or_drop(&requestor, &msg).await {
            self.counters.lists_sent.incr();
            debug!(
                id,
                destination = %requestor,
                elapsed_us = created.elapsed().as_micros() as u64,
                "delivered aggregate"
            );
            true
        } else {
            self.counters.dropped_deliveries.incr();
            false
        }
    }

    /// Delivers on a separate task so a slow requestor doesn't hold up the
    /// caller.
    pub fn spawn_delivery(self: &Arc<Self>, retired: Retired<P>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.deliver(retired).await;
        });
    }

    /// Sweeps every `interval` until cancelled.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for retired in self.sweep(Instant::now()) {
                        self.spawn_delivery(retired);
                    }
                }
            }
        }
        debug!("sweeper stopped");
    }

    /// Gives pending entries up to `grace` to finish on their own, then
    /// force-retires whatever is left and hands it back undelivered.
    pub async fn drain(&self, grace: Duration) -> Vec<Retired<P>> {
        if self.table.wait_until_empty(Instant::now() + grace).await {
            return Vec::new();
        }
        self.table.retire_all()
    }
}
