use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    select,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::{handler, subscribe_all, unexpected, unsubscribe_all, Tasks};
use crate::{
    config::ValidatorConf,
    engine::{
        CounterSnapshot, Counters, RateLimitedAdmission, RoundTripValidator,
        ScatterDispatcher,
    },
    error::{Error, Result},
    lifecycle::{Command, Module, ModuleState},
    net::{
        ensure_reachable,
        sender::RetryingSender,
        wire::{CreateList, Message, RequestList, ReversedList},
        EndpointRef, Transport,
    },
    Identifier,
};

struct Shared {
    conf: ValidatorConf,
    admission: RateLimitedAdmission,
    scatter: ScatterDispatcher,
    sender: RetryingSender,
    validator: RoundTripValidator,
    counters: Arc<Counters>,
}

impl Shared {
    fn reverser_for(&self, id: Identifier) -> &EndpointRef {
        &self.conf.reversers[id as usize % self.conf.reversers.len()]
    }

    /// Asks the generators to create lists for `id`, then asks a reverser
    /// to collect them.
    async fn issue(&self, id: Identifier, rng: &mut StdRng) {
        let list_size =
            rng.gen_range(self.conf.min_list_size..=self.conf.max_list_size);
        let report = self
            .scatter
            .dispatch(id, &self.conf.generators, |_| {
                Message::CreateList(CreateList {
                    list_id: id,
                    list_size,
                })
            })
            .await;
        debug!(
            id,
            list_size,
            delivered = report.delivered,
            attempted = report.attempted,
            "requested list creation"
        );
        self.request(id).await;
    }

    async fn request(&self, id: Identifier) {
        let reverser = self.reverser_for(id);
        let msg = Message::RequestList(RequestList {
            list_id: id,
            destination: self.conf.list_input.to_string(),
        });
        match self.sender.send_with_retry(reverser, &msg).await {
            Ok(()) => self.counters.requests_issued.incr(),
            // left outstanding, so it is picked up again once it goes stale
            Err(e) => error!(id, destination = %reverser, "could not request list: {}", e),
        }
    }

    /// Issues requests as fast as admission allows until cancelled.
    async fn run_requests(self: Arc<Self>, cancel: CancellationToken) {
        let mut rng = StdRng::from_entropy();
        while let Some(id) = self.admission.admit(&cancel).await {
            self.issue(id, &mut rng).await;
        }
        debug!("stopped issuing requests");
    }

    /// Re-issues requests that went unanswered for twice the request
    /// timeout, and gives up on those that were already re-issued enough.
    async fn reissue_stale(&self) {
        let now = Instant::now();
        let older_than = self.conf.request_timeout() * 2;
        for (id, outstanding) in self.admission.stale(now, older_than) {
            if outstanding.reissues < self.conf.max_reissues {
                warn!(
                    id,
                    reissues = outstanding.reissues,
                    timeout_ms = older_than.as_millis() as u64,
                    "re-issuing stale request"
                );
                self.admission.reissued(id, now);
                self.counters.requests_reissued.incr();
                self.request(id).await;
            } else if self.admission.complete(id).is_some() {
                self.counters.requests_expired.incr();
                warn!(
                    id,
                    reissues = outstanding.reissues,
                    "giving up on unanswered request"
                );
            }
        }
    }

    async fn run_reissuer(self: Arc<Self>, cancel: CancellationToken) {
        let period = (self.conf.request_timeout() / 2)
            .max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reissue_stale().await,
            }
        }
    }

    fn on_reversed(&self, reversed: ReversedList) {
        self.counters.lists_received.incr();
        if self.admission.complete(reversed.list_id).is_none() {
            debug!(
                id = reversed.list_id,
                "aggregate for a request that is no longer outstanding"
            );
        }
        self.validator.offer_derived(reversed);
    }
}

/// Drives the whole round trip: paces requests, and checks what comes back
/// against the originals.
pub struct Validator {
    name: String,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    state: ModuleState,
    conf: Option<ValidatorConf>,
    running: Option<Running>,
}

struct Running {
    shared: Arc<Shared>,
    /// Cancels the request loop alone.
    requests: CancellationToken,
    tasks: Tasks,
}

impl Validator {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            counters: Arc::new(Counters::default()),
            state: ModuleState::Initial,
            conf: None,
            running: None,
        }
    }

    fn span(&self) -> Span {
        info_span!("validator", name = %self.name)
    }
}

#[async_trait]
impl Module for Validator {
    type Conf = ValidatorConf;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    async fn configure(&mut self, conf: ValidatorConf) -> Result<()> {
        let Some(next) = self.state.apply(Command::Configure)? else {
            return Ok(());
        };
        conf.validate()?;
        self.conf = Some(conf);
        self.state = next;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let Some(next) = self.state.apply(Command::Start)? else {
            return Ok(());
        };
        let conf = self.conf.clone().ok_or(Error::InvalidTransition {
            command: Command::Start.as_str(),
            state: self.state,
        })?;
        ensure_reachable(
            &*self.transport,
            [&conf.list_input, &conf.originals_input]
                .into_iter()
                .chain(conf.generators.iter())
                .chain(conf.reversers.iter()),
        )?;
        let span = self.span();

        let cancel = CancellationToken::new();
        let sender = RetryingSender::new(
            self.transport.clone(),
            conf.retry_policy(),
            cancel.clone(),
        );
        let shared = Arc::new(Shared {
            admission: RateLimitedAdmission::new(
                conf.request_rate_hz,
                conf.max_outstanding_requests,
                Instant::now(),
            )?,
            scatter: ScatterDispatcher::new(sender.clone()),
            sender,
            validator: RoundTripValidator::new(
                conf.cache_capacity,
                conf.expected_results(),
                self.counters.clone(),
            ),
            counters: self.counters.clone(),
            conf,
        });

        let on_reversed = {
            let shared = shared.clone();
            let endpoint = shared.conf.list_input.clone();
            handler(&endpoint.clone(), span.clone(), move |msg| {
                let shared = shared.clone();
                let endpoint = endpoint.clone();
                async move {
                    match msg {
                        Message::ReversedList(reversed) => {
                            shared.on_reversed(reversed)
                        }
                        other => unexpected(&endpoint, &other),
                    }
                }
            })
        };
        let on_original = {
            let shared = shared.clone();
            let endpoint = shared.conf.originals_input.clone();
            handler(&endpoint.clone(), span.clone(), move |msg| {
                let shared = shared.clone();
                let endpoint = endpoint.clone();
                async move {
                    match msg {
                        Message::IntList(original) => {
                            shared.validator.offer_original(original);
                        }
                        other => unexpected(&endpoint, &other),
                    }
                }
            })
        };
        subscribe_all(
            &*self.transport,
            vec![
                (shared.conf.list_input.clone(), on_reversed),
                (shared.conf.originals_input.clone(), on_original),
            ],
        )
        .await?;

        let requests = cancel.child_token();
        let mut tasks = Tasks::new(cancel.clone());
        tasks.spawn(
            shared
                .clone()
                .run_requests(requests.clone())
                .instrument(span.clone()),
        );
        tasks.spawn(
            shared
                .clone()
                .run_reissuer(cancel)
                .instrument(span.clone()),
        );

        span.in_scope(|| {
            info!(
                rate_hz = shared.conf.request_rate_hz,
                max_outstanding = shared.conf.max_outstanding_requests,
                "validator started"
            )
        });
        self.running = Some(Running {
            shared,
            requests,
            tasks,
        });
        self.state = next;
        Ok(())
    }

    /// Stops issuing at once, waits up to the grace period for outstanding
    /// requests to be answered, then forgets the rest.
    async fn stop(&mut self) -> Result<()> {
        let Some(next) = self.state.apply(Command::Stop)? else {
            return Ok(());
        };
        let span = self.span();
        if let Some(Running {
            shared,
            requests,
            tasks,
        }) = self.running.take()
        {
            requests.cancel();
            let deadline = Instant::now() + shared.conf.stop_grace();
            if !shared.admission.wait_idle(deadline).await {
                let abandoned = shared.admission.outstanding();
                span.in_scope(|| {
                    warn!(abandoned, "requests still outstanding at stop")
                });
            }

            tasks.shutdown().await;
            unsubscribe_all(
                &*self.transport,
                &[
                    shared.conf.list_input.clone(),
                    shared.conf.originals_input.clone(),
                ],
            )
            .await;
            shared.admission.clear();
            shared.validator.clear();
        }
        self.state = next;

        span.in_scope(|| {
            info!(
                issued = self.counters.requests_issued.total(),
                received = self.counters.lists_received.total(),
                valid = self.counters.valid_pairs.total(),
                mismatched = self.counters.mismatched_pairs.total(),
                incomplete = self.counters.incomplete_aggregates.total(),
                "validator stopped"
            )
        });
        Ok(())
    }

    async fn unconfigure(&mut self) -> Result<()> {
        let Some(next) = self.state.apply(Command::Unconfigure)? else {
            return Ok(());
        };
        self.conf = None;
        self.state = next;
        Ok(())
    }

    fn info(&self) -> CounterSnapshot {
        self.counters.snapshot_and_reset()
    }
}
