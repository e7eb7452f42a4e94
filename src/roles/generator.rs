use std::sync::Arc;

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{select, sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::{handler, subscribe_all, unexpected, unsubscribe_all};
use crate::{
    config::GeneratorConf,
    engine::{BoundedCache, CounterSnapshot, Counters},
    error::{Error, Result},
    lifecycle::{Command, Module, ModuleState},
    net::{
        ensure_reachable,
        sender::RetryingSender,
        wire::{CreateList, IntList, Message, RequestList},
        EndpointRef, Transport,
    },
    Identifier, WorkerID,
};

/// How a generator fills its lists. Chosen by generator id, so neighbouring
/// generators produce visibly different data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListMode {
    /// Uniform in `1..=1000`
    Random,
    /// `id, id + 1, ...`
    Ascending,
    /// Even numbers from `id` upwards
    Evens,
    /// Odd numbers from `id` upwards
    Odds,
    /// `id, id - 1, ...`
    Descending,
}

impl ListMode {
    pub fn for_generator(generator_id: WorkerID) -> Self {
        match generator_id % 5 {
            0 => ListMode::Random,
            1 => ListMode::Ascending,
            2 => ListMode::Evens,
            3 => ListMode::Odds,
            _ => ListMode::Descending,
        }
    }

    pub fn generate(
        self,
        list_id: Identifier,
        size: usize,
        rng: &mut impl Rng,
    ) -> Vec<i32> {
        let base = list_id as i32;
        let parity = (list_id % 2) as i32;
        (0..size as i32)
            .map(|i| match self {
                ListMode::Random => rng.gen_range(1..=1000),
                ListMode::Ascending => base.wrapping_add(i),
                ListMode::Evens => {
                    base.wrapping_add(parity).wrapping_add(i.wrapping_mul(2))
                }
                ListMode::Odds => base
                    .wrapping_add(1 - parity)
                    .wrapping_add(i.wrapping_mul(2)),
                ListMode::Descending => base.wrapping_sub(i),
            })
            .collect()
    }
}

/// State shared by the handlers of a running generator.
struct Shared {
    conf: GeneratorConf,
    mode: ListMode,
    storage: BoundedCache<Vec<i32>>,
    /// Woken whenever a list lands in storage.
    stored: Notify,
    sender: RetryingSender,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Shared {
    async fn create(&self, request: CreateList) {
        let CreateList {
            list_id,
            list_size,
        } = request;
        let list = self.mode.generate(
            list_id,
            list_size as usize,
            &mut StdRng::from_entropy(),
        );
        self.counters.lists_generated.incr();
        debug!(id = list_id, size = list.len(), mode = ?self.mode, "generated list");

        // a re-sent create replaces the list
        if let Err(e) = self.storage.put(list_id.into(), list.clone(), true) {
            warn!(id = list_id, "could not store list: {}", e);
            return;
        }
        self.stored.notify_waiters();

        if let Some(originals) = &self.conf.originals_output {
            let original = Message::IntList(IntList {
                list_id,
                generator_id: self.conf.generator_id,
                list,
            });
            self.sender.deliver_or_drop(originals, &original).await;
        }
    }

    /// Waits up to the request timeout for `id` to be created.
    async fn wait_for(&self, id: Identifier) -> Option<Vec<i32>> {
        let deadline = Instant::now() + self.conf.request_timeout();
        loop {
            let stored = self.stored.notified();
            tokio::pin!(stored);
            stored.as_mut().enable();

            if let Ok(list) = self.storage.get(id.into()) {
                return Some(list);
            }
            select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = &mut stored => {}
            }
        }
    }

    async fn serve(&self, request: RequestList) {
        let RequestList {
            list_id,
            destination,
        } = request;
        self.counters.requests_received.incr();
        let destination = EndpointRef::from(destination);

        let Some(list) = self.wait_for(list_id).await else {
            if !self.cancel.is_cancelled() {
                warn!(
                    id = list_id,
                    %destination,
                    timeout_ms = self.conf.request_timeout_ms,
                    "timed out waiting for the list to be created"
                );
            }
            return;
        };
        let msg = Message::IntList(IntList {
            list_id,
            generator_id: self.conf.generator_id,
            list,
        });
        if self.sender.deliver_or_drop(&destination, &msg).await {
            self.counters.lists_sent.incr();
        }
    }
}

/// Creates lists on demand and serves them to whoever asks.
pub struct Generator {
    name: String,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    state: ModuleState,
    conf: Option<GeneratorConf>,
    running: Option<Arc<Shared>>,
}

impl Generator {
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
        info_span!("generator", name = %self.name)
    }

    fn configured(&self) -> Result<&GeneratorConf> {
        self.conf.as_ref().ok_or(Error::InvalidTransition {
            command: Command::Start.as_str(),
            state: self.state,
        })
    }

    fn endpoints(conf: &GeneratorConf) -> Vec<EndpointRef> {
        vec![conf.create_input.clone(), conf.request_input.clone()]
    }
}

#[async_trait]
impl Module for Generator {
    type Conf = GeneratorConf;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    async fn configure(&mut self, conf: GeneratorConf) -> Result<()> {
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
        let conf = self.configured()?.clone();
        let span = self.span();
        ensure_reachable(
            &*self.transport,
            Self::endpoints(&conf)
                .iter()
                .chain(conf.originals_output.iter()),
        )?;

        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            mode: ListMode::for_generator(conf.generator_id),
            storage: BoundedCache::new(conf.storage_capacity),
            stored: Notify::new(),
            sender: RetryingSender::new(
                self.transport.clone(),
                conf.retry_policy(),
                cancel.clone(),
            ),
            counters: self.counters.clone(),
            cancel,
            conf,
        });

        let on_create = {
            let shared = shared.clone();
            let endpoint = shared.conf.create_input.clone();
            handler(&endpoint.clone(), span.clone(), move |msg| {
                let shared = shared.clone();
                let endpoint = endpoint.clone();
                async move {
                    match msg {
                        Message::CreateList(request) => {
                            shared.create(request).await
                        }
                        other => unexpected(&endpoint, &other),
                    }
                }
            })
        };
        // requests are served on their own tasks, since a request may have
        // to wait for its list to be created
        let on_request = {
            let shared = shared.clone();
            let endpoint = shared.conf.request_input.clone();
            handler(&endpoint.clone(), span.clone(), move |msg| {
                let shared = shared.clone();
                let endpoint = endpoint.clone();
                async move {
                    match msg {
                        Message::RequestList(request) => {
                            tokio::spawn(
                                async move { shared.serve(request).await }
                                    .in_current_span(),
                            );
                        }
                        other => unexpected(&endpoint, &other),
                    }
                }
            })
        };
        subscribe_all(
            &*self.transport,
            vec![
                (shared.conf.create_input.clone(), on_create),
                (shared.conf.request_input.clone(), on_request),
            ],
        )
        .await?;

        span.in_scope(|| {
            info!(mode = ?shared.mode, "generator started")
        });
        self.running = Some(shared);
        self.state = next;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(next) = self.state.apply(Command::Stop)? else {
            return Ok(());
        };
        if let Some(shared) = self.running.take() {
            // a handler stuck retrying a send must give up before
            // unsubscribe can wait for it
            shared.cancel.cancel();
            unsubscribe_all(&*self.transport, &Self::endpoints(&shared.conf))
                .await;
            shared.storage.clear();
        }
        self.state = next;

        self.span().in_scope(|| {
            info!(
                generated = self.counters.lists_generated.total(),
                sent = self.counters.lists_sent.total(),
                "generator stopped"
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
