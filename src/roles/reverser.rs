use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::{handler, subscribe_all, unexpected, unsubscribe_all, Tasks};
use crate::{
    config::ReverserConf,
    engine::{
        Aggregate, CounterSnapshot, Counters, GatherEngine, PartialResult,
        ScatterDispatcher,
    },
    error::{Error, Result},
    lifecycle::{Command, Module, ModuleState},
    net::{
        ensure_reachable,
        sender::RetryingSender,
        wire::{IntList, Message, RequestList, ReversedList},
        EndpointRef, Transport,
    },
    Identifier, WorkerID,
};

/// Reverses every gathered list and packs them into one reply.
fn reverse_all(reverser_id: WorkerID) -> Aggregate<Vec<i32>> {
    Box::new(move |list_id, collected| {
        let lists = collected
            .into_iter()
            .map(|PartialResult { worker, payload }| {
                let mut list = payload;
                list.reverse();
                IntList {
                    list_id,
                    generator_id: worker,
                    list,
                }
            })
            .collect();
        Message::ReversedList(ReversedList {
            list_id,
            reverser_id,
            lists,
        })
    })
}

struct Shared {
    conf: ReverserConf,
    engine: Arc<GatherEngine<Vec<i32>>>,
    scatter: ScatterDispatcher,
    counters: Arc<Counters>,
}

impl Shared {
    /// Opens a pending entry for the request. Returns false if the request
    /// was turned away.
    fn admit(&self, request: &RequestList) -> bool {
        let admitted = self.engine.admit(
            request.list_id,
            EndpointRef::new(&request.destination),
            self.conf.generators.len(),
        );
        if let Err(e) = &admitted {
            warn!(id = request.list_id, "ignoring request: {}", e);
        }
        admitted.is_ok()
    }

    /// Asks every generator to send its list for `list_id` here.
    async fn scatter(&self, list_id: Identifier) {
        let reply_to = self.conf.list_input.to_string();
        let report = self
            .scatter
            .dispatch(list_id, &self.conf.generators, |_| {
                Message::RequestList(RequestList {
                    list_id,
                    destination: reply_to.clone(),
                })
            })
            .await;
        self.counters.requests_issued.add(report.delivered as u64);
    }

    fn accept(&self, list: IntList) {
        let IntList {
            list_id,
            generator_id,
            list,
        } = list;
        let result = PartialResult {
            worker: generator_id,
            payload: list,
        };
        if let Some(retired) = self.engine.accept(list_id, result) {
            self.engine.spawn_delivery(retired);
        }
    }
}

/// Gathers one list from every generator, reverses them and sends the
/// bundle back to whoever asked.
pub struct Reverser {
    name: String,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    state: ModuleState,
    conf: Option<ReverserConf>,
    running: Option<(Arc<Shared>, Tasks)>,
}

impl Reverser {
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
        info_span!("reverser", name = %self.name)
    }
}

#[async_trait]
impl Module for Reverser {
    type Conf = ReverserConf;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    async fn configure(&mut self, conf: ReverserConf) -> Result<()> {
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
            [&conf.request_input, &conf.list_input]
                .into_iter()
                .chain(conf.generators.iter()),
        )?;
        let span = self.span();

        let cancel = CancellationToken::new();
        let sender = RetryingSender::new(
            self.transport.clone(),
            conf.retry_policy(),
            cancel.clone(),
        );
        let engine = Arc::new(GatherEngine::new(
            sender.clone(),
            conf.request_timeout(),
            reverse_all(conf.reverser_id),
            self.counters.clone(),
        ));
        let shared = Arc::new(Shared {
            engine: engine.clone(),
            scatter: ScatterDispatcher::new(sender),
            counters: self.counters.clone(),
            conf,
        });

        let mut tasks = Tasks::new(cancel.clone());
        tasks.spawn(
            engine
                .run_sweeper(shared.conf.sweep_interval(), cancel)
                .instrument(span.clone()),
        );

        // the entry is opened before anything is scattered, but the scatter
        // itself runs on its own task so a slow generator can't hold up the
        // next request
        let on_request = {
            let shared = shared.clone();
            let endpoint = shared.conf.request_input.clone();
            handler(&endpoint.clone(), span.clone(), move |msg| {
                let shared = shared.clone();
                let endpoint = endpoint.clone();
                async move {
                    match msg {
                        Message::RequestList(request) => {
                            if shared.admit(&request) {
                                tokio::spawn(
                                    async move {
                                        shared.scatter(request.list_id).await
                                    }
                                    .in_current_span(),
                                );
                            }
                        }
                        other => unexpected(&endpoint, &other),
                    }
                }
            })
        };
        let on_list = {
            let shared = shared.clone();
            let endpoint = shared.conf.list_input.clone();
            handler(&endpoint.clone(), span.clone(), move |msg| {
                let shared = shared.clone();
                let endpoint = endpoint.clone();
                async move {
                    match msg {
                        Message::IntList(list) => shared.accept(list),
                        other => unexpected(&endpoint, &other),
                    }
                }
            })
        };
        let subscribed = subscribe_all(
            &*self.transport,
            vec![
                (shared.conf.request_input.clone(), on_request),
                (shared.conf.list_input.clone(), on_list),
            ],
        )
        .await;
        if let Err(e) = subscribed {
            tasks.shutdown().await;
            return Err(e);
        }

        span.in_scope(|| {
            info!(
                generators = shared.conf.generators.len(),
                "reverser started"
            )
        });
        self.running = Some((shared, tasks));
        self.state = next;
        Ok(())
    }

    /// Stops taking requests, gives the pending ones the grace period to
    /// finish, then drops whatever is left.
    async fn stop(&mut self) -> Result<()> {
        let Some(next) = self.state.apply(Command::Stop)? else {
            return Ok(());
        };
        let span = self.span();
        if let Some((shared, tasks)) = self.running.take() {
            let conf = &shared.conf;
            unsubscribe_all(&*self.transport, &[conf.request_input.clone()])
                .await;

            let leftover = shared
                .engine
                .drain(conf.stop_grace())
                .instrument(span.clone())
                .await;
            for retired in &leftover {
                span.in_scope(|| {
                    warn!(
                        id = retired.id,
                        collected = retired.collected.len(),
                        expected = retired.expected,
                        "dropping request still pending at stop"
                    )
                });
            }
            self.counters.dropped_deliveries.add(leftover.len() as u64);

            unsubscribe_all(&*self.transport, &[conf.list_input.clone()]).await;
            tasks.shutdown().await;
            span.in_scope(|| debug!("background tasks stopped"));
        }
        self.state = next;

        span.in_scope(|| {
            info!(
                received = self.counters.lists_received.total(),
                sent = self.counters.lists_sent.total(),
                flushed = self.counters.force_flushed.total(),
                "reverser stopped"
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
