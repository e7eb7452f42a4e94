//! The three participants of the list-reversal application, wired on top of
//! the engine.
//!
//! A validator paces requests, asks every generator to create a list for
//! each one and asks a reverser to collect them. The reverser gathers the
//! lists from the generators, reverses each and hands the aggregate back.
//! Generators also forward a copy of every original to the validator, which
//! pairs it with the reversed copy and checks the round trip.

use std::{future::Future, sync::Arc};

use chrono::Utc;
use futures::{future, FutureExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn, Instrument, Span};

use crate::{
    error::{Error, Result},
    net::{
        wire::{Frame, Message},
        EndpointRef, Handler, Transport,
    },
};

pub mod generator;
pub mod reverser;
pub mod validator;

pub use generator::{Generator, ListMode};
pub use reverser::Reverser;
pub use validator::Validator;

/// Decodes every inbound frame and hands the message to `on_message`, inside
/// `span`. Frames that fail to decode are logged and dropped.
fn handler<F, Fut>(endpoint: &EndpointRef, span: Span, on_message: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let endpoint = endpoint.clone();
    Arc::new(move |frame: Frame| match frame.decode() {
        Ok((sent_at, msg)) => {
            span.in_scope(|| {
                trace!(
                    %endpoint,
                    id = msg.list_id(),
                    transit_us = (Utc::now() - sent_at)
                        .num_microseconds()
                        .unwrap_or_default(),
                    "received {:?}",
                    msg.msg_type()
                )
            });
            on_message(msg).instrument(span.clone()).boxed()
        }
        Err(e) => {
            span.in_scope(|| {
                warn!(%endpoint, "dropping undecodable frame: {}", e)
            });
            future::ready(()).boxed()
        }
    })
}

fn unexpected(endpoint: &EndpointRef, msg: &Message) {
    warn!(
        %endpoint,
        id = msg.list_id(),
        "{}",
        Error::UnexpectedMessage(msg.msg_type())
    );
}

/// Subscribes every handler, or none of them.
async fn subscribe_all(
    transport: &dyn Transport,
    subscriptions: Vec<(EndpointRef, Handler)>,
) -> Result<()> {
    let mut subscribed = Vec::with_capacity(subscriptions.len());
    for (endpoint, handler) in subscriptions {
        if let Err(e) = transport.subscribe(&endpoint, handler).await {
            unsubscribe_all(transport, &subscribed).await;
            return Err(e);
        }
        subscribed.push(endpoint);
    }
    Ok(())
}

async fn unsubscribe_all(transport: &dyn Transport, endpoints: &[EndpointRef]) {
    for endpoint in endpoints {
        if let Err(e) = transport.unsubscribe(endpoint).await {
            warn!(%endpoint, "could not unsubscribe: {}", e);
        }
    }
}

/// Background work belonging to a running module.
struct Tasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    /// Cancels everything and waits for the tasks to wind down.
    async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("background task failed: {}", e);
            }
        }
    }
}
