use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{wire::Frame, EndpointRef, Handler, Transport};
use crate::error::{Error, Result};

/// Default number of frames a mailbox buffers before senders start timing
/// out.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 100;

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Mailbox {
    tx: mpsc::Sender<Frame>,
    /// Held by the subscriber task for as long as it runs, so `receive` and
    /// a subscription never compete for frames.
    rx: Arc<AsyncMutex<mpsc::Receiver<Frame>>>,
    subscription: Mutex<Option<Subscription>>,
}

/// An in-process transport. Every declared endpoint is a bounded mailbox, so
/// a slow or absent consumer eventually makes senders time out exactly like a
/// congested network link would.
///
/// Can be cloned to obtain another handle to the same set of mailboxes.
#[derive(Clone, Default)]
pub struct LocalTransport {
    mailboxes: Arc<Mutex<HashMap<EndpointRef, Arc<Mailbox>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mailbox for `endpoint` holding up to `capacity` frames.
    /// Declaring an endpoint twice keeps the existing mailbox.
    pub fn declare(&self, endpoint: &EndpointRef, capacity: usize) {
        self.mailboxes
            .lock()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!(%endpoint, capacity, "declared endpoint");
                let (tx, rx) = mpsc::channel(capacity.max(1));
                Arc::new(Mailbox {
                    tx,
                    rx: Arc::new(AsyncMutex::new(rx)),
                    subscription: Mutex::new(None),
                })
            });
    }

    fn mailbox(&self, endpoint: &EndpointRef) -> Result<Arc<Mailbox>> {
        self.mailboxes
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::ConnectionUnavailable(endpoint.clone()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        destination: &EndpointRef,
        frame: Frame,
        timeout: Duration,
    ) -> Result<()> {
        let mailbox = self.mailbox(destination)?;
        match tokio::time::timeout(timeout, mailbox.tx.send(frame)).await {
            Ok(Ok(())) => {
                trace!(%destination, "frame delivered");
                Ok(())
            }
            Ok(Err(_)) => Err(Error::ConnectionUnavailable(destination.clone())),
            Err(_) => Err(Error::DeliveryTimeout {
                destination: destination.clone(),
                timeout,
            }),
        }
    }

    async fn receive(
        &self,
        source: &EndpointRef,
        timeout: Duration,
    ) -> Result<Frame> {
        let mailbox = self.mailbox(source)?;
        let received = tokio::time::timeout(timeout, async {
            mailbox.rx.lock().await.recv().await
        })
        .await;
        match received {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(Error::ConnectionUnavailable(source.clone())),
            Err(_) => Err(Error::ReceiveTimeout {
                endpoint: source.clone(),
                timeout,
            }),
        }
    }

    async fn subscribe(
        &self,
        source: &EndpointRef,
        handler: Handler,
    ) -> Result<()> {
        let mailbox = self.mailbox(source)?;
        let mut subscription = mailbox.subscription.lock();
        if subscription.is_some() {
            Err(Error::AlreadySubscribed(source.clone()))?
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let rx = mailbox.rx.clone();
            let source = source.clone();
            async move {
                let mut rx = select! {
                    _ = cancel.cancelled() => return,
                    rx = rx.lock_owned() => rx,
                };
                debug!(%source, "subscriber attached");
                loop {
                    select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        frame = rx.recv() => match frame {
                            Some(frame) => handler(frame).await,
                            None => break,
                        },
                    }
                }
                debug!(%source, "subscriber detached");
            }
        });
        *subscription = Some(Subscription { cancel, task });
        Ok(())
    }

    async fn unsubscribe(&self, source: &EndpointRef) -> Result<()> {
        let mailbox = self.mailbox(source)?;
        let subscription = mailbox.subscription.lock().take();
        if let Some(Subscription { cancel, task }) = subscription {
            cancel.cancel();
            // the task only finishes once it has released the receiver
            let _ = task.await;
        }
        Ok(())
    }

    fn is_reachable(&self, endpoint: &EndpointRef) -> bool {
        self.mailboxes.lock().contains_key(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::net::wire::{CreateList, Message};

    fn frame(list_id: u32) -> Frame {
        Frame::encode(&Message::CreateList(CreateList {
            list_id,
            list_size: 3,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn send_then_receive() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("creates");
        transport.declare(&ep, 4);

        transport
            .send(&ep, frame(1), Duration::from_millis(10))
            .await
            .unwrap();
        let received = transport
            .receive(&ep, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(received.decode().unwrap().1.list_id(), 1);
    }

    #[tokio::test]
    async fn undeclared_endpoints_are_unavailable() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("nowhere");
        assert!(!transport.is_reachable(&ep));
        let err = transport
            .send(&ep, frame(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn full_mailbox_times_out() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("tiny");
        transport.declare(&ep, 1);
        let timeout = Duration::from_millis(100);

        transport.send(&ep, frame(1), timeout).await.unwrap();
        let err = transport.send(&ep, frame(2), timeout).await.unwrap_err();
        assert!(matches!(err, Error::DeliveryTimeout { .. }));

        transport.receive(&ep, timeout).await.unwrap();
        let err = transport.receive(&ep, timeout).await.unwrap_err();
        assert!(matches!(err, Error::ReceiveTimeout { .. }));
    }

    #[tokio::test]
    async fn subscription_sees_frames_until_unsubscribed() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("lists");
        transport.declare(&ep, 8);
        let seen = Arc::new(AtomicUsize::new(0));

        let handler: Handler = {
            let seen = seen.clone();
            Arc::new(move |_frame| {
                seen.fetch_add(1, Ordering::SeqCst);
                async {}.boxed()
            })
        };
        transport.subscribe(&ep, handler.clone()).await.unwrap();
        assert!(matches!(
            transport.subscribe(&ep, handler).await,
            Err(Error::AlreadySubscribed(_))
        ));

        for id in 0..3 {
            transport
                .send(&ep, frame(id), Duration::from_millis(10))
                .await
                .unwrap();
        }
        while seen.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }

        transport.unsubscribe(&ep).await.unwrap();
        transport
            .send(&ep, frame(9), Duration::from_millis(10))
            .await
            .unwrap();
        // with the subscriber gone the frame waits for an explicit receive
        let received = transport
            .receive(&ep, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(received.decode().unwrap().1.list_id(), 9);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
