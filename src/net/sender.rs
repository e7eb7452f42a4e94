use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use typed_builder::TypedBuilder;

use super::{
    wire::{Frame, Message},
    EndpointRef, Transport,
};
use crate::error::{Error, Result};

/// How hard a sender tries before giving up on a destination.
///
/// Built from the `send_attempts` and `send_timeout_ms` fields of each role's
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct RetryPolicy {
    /// Immediate attempts per message, never unbounded.
    #[builder(default = 100)]
    pub max_attempts: u32,
    /// How long a single attempt may block.
    #[builder(default = Duration::from_millis(100))]
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Sends typed messages through a transport with a bounded retry loop.
///
/// Every timed out attempt is reported as a warning. Once the attempts are
/// used up the caller gets `RetriesExhausted` and decides whether to drop or
/// requeue. Retrying also stops as soon as `cancel` fires, so a dead
/// destination can never hold up shutdown.
#[derive(Clone)]
pub struct RetryingSender {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// A single attempt. Timeouts come back as `DeliveryTimeout`.
    pub async fn send(
        &self,
        destination: &EndpointRef,
        msg: &Message,
    ) -> Result<()> {
        let frame = Frame::encode(msg)?;
        self.transport
            .send(destination, frame, self.policy.timeout)
            .await
    }

    /// Retries timed out attempts up to the policy's limit. Any other
    /// failure is returned straight away.
    pub async fn send_with_retry(
        &self,
        destination: &EndpointRef,
        msg: &Message,
    ) -> Result<()> {
        let id = msg.list_id();
        let frame = Frame::encode(msg)?;
        let timeout_ms = self.policy.timeout.as_millis() as u64;
        for attempt in 1..=self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                Err(Error::Stopped)?
            }
            match self
                .transport
                .send(destination, frame.clone(), self.policy.timeout)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::DeliveryTimeout { .. }) => {
                    warn!(
                        %destination,
                        id,
                        attempt,
                        timeout_ms,
                        "timed out sending {:?}",
                        msg.msg_type()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::RetriesExhausted {
            destination: destination.clone(),
            id,
            attempts: self.policy.max_attempts,
        })
    }

    /// Like `send_with_retry`, but drops the message with an error event
    /// when it can't be delivered. Returns true if it was delivered.
    pub async fn deliver_or_drop(
        &self,
        destination: &EndpointRef,
        msg: &Message,
    ) -> bool {
        match self.send_with_retry(destination, msg).await {
            Ok(()) => true,
            Err(Error::Stopped) => false,
            Err(e) => {
                error!(
                    %destination,
                    id = msg.list_id(),
                    "dropping {:?}: {}",
                    msg.msg_type(),
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{local::LocalTransport, wire::CreateList};

    fn create(list_id: u32) -> Message {
        Message::CreateList(CreateList {
            list_id,
            list_size: 1,
        })
    }

    fn sender(
        transport: &LocalTransport,
        max_attempts: u32,
    ) -> (RetryingSender, CancellationToken) {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::builder()
            .max_attempts(max_attempts)
            .timeout(Duration::from_millis(50))
            .build();
        (
            RetryingSender::new(
                Arc::new(transport.clone()),
                policy,
                cancel.clone(),
            ),
            cancel,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("stuck");
        transport.declare(&ep, 1);
        let (sender, _cancel) = sender(&transport, 3);

        sender.send_with_retry(&ep, &create(1)).await.unwrap();
        let started = tokio::time::Instant::now();
        let err = sender.send_with_retry(&ep, &create(2)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RetriesExhausted { id: 2, attempts: 3, .. }
        ));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(!sender.deliver_or_drop(&ep, &create(3)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_space_frees_up() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("slow");
        transport.declare(&ep, 1);
        let (sender, _cancel) = sender(&transport, 10);
        sender.send(&ep, &create(1)).await.unwrap();

        let drain = {
            let transport = transport.clone();
            let ep = ep.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                transport.receive(&ep, Duration::from_millis(10)).await
            })
        };
        sender.send_with_retry(&ep, &create(2)).await.unwrap();
        drain.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let transport = LocalTransport::new();
        let ep = EndpointRef::new("stuck");
        transport.declare(&ep, 1);
        let (sender, cancel) = sender(&transport, 100);
        sender.send(&ep, &create(1)).await.unwrap();

        cancel.cancel();
        let err = sender.send_with_retry(&ep, &create(2)).await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test]
    async fn unknown_destination_is_not_retried() {
        let transport = LocalTransport::new();
        let (sender, _cancel) = sender(&transport, 100);
        let err = sender
            .send_with_retry(&EndpointRef::new("gone"), &create(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable(_)));
    }
}
