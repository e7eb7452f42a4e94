use futures::future::join_all;
use tracing::{debug, error};

use crate::{
    net::{sender::RetryingSender, wire::Message, EndpointRef},
    Identifier,
};

/// How a fan-out went.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScatterReport {
    /// Legs that were tried. This, not `delivered`, is what the gather side
    /// must expect answers from.
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<EndpointRef>,
}

/// Sends one request per destination, all legs concurrently.
///
/// A leg that times out through every retry is reported and left behind; it
/// never holds up or cancels the others. The missing answer then shows up on
/// the gather side as a short, force-flushed aggregate.
#[derive(Clone)]
pub struct ScatterDispatcher {
    sender: RetryingSender,
}

impl ScatterDispatcher {
    pub fn new(sender: RetryingSender) -> Self {
        Self { sender }
    }

    pub async fn dispatch<F>(
        &self,
        id: Identifier,
        destinations: &[EndpointRef],
        make: F,
    ) -> ScatterReport
    where
        F: Fn(&EndpointRef) -> Message,
    {
        let legs = destinations.iter().map(|destination| {
            let msg = make(destination);
            async move {
                let sent = self.sender.send_with_retry(destination, &msg).await;
                (destination, sent)
            }
        });

        let mut report = ScatterReport {
            attempted: destinations.len(),
            ..Default::default()
        };
        for (destination, sent) in join_all(legs).await {
            match sent {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    error!(id, %destination, "fan-out leg failed: {}", e);
                    report.failed.push(destination.clone());
                }
            }
        }
        debug!(
            id,
            attempted = report.attempted,
            delivered = report.delivered,
            "scattered request"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::net::{
        local::LocalTransport, sender::RetryPolicy, wire::RequestList,
        Transport,
    };

    #[tokio::test(start_paused = true)]
    async fn one_dead_leg_does_not_block_the_rest() {
        let transport = LocalTransport::new();
        let destinations = ["g0", "g1", "g2"]
            .into_iter()
            .map(EndpointRef::new)
            .collect::<Vec<_>>();
        for ep in &destinations {
            transport.declare(ep, 1);
        }
        // g1 is already full and nobody drains it
        transport
            .send(
                &destinations[1],
                crate::net::wire::Frame::encode(&Message::RequestList(
                    RequestList {
                        list_id: 0,
                        destination: "x".into(),
                    },
                ))
                .unwrap(),
                Duration::from_millis(1),
            )
            .await
            .unwrap();

        let dispatcher = ScatterDispatcher::new(RetryingSender::new(
            Arc::new(transport.clone()),
            RetryPolicy::builder()
                .max_attempts(3)
                .timeout(Duration::from_millis(10))
                .build(),
            CancellationToken::new(),
        ));
        let report = dispatcher
            .dispatch(9, &destinations, |_| {
                Message::RequestList(RequestList {
                    list_id: 9,
                    destination: "reverser".into(),
                })
            })
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![destinations[1].clone()]);
        for ep in [&destinations[0], &destinations[2]] {
            let frame = transport
                .receive(ep, Duration::from_millis(1))
                .await
                .unwrap();
            assert_eq!(frame.decode().unwrap().1.list_id(), 9);
        }
    }

    #[tokio::test]
    async fn empty_fan_out_attempts_nothing() {
        let transport = LocalTransport::new();
        let dispatcher = ScatterDispatcher::new(RetryingSender::new(
            Arc::new(transport),
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let report = dispatcher
            .dispatch(1, &[], |_| unreachable!())
            .await;
        assert_eq!(report, ScatterReport::default());
    }
}
