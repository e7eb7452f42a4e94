use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::Result;

pub mod local;
pub mod sender;
pub mod wire;

use wire::Frame;

/// A named place messages can be sent to or received from.
///
/// Cheap to clone, so it can be stamped onto every message and log event.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EndpointRef(Arc<str>);

impl EndpointRef {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EndpointRef {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&str> for EndpointRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<EndpointRef> for String {
    fn from(endpoint: EndpointRef) -> Self {
        endpoint.0.to_string()
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Called once per inbound frame on a subscribed endpoint. Frames for one
/// endpoint are handed over in arrival order, and the next frame is not
/// delivered until the returned future resolves.
pub type Handler = Arc<dyn Fn(Frame) -> BoxFuture<'static, ()> + Send + Sync>;

/// The wire collaborator. Implementations move opaque frames between named
/// endpoints; everything above this trait deals in typed messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempts a single delivery. Fails with `DeliveryTimeout` if the
    /// destination could not accept the frame within `timeout`.
    async fn send(
        &self,
        destination: &EndpointRef,
        frame: Frame,
        timeout: Duration,
    ) -> Result<()>;

    /// Waits up to `timeout` for the next frame on `source`.
    async fn receive(
        &self,
        source: &EndpointRef,
        timeout: Duration,
    ) -> Result<Frame>;

    /// Routes every frame arriving on `source` to `handler` until
    /// `unsubscribe` is called.
    async fn subscribe(&self, source: &EndpointRef, handler: Handler)
        -> Result<()>;

    async fn unsubscribe(&self, source: &EndpointRef) -> Result<()>;

    /// Returns true if frames can be routed to `endpoint`.
    fn is_reachable(&self, endpoint: &EndpointRef) -> bool;
}

/// Fails with `ConnectionUnavailable` for the first endpoint the transport
/// cannot reach. Used at startup, where a missing channel is fatal.
pub fn ensure_reachable<'a>(
    transport: &dyn Transport,
    endpoints: impl IntoIterator<Item = &'a EndpointRef>,
) -> Result<()> {
    for endpoint in endpoints {
        if !transport.is_reachable(endpoint) {
            Err(crate::Error::ConnectionUnavailable(endpoint.clone()))?
        }
    }
    Ok(())
}
