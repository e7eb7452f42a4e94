use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    lifecycle::ModuleState,
    net::{wire::MessageType, EndpointRef},
    Identifier, WorkerID,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no entry with id {0} was found")]
    NotFound(u64),
    #[error("an entry with id {0} already exists")]
    DuplicateKey(u64),
    #[error("timed out after {}ms delivering to {destination}", timeout.as_millis())]
    DeliveryTimeout {
        destination: EndpointRef,
        timeout: Duration,
    },
    #[error("timed out after {}ms receiving from {endpoint}", timeout.as_millis())]
    ReceiveTimeout {
        endpoint: EndpointRef,
        timeout: Duration,
    },
    #[error("gave up delivering request {id} to {destination} after {attempts} attempts")]
    RetriesExhausted {
        destination: EndpointRef,
        id: Identifier,
        attempts: u32,
    },
    #[error("result from worker {worker} for unknown or retired request {id}")]
    LateArrival { id: Identifier, worker: WorkerID },
    #[error("request {0} is already pending")]
    AlreadyPending(Identifier),
    #[error("endpoint {0} is not available")]
    ConnectionUnavailable(EndpointRef),
    #[error("endpoint {0} already has a subscriber")]
    AlreadySubscribed(EndpointRef),
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("frame is {0} bytes, too short to hold a header")]
    TruncatedFrame(usize),
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("message length overflowed")]
    MessageLengthOverflowed,
    #[error("received an unexpected {0:?} message")]
    UnexpectedMessage(MessageType),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cannot {command} a module that is {state:?}")]
    InvalidTransition {
        command: &'static str,
        state: ModuleState,
    },
    #[error("stopped before the operation could finish")]
    Stopped,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for errors that only concern a single message or
    /// identifier and must never take the engine down.
    pub fn is_contained(&self) -> bool {
        !matches!(
            self,
            Error::ConnectionUnavailable(_)
                | Error::InvalidConfig(_)
                | Error::InvalidTransition { .. }
                | Error::Io(_)
                | Error::Json(_)
        )
    }
}
