// GANGLION correlates fan-out/fan-in request traffic between producers and
// consumers that only share an identifier space and a handful of named
// endpoints. A request is scattered to a fixed set of workers, their partial
// results are gathered back under a capacity bound, and the round trip is
// checked end to end.
//
// The engine is transport agnostic. Everything it needs from the outside
// world goes through the `Transport` trait in `net`, and the roles in `roles`
// are the three cooperating participants (generators, reversers and a
// validator) wired on top of it.

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod net;
#[cfg(feature = "roles")]
pub mod roles;

pub use error::{Error, Result};

/// Correlation key uniting a scattered request with its gathered partial
/// results.
pub type Identifier = u32;

/// Identifies the worker that produced a partial result.
pub type WorkerID = u32;
