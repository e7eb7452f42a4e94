//! The correlation core. Nothing in here knows about generators or
//! reversers: it tracks identifiers, paces them, fans them out, gathers
//! whatever comes back and checks the round trip.

pub mod admission;
pub mod cache;
pub mod counters;
pub mod gather;
pub mod pending;
pub mod scatter;
pub mod validate;

pub use admission::{Admission, Outstanding, RateLimitedAdmission};
pub use cache::BoundedCache;
pub use counters::{CounterSnapshot, Counters, Sample};
pub use gather::{Aggregate, GatherEngine};
pub use pending::{Completion, PartialResult, PendingRequestTable, Retired};
pub use scatter::{ScatterDispatcher, ScatterReport};
pub use validate::{RoundTripValidator, Verdict};
