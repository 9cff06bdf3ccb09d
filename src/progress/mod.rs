//! Progress aggregation: inbound event normalization, deduplication, the
//! per-exam session registry and the push streams clients subscribe to.

pub(crate) mod dedup;
pub(crate) mod event;
pub(crate) mod hub;
pub(crate) mod registry;
pub(crate) mod reports;
pub(crate) mod router;
pub(crate) mod session;
pub(crate) mod transport;

pub(crate) use hub::{ProgressHub, UrlPresigner};
pub(crate) use router::{DispatchOutcome, EventSource};
