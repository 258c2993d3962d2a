//! The `wxmind-engine` crate is the acquisition engine for the wxmind
//! system: it keeps a continuously fresh consolidated weather report for
//! a single station unit on the local network, merging the unit's two
//! independent channels into the shared
//! [`ReportStore`](wxmind_report::ReportStore).
//!
//! The engine is composed of task loops coordinated through a hierarchy
//! of cancellation tokens that mirrors component ownership:
//! 1. The address resolver locates the unit via an external [`Locator`]
//!    and re-verifies the address on the advertised record lifetime
//!    (managed clients only).
//! 2. The conditions poller fetches the full condition set over the
//!    pull channel on a fixed period.
//! 3. The broadcast receiver listens for push-channel datagrams while a
//!    lease watchdog re-provisions the time-limited broadcast lease
//!    whenever the channel goes quiet.
//!
//! The [`Client`] facade owns the cancellation tree and the completion
//! barrier, and exposes the snapshot read, the coalescing change
//! notification, and graceful shutdown. Cancelling the token passed at
//! construction is the only way to stop the engine; every channel
//! failure is logged and retried under that component's own policy.

mod address;
mod client;
mod poller;
mod receiver;
mod resolver;
mod transport;

pub use address::{
    AddressError, Locator, LocatorError, LookupQuery, ServiceRecord, UnitAddress,
    DEFAULT_UNIT_PORT,
};
pub use client::{Client, ClientError, EngineState};
pub use transport::{HttpTransport, PullTransport, TransportError};
