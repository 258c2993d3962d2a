//! The `wxmind-report` crate defines the data layer for the wxmind
//! system: the consolidated weather [`Report`], the wire-format record
//! types and decoders for the station unit's two channels, and the
//! [`ReportStore`] that merges both channels into a single deduplicated
//! snapshot.
//!
//! The store is the only holder of the report. It exposes a narrow,
//! total merge API:
//! 1. [`ReportStore::merge_from_pull`] applies a full condition set
//!    fetched over the pull channel, dispatching each record by its
//!    wire discriminator (sensor suite, barometer, indoor climate).
//! 2. [`ReportStore::merge_from_push`] applies the narrow wind/rain
//!    subset carried by push-channel broadcasts.
//! 3. [`ReportStore::replace_from_serialized`] hydrates the report
//!    wholesale from a compressed snapshot produced by
//!    [`ReportStore::encode`] in another process.
//!
//! All three funnel through one finalize step: content-hash the
//! candidate report, gate on the receiver-health fields, compare to the
//! previous hash, and on change emit a coalescing notification on a
//! capacity-1 queue. Consumers re-read the current snapshot on every
//! wake-up, so dropped wake-ups never drop data.

mod records;
mod report;

pub use records::{
    decode_lease_response, decode_pull, decode_push, BarometerRecord, BatteryState, DecodeError,
    IndoorClimateRecord, LeaseGrant, LeaseResponse, PullConditions, PullRecord, PullResponse,
    PushConditions, PushRecord, SensorSuiteRecord, SignalState, UnitError,
};
pub use report::{Report, ReportError, ReportStore};
