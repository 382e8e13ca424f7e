//! Core of the zone-aware time-currency ledger simulator: schema, engine,
//! and the invariants that keep the ledger honest under partial failure.

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod hash;
pub mod store;
pub mod throttle;
pub mod types;

pub use engine::LedgerEngine;
pub use error::LedgerError;
pub use hash::canonical_fingerprint;
pub use store::Store;
pub use throttle::{fnv1a32, throttle_admits};
pub use types::{
    Account, AuditEntry, Balance, Direction, Incident, IncidentAction, IncidentActionRequest,
    IncidentStatus, LedgerSnapshot, Posting, ReplayRequest, ReplaySummary, SetControlsRequest,
    SetZoneStatusRequest, Severity, SpoolStatus, SpoolSummary, SpooledTransfer, Transaction,
    TransactionDetail, TransferOutcome, TransferRequest, Zone, ZoneControls, ZoneStatus,
};
