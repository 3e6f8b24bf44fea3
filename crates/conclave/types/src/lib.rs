//! Core types for the Conclave constitutional ledger.
//!
//! Everything that crosses a crate boundary lives here: identifiers, the
//! content hash, the closed event catalogue, ceremony vocabulary, key records,
//! the injectable clock, and the error classification every component's error
//! type reports through.

pub mod ceremony;
pub mod clock;
pub mod error;
pub mod event;
pub mod hash;
pub mod ids;
pub mod key;

pub use ceremony::{CeremonyState, CeremonySubject, CeremonyType, Tier};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Classified, ErrorClass};
pub use event::{
    signable_bytes, witness_message, Event, EventDraft, EventPayload, EventType, LedgerHead,
    SignatureBytes, WitnessRef,
};
pub use hash::{ContentHash, ContentHashError};
pub use ids::{ApproverId, BundleId, CeremonyId, HaltId, KeyId, SessionId, SourceId};
pub use key::{KeyRecord, KeyStatus};
