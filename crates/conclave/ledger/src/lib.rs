//! Append-only, hash-chained constitutional event ledger.
//!
//! - [`LedgerStore`]: the single canonical writer, holding the head lock
//! - [`EventStorage`]: insert-only backends ([`MemoryEventStorage`], [`WalEventStorage`])
//! - [`EventAuthor`]: signs and appends events for kernel components
//! - [`LedgerReplica`]: read-only follower that re-verifies everything it receives
//! - [`AnomalyTracker`] / [`FaultSink`]: escalation of integrity faults

pub mod anomaly;
pub mod author;
pub mod error;
pub mod replica;
pub mod schema;
pub mod storage;
pub mod store;
pub mod wal;

pub use anomaly::{
    fault_channel, AnomalyConfig, AnomalyTracker, ChannelFaultSink, FaultKind, FaultReport,
    FaultSink,
};
pub use author::EventAuthor;
pub use error::LedgerError;
pub use replica::{LedgerReplica, ReplicaConfig, ReplicaStatus};
pub use schema::{EventSchema, SchemaRegistry};
pub use storage::{EventStorage, MemoryEventStorage, WalEventStorage};
pub use store::{ChainBreak, ChainReport, LedgerSource, LedgerStore};
pub use wal::{MemoryStorage, SyncMode, WalConfig, WalIntegrityReport};
