//! Process-wide halt gate.
//!
//! Every mutating operation calls [`HaltController::check`] before doing
//! work. A halt is carried on two channels (fast in-process broadcast and a
//! durable flag) and stays in force until a witnessed `HaltClear` ceremony
//! clears it.

pub mod channel;
pub mod controller;
pub mod error;
pub mod guard;
pub mod limiter;
pub mod state;

pub use channel::{DurableFlag, FastChannel, FileFlag, MemoryFlag, WatchChannel};
pub use controller::{HaltConfig, HaltController};
pub use error::HaltError;
pub use guard::HaltGuard;
pub use limiter::{Admission, LimiterConfig, TriggerLimiter};
pub use state::{CeremonyRef, HaltEvent, HaltRecord, HaltState, HaltTransition};
