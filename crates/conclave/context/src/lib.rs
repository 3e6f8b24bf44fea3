//! Context bundles.
//!
//! A bundle fixes a ledger position (`as_of_sequence`, `as_of_hash`) and
//! carries content-addressed references to the identity, state and
//! precedents visible at that position. Bundles are signed, stored once and
//! served back byte for byte.

pub mod builder;
pub mod bundle;
pub mod error;
pub mod store;
pub mod verifier;

#[cfg(test)]
mod test_support;

pub use builder::{ContextBuilder, ContextConfig};
pub use bundle::{ContextBundle, PrecedentRef, StateRef};
pub use error::{ContextError, ContextResult};
pub use store::{BundleStore, FileBundleStore, MemoryBundleStore};
pub use verifier::BundleVerifier;
