//! Signing service abstraction and public-key registry.
//!
//! The ledger never touches private keys: writers sign through a
//! [`SigningService`] and every signature is checked against the
//! [`KeyRegistry`] as a [`SignatureVerifier`].

pub mod crypto;
pub mod custody;
pub mod error;
pub mod registry;

pub use custody::{SigningService, SoftwareKeyCustody};
pub use error::SigningError;
pub use registry::{FinalizedRotation, KeyRegistry, SignatureVerifier};
