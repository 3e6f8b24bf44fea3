use chrono::{DateTime, Utc};
use conclave_types::{Classified, ErrorClass, KeyId, KeyStatus};
use thiserror::Error;

/// Errors from key custody and signature verification.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unknown signing key: {0}")]
    UnknownKey(KeyId),

    #[error("key {key_id} was not valid at {at}")]
    KeyNotValidAt { key_id: KeyId, at: DateTime<Utc> },

    #[error("key {0} is revoked")]
    KeyRevoked(KeyId),

    #[error("signature verification failed for key {0}")]
    InvalidSignature(KeyId),

    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature")]
    MalformedSignature,

    #[error("signed content not encodable: {0}")]
    Unencodable(String),

    #[error("key {key_id} is {actual:?}, expected {expected:?}")]
    InvalidKeyState {
        key_id: KeyId,
        expected: KeyStatus,
        actual: KeyStatus,
    },

    #[error("key {0} already registered with different material")]
    KeyConflict(KeyId),

    #[error("custody does not hold private material for {0}")]
    NotInCustody(KeyId),
}

impl Classified for SigningError {
    fn class(&self) -> ErrorClass {
        match self {
            SigningError::NotInCustody(_) | SigningError::InvalidKeyState { .. } => {
                ErrorClass::Operational
            }
            _ => ErrorClass::Integrity,
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            SigningError::UnknownKey(_) => "SIGNING_UNKNOWN_KEY",
            SigningError::KeyNotValidAt { .. } => "SIGNING_KEY_NOT_VALID",
            SigningError::KeyRevoked(_) => "SIGNING_KEY_REVOKED",
            SigningError::InvalidSignature(_) => "SIGNING_INVALID_SIGNATURE",
            SigningError::MalformedKey(_) => "SIGNING_MALFORMED_KEY",
            SigningError::MalformedSignature => "SIGNING_MALFORMED_SIGNATURE",
            SigningError::Unencodable(_) => "SIGNING_UNENCODABLE",
            SigningError::InvalidKeyState { .. } => "SIGNING_INVALID_KEY_STATE",
            SigningError::KeyConflict(_) => "SIGNING_KEY_CONFLICT",
            SigningError::NotInCustody(_) => "SIGNING_NOT_IN_CUSTODY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_failures_are_integrity_errors() {
        let err = SigningError::InvalidSignature(KeyId::new("k1"));
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "signature verification failed for key key:k1");
    }
}
