//! Thin Ed25519 helpers over `ed25519-dalek`.

use conclave_types::SignatureBytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::SigningError;

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn public_key_hex(key: &VerifyingKey) -> String {
    hex_encode(key.as_bytes())
}

pub fn secret_key_hex(key: &SigningKey) -> String {
    hex_encode(&key.to_bytes())
}

pub fn signing_key_from_hex(hex: &str) -> Result<SigningKey, SigningError> {
    let bytes = hex_decode(hex).ok_or_else(|| SigningError::MalformedKey("invalid hex".into()))?;
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::MalformedKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    Ok(SigningKey::from_bytes(&secret))
}

pub fn parse_public_key(hex: &str) -> Result<VerifyingKey, SigningError> {
    let bytes = hex_decode(hex).ok_or_else(|| SigningError::MalformedKey("invalid hex".into()))?;
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::MalformedKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&raw).map_err(|e| SigningError::MalformedKey(e.to_string()))
}

pub fn sign_with(key: &SigningKey, message: &[u8]) -> SignatureBytes {
    SignatureBytes::new(key.sign(message).to_bytes().to_vec())
}

/// Strict Ed25519 verification. Any malformed input is a verification failure.
pub fn verify_with(
    key: &VerifyingKey,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<(), SigningError> {
    let raw: [u8; 64] = signature
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::MalformedSignature)?;
    let signature = Signature::from_bytes(&raw);
    key.verify_strict(message, &signature)
        .map_err(|_| SigningError::MalformedSignature)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    SignatureBytes::from_hex(hex).map(|b| b.0)
}
