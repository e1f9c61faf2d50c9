//! Error types for the cryptographic facade.

use thiserror::Error;

/// Errors from cryptographic operations.
///
/// Decryption failures and missing secret keys are reported separately:
/// the key resolver treats both as "this device has no usable wrapping"
/// and escalates to a rekey request, while bad inputs indicate corrupt
/// metadata and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication or unsealing failed (wrong key, or tampering).
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// What was being decrypted when the failure occurred
        reason: String,
    },

    /// No local secret key could open any of the offered wrappings.
    #[error("no secret key could decrypt any of {tried} candidate wrappings")]
    NoSecretKey {
        /// Number of candidate wrappings tried
        tried: usize,
    },

    /// Structurally invalid input (wrong length, bad index).
    #[error("bad input: {0}")]
    BadInput(String),
}
