//! Error taxonomy for the key-management core.
//!
//! Strongly-typed errors for the two entry points: key resolution and
//! rekeying. Several variants are state signals rather than failures -
//! `RekeyIncomplete` reports partial progress by a reader, and
//! `NotPerDeviceEncrypted` is the internal cue that historic-chain recovery
//! is required. Cryptographic and service errors wrap transparently so
//! callers can still match on the underlying cause.

use thiserror::Error;
use tresor_crypto::CryptoError;

use crate::{
    id::{FolderId, KeyGen, Username},
    services::ServiceError,
};

/// Errors from key resolution and rekeying.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The requested generation is below the first valid one.
    #[error("invalid key generation {generation} for folder {folder}")]
    InvalidKeyGeneration {
        /// Folder the request was for
        folder: FolderId,
        /// The out-of-range generation
        generation: KeyGen,
    },

    /// The requested generation is newer than the metadata's latest.
    ///
    /// Callers should have observed the metadata that introduced the
    /// generation; this is a failsafe against stale metadata.
    #[error("unknown key generation {generation} for folder {folder}")]
    NewKeyGeneration {
        /// Folder the request was for
        folder: FolderId,
        /// The not-yet-known generation
        generation: KeyGen,
    },

    /// The caller has no usable device wrapping at this generation and
    /// must be rekeyed by a device that does.
    #[error(
        "{username} has no device key for generation {generation} of folder {folder}; \
         another device must rekey"
    )]
    RekeyRead {
        /// Folder the request was for
        folder: FolderId,
        /// Generation that lacked a wrapping
        generation: KeyGen,
        /// The caller
        username: Username,
    },

    /// A non-writer attempted an operation reserved for writers.
    #[error("{username} is not a writer of folder {folder}")]
    ReadAccess {
        /// Folder the request was for
        folder: FolderId,
        /// The caller
        username: Username,
    },

    /// A reader finished the part of a rekey it was allowed to perform;
    /// another party must complete the rest.
    ///
    /// Not a failure: `md_changed` reports truthfully whether the
    /// in-memory metadata was modified and should be pushed.
    #[error("rekey performed partially (metadata changed: {md_changed}); another party must finish")]
    RekeyIncomplete {
        /// Whether the metadata was modified before stopping
        md_changed: bool,
    },

    /// The generation carries no per-device wrappings; recover through the
    /// historic key chain instead. Never escapes key resolution.
    #[error("generation {generation} of folder {folder} is not per-device encrypted")]
    NotPerDeviceEncrypted {
        /// Folder the request was for
        folder: FolderId,
        /// The historic generation
        generation: KeyGen,
    },

    /// Metadata received from an untrusted source cannot be mutated
    /// locally.
    #[error("metadata is not locally mutable")]
    MutableMetadataNotImpl,

    /// No cached key for this (folder, generation) pair. Internal sentinel.
    #[error("no cached key for generation {generation} of folder {folder}")]
    KeyCacheMiss {
        /// Folder probed
        folder: FolderId,
        /// Generation probed
        generation: KeyGen,
    },

    /// The metadata violates a structural invariant.
    #[error("metadata for folder {folder} is inconsistent: {reason}")]
    MetadataInconsistent {
        /// Folder the metadata belongs to
        folder: FolderId,
        /// What was violated
        reason: String,
    },

    /// A paper-key prompt was requested for a public folder.
    #[error("paper key prompt requested for public folder {folder}")]
    PaperPromptForPublic {
        /// The public folder
        folder: FolderId,
    },

    /// Canonical encoding failed.
    #[error("codec failure: {0}")]
    Codec(String),

    /// Underlying cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Underlying service failure.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl KeyError {
    /// Whether this is the partial-progress signal rather than a failure.
    pub fn is_rekey_incomplete(&self) -> bool {
        matches!(self, Self::RekeyIncomplete { .. })
    }

    /// Whether this is the internal cache-miss sentinel.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::KeyCacheMiss { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_is_a_state_signal() {
        assert!(KeyError::RekeyIncomplete { md_changed: true }.is_rekey_incomplete());
        assert!(!KeyError::MutableMetadataNotImpl.is_rekey_incomplete());
    }

    #[test]
    fn crypto_errors_wrap_transparently() {
        let err: KeyError = CryptoError::NoSecretKey { tried: 2 }.into();
        assert!(matches!(err, KeyError::Crypto(CryptoError::NoSecretKey { tried: 2 })));
    }
}
