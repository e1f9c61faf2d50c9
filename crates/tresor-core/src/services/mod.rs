//! External collaborators of the key-management core.
//!
//! The core consumes three services: the identity service (who is logged
//! in, which devices does a user have, what does an assertion resolve to),
//! the key-halves server (stores the server half of every wrapping), and
//! the metadata server (authoritative folder handles).
//!
//! Traits must be:
//! - `Clone`: shared across managers and tasks
//! - `Send + Sync`: called from concurrent resolver and rekey tasks
//! - Async: every method may suspend on network I/O; cancellation is
//!   cooperative by dropping the returned future
//!
//! In-memory reference implementations live in [`memory`] and are exported
//! here; integration tests and simulations share them.

mod memory;

use std::{collections::BTreeMap, future::Future};

use thiserror::Error;
use tresor_crypto::{DevicePublicKey, Kid, ServerHalf, ServerHalfId};

pub use memory::{MemoryIdentity, MemoryKeyHalfStore, MemoryMetadataOps};

use crate::{
    handle::FolderHandle,
    id::{FolderId, UserId, UserInfo, Username},
};

/// Errors from the external services.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service could not be reached or failed internally.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// The identity service: sessions, device keys, and assertion resolution.
pub trait IdentityService: Clone + Send + Sync + 'static {
    /// The logged-in user.
    fn current_user(&self) -> impl Future<Output = Result<UserInfo, ServiceError>> + Send;

    /// The logged-in device's public key.
    fn current_device_key(
        &self,
    ) -> impl Future<Output = Result<DevicePublicKey, ServiceError>> + Send;

    /// All of a user's current device public keys.
    ///
    /// Revoked devices are absent from the result.
    fn device_keys(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Vec<DevicePublicKey>, ServiceError>> + Send;

    /// Drops any locally cached state for a user, so the next
    /// [`Self::device_keys`] call observes fresh data.
    fn flush_user_cache(&self, user: UserId) -> impl Future<Output = ()> + Send;

    /// Resolves an assertion to a user, if it currently resolves.
    fn resolve_assertion(
        &self,
        assertion: &str,
    ) -> impl Future<Output = Result<Option<UserInfo>, ServiceError>> + Send;

    /// A user's current canonical name.
    fn username_of(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Username, ServiceError>> + Send;

    /// Verifies the identities of a set of users before key material is
    /// produced for them.
    fn identify_users(
        &self,
        users: &[UserId],
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// The key-halves server.
///
/// Stores the server half of every device wrapping, keyed by
/// [`ServerHalfId`]. Halves are never colocated with the client halves in
/// folder metadata.
pub trait KeyHalfStore: Clone + Send + Sync + 'static {
    /// Fetches one server half.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotFound` for unknown IDs (including halves
    /// deleted by a revocation).
    fn server_half(
        &self,
        id: ServerHalfId,
        device: DevicePublicKey,
    ) -> impl Future<Output = Result<ServerHalf, ServiceError>> + Send;

    /// Stores a batch of freshly created server halves.
    fn put_server_halves(
        &self,
        halves: BTreeMap<ServerHalfId, ServerHalf>,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Deletes one server half for a revoked device. Idempotent.
    fn delete_server_half(
        &self,
        user: UserId,
        device: Kid,
        id: ServerHalfId,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// Folder-handle operations against the metadata server.
pub trait MetadataOps: Clone + Send + Sync + 'static {
    /// The server's latest handle for a folder, including any conflict
    /// marker.
    fn latest_handle(
        &self,
        folder: FolderId,
    ) -> impl Future<Output = Result<FolderHandle, ServiceError>> + Send;
}
