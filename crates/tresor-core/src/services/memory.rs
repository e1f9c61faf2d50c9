//! In-memory service backends.
//!
//! Arc-shared state: clones of a backend observe the same world, so a test
//! can hand the same identity service to several key managers and mutate
//! it (enroll devices, revoke devices, rename users) between calls.
//!
//! # Panics
//!
//! Backends may panic if internal locks are poisoned; acceptable for test
//! and simulation use.

use std::{
    collections::BTreeMap,
    future::{ready, Future},
    sync::Arc,
};

use parking_lot::RwLock;
use tresor_crypto::{DevicePublicKey, Kid, ServerHalf, ServerHalfId};

use crate::{
    handle::FolderHandle,
    id::{FolderId, UserId, UserInfo, Username},
    services::{IdentityService, KeyHalfStore, MetadataOps, ServiceError},
};

#[derive(Debug, Clone)]
struct UserRecord {
    username: Username,
    devices: Vec<DevicePublicKey>,
}

#[derive(Debug, Default)]
struct IdentityState {
    users: BTreeMap<UserId, UserRecord>,
    assertions: BTreeMap<String, UserId>,
    current: Option<(UserId, DevicePublicKey)>,
    flushed: Vec<UserId>,
    identified: Vec<Vec<UserId>>,
}

/// In-memory identity service.
#[derive(Clone, Default)]
pub struct MemoryIdentity {
    state: Arc<RwLock<IdentityState>>,
}

impl MemoryIdentity {
    /// Creates an empty identity world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user with an initial device set.
    pub fn add_user(&self, user: UserId, username: Username, devices: Vec<DevicePublicKey>) {
        self.state.write().users.insert(user, UserRecord { username, devices });
    }

    /// Enrolls an additional device for a user.
    pub fn add_device(&self, user: UserId, device: DevicePublicKey) {
        if let Some(record) = self.state.write().users.get_mut(&user) {
            if !record.devices.contains(&device) {
                record.devices.push(device);
            }
        }
    }

    /// Revokes a device: it disappears from the user's device set.
    pub fn revoke_device(&self, user: UserId, device: &DevicePublicKey) {
        if let Some(record) = self.state.write().users.get_mut(&user) {
            record.devices.retain(|d| d != device);
        }
    }

    /// Sets the logged-in user and device.
    pub fn log_in(&self, user: UserId, device: DevicePublicKey) {
        self.state.write().current = Some((user, device));
    }

    /// Binds an assertion so it resolves to a user.
    pub fn bind_assertion(&self, assertion: impl Into<String>, user: UserId) {
        self.state.write().assertions.insert(assertion.into(), user);
    }

    /// Changes a user's canonical name.
    pub fn rename_user(&self, user: UserId, username: Username) {
        if let Some(record) = self.state.write().users.get_mut(&user) {
            record.username = username;
        }
    }

    /// Users whose caches were flushed, in call order.
    pub fn flushed_users(&self) -> Vec<UserId> {
        self.state.read().flushed.clone()
    }

    /// The user sets passed to `identify_users`, in call order.
    pub fn identified_sets(&self) -> Vec<Vec<UserId>> {
        self.state.read().identified.clone()
    }
}

impl IdentityService for MemoryIdentity {
    fn current_user(&self) -> impl Future<Output = Result<UserInfo, ServiceError>> + Send {
        let state = self.state.read();
        let result = match state.current {
            Some((uid, _)) => match state.users.get(&uid) {
                Some(record) => {
                    Ok(UserInfo { uid, username: record.username.clone() })
                }
                None => Err(ServiceError::NotFound(format!("user {uid}"))),
            },
            None => Err(ServiceError::NotFound("no logged-in user".to_string())),
        };
        ready(result)
    }

    fn current_device_key(
        &self,
    ) -> impl Future<Output = Result<DevicePublicKey, ServiceError>> + Send {
        let result = match self.state.read().current {
            Some((_, device)) => Ok(device),
            None => Err(ServiceError::NotFound("no logged-in device".to_string())),
        };
        ready(result)
    }

    fn device_keys(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Vec<DevicePublicKey>, ServiceError>> + Send {
        let result = self
            .state
            .read()
            .users
            .get(&user)
            .map(|record| record.devices.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("user {user}")));
        ready(result)
    }

    fn flush_user_cache(&self, user: UserId) -> impl Future<Output = ()> + Send {
        self.state.write().flushed.push(user);
        ready(())
    }

    fn resolve_assertion(
        &self,
        assertion: &str,
    ) -> impl Future<Output = Result<Option<UserInfo>, ServiceError>> + Send {
        let state = self.state.read();
        let result = Ok(state.assertions.get(assertion).and_then(|uid| {
            state
                .users
                .get(uid)
                .map(|record| UserInfo { uid: *uid, username: record.username.clone() })
        }));
        ready(result)
    }

    fn username_of(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Username, ServiceError>> + Send {
        let result = self
            .state
            .read()
            .users
            .get(&user)
            .map(|record| record.username.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("user {user}")));
        ready(result)
    }

    fn identify_users(
        &self,
        users: &[UserId],
    ) -> impl Future<Output = Result<(), ServiceError>> + Send {
        let mut state = self.state.write();
        let result = match users.iter().find(|uid| !state.users.contains_key(uid)) {
            Some(unknown) => Err(ServiceError::NotFound(format!("user {unknown}"))),
            None => {
                state.identified.push(users.to_vec());
                Ok(())
            }
        };
        ready(result)
    }
}

#[derive(Debug, Default)]
struct KeyHalfState {
    halves: BTreeMap<ServerHalfId, ServerHalf>,
    deleted: Vec<(UserId, Kid, ServerHalfId)>,
}

/// In-memory key-halves server.
#[derive(Clone, Default)]
pub struct MemoryKeyHalfStore {
    state: Arc<RwLock<KeyHalfState>>,
}

impl MemoryKeyHalfStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored halves.
    pub fn half_count(&self) -> usize {
        self.state.read().halves.len()
    }

    /// Whether a half is currently stored.
    pub fn contains(&self, id: &ServerHalfId) -> bool {
        self.state.read().halves.contains_key(id)
    }

    /// Every delete call observed, in order.
    pub fn deleted(&self) -> Vec<(UserId, Kid, ServerHalfId)> {
        self.state.read().deleted.clone()
    }
}

impl KeyHalfStore for MemoryKeyHalfStore {
    fn server_half(
        &self,
        id: ServerHalfId,
        _device: DevicePublicKey,
    ) -> impl Future<Output = Result<ServerHalf, ServiceError>> + Send {
        let result = self
            .state
            .read()
            .halves
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("server half {id}")));
        ready(result)
    }

    fn put_server_halves(
        &self,
        halves: BTreeMap<ServerHalfId, ServerHalf>,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send {
        self.state.write().halves.extend(halves);
        ready(Ok(()))
    }

    fn delete_server_half(
        &self,
        user: UserId,
        device: Kid,
        id: ServerHalfId,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send {
        let mut state = self.state.write();
        state.halves.remove(&id);
        state.deleted.push((user, device, id));
        ready(Ok(()))
    }
}

/// In-memory metadata server (handles only).
#[derive(Clone, Default)]
pub struct MemoryMetadataOps {
    handles: Arc<RwLock<BTreeMap<FolderId, FolderHandle>>>,
}

impl MemoryMetadataOps {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server-side handle for a folder.
    pub fn set_handle(&self, folder: FolderId, handle: FolderHandle) {
        self.handles.write().insert(folder, handle);
    }
}

impl MetadataOps for MemoryMetadataOps {
    fn latest_handle(
        &self,
        folder: FolderId,
    ) -> impl Future<Output = Result<FolderHandle, ServiceError>> + Send {
        let result = self
            .handles
            .read()
            .get(&folder)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("handle for folder {folder}")));
        ready(result)
    }
}
