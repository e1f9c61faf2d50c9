//! Tresor Key-Management Core
//!
//! Keeps an encrypted folder's per-device key wrappings in sync with its
//! membership, across device additions, device revocations, membership
//! changes, and reader promotions, while preserving decryptability of
//! everything written under older keys.
//!
//! # Architecture
//!
//! ```text
//! KeyManager
//!   ├─ Key resolver (get_folder_key: cache → per-device unwrap → historic chain)
//!   ├─ Rekey engine (diff expected vs. recorded device sets, mutate metadata)
//!   ├─ KeyCache ((folder, generation) → folder key, bounded LRU)
//!   └─ Services (identity, key-halves server, metadata server)
//! ```
//!
//! # Components
//!
//! - [`KeyManager`]: Resolves folder keys and drives rekeys
//! - [`RootMetadata`]: A folder's versioned key bundles and handle
//! - [`KeyMetadata`]: Capability trait the resolver and engine operate on
//! - [`FolderHandle`]: The folder's writer/reader membership
//! - [`KeyCache`]: Per-config cache of resolved folder keys
//! - [`services`]: External collaborator traits plus in-memory backends
//!
//! The core owns no durable state: everything persistent lives in the
//! metadata object handed in by the caller and on the key-halves server.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod cache;
pub mod codec;
mod error;
mod handle;
mod id;
mod keybundle;
mod manager;
mod metadata;
pub mod services;

pub use cache::KeyCache;
pub use error::KeyError;
pub use handle::{ConflictInfo, FolderHandle};
pub use id::{BlockPointer, FolderId, KeyGen, UserId, UserInfo, Username};
pub use keybundle::{
    users_with_new_devices, users_with_removed_devices, DeviceKeyInfo, DeviceKeyInfoMap,
    DeviceRemovalInfo, KeyBundle, RemovalInfo, UserDeviceKeyInfoMap, UserDevicePublicKeys,
};
pub use manager::{KeyLookupFlags, KeyManager, RekeyOutcome};
pub use metadata::{
    DeviceKeyParams, KeyMetadata, MetadataVersion, RootMetadata, UntrustedRootMetadata,
};
