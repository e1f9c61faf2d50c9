//! Folder handles: the membership half of a folder's identity.
//!
//! A handle is the unordered pair of writer and reader sets, plus any
//! assertions that have not yet resolved to a user and an optional
//! server-side conflict marker. Resolved members carry their canonical
//! username so renames are observable; resolution itself is delegated to
//! the identity service.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    id::{UserId, Username},
    services::{IdentityService, ServiceError},
};

/// Server-side conflict marker attached to a handle after a merge conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Conflict date as Unix epoch seconds.
    pub date: u64,
    /// Disambiguating sequence number for same-day conflicts.
    pub number: u16,
}

/// The member sets of one folder.
///
/// # Invariants
///
/// - A user appears in at most one of the writer and reader maps
/// - Writers are implicitly readers
/// - Member maps are ordered, so canonical encoding is deterministic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderHandle {
    writers: BTreeMap<UserId, Username>,
    readers: BTreeMap<UserId, Username>,
    unresolved_writers: BTreeSet<String>,
    unresolved_readers: BTreeSet<String>,
    conflict_info: Option<ConflictInfo>,
}

impl FolderHandle {
    /// Creates a handle from resolved member sets.
    pub fn new(
        writers: BTreeMap<UserId, Username>,
        readers: BTreeMap<UserId, Username>,
    ) -> Self {
        Self {
            writers,
            readers,
            unresolved_writers: BTreeSet::new(),
            unresolved_readers: BTreeSet::new(),
            conflict_info: None,
        }
    }

    /// Adds a writer assertion that could not be resolved yet.
    pub fn add_unresolved_writer(&mut self, assertion: impl Into<String>) {
        self.unresolved_writers.insert(assertion.into());
    }

    /// Adds a reader assertion that could not be resolved yet.
    pub fn add_unresolved_reader(&mut self, assertion: impl Into<String>) {
        self.unresolved_readers.insert(assertion.into());
    }

    /// Whether the user is a writer.
    pub fn is_writer(&self, user: UserId) -> bool {
        self.writers.contains_key(&user)
    }

    /// Whether the user may read the folder. Writers are readers too.
    pub fn is_reader(&self, user: UserId) -> bool {
        self.writers.contains_key(&user) || self.readers.contains_key(&user)
    }

    /// The resolved writer IDs.
    pub fn writer_ids(&self) -> Vec<UserId> {
        self.writers.keys().copied().collect()
    }

    /// The resolved reader IDs (excluding writers).
    pub fn reader_ids(&self) -> Vec<UserId> {
        self.readers.keys().copied().collect()
    }

    /// The conflict marker, if the folder is conflicted.
    pub fn conflict_info(&self) -> Option<&ConflictInfo> {
        self.conflict_info.as_ref()
    }

    /// Replaces the conflict marker.
    pub fn set_conflict_info(&mut self, info: Option<ConflictInfo>) {
        self.conflict_info = info;
    }

    /// The canonical path name: sorted writer names, then `#` and sorted
    /// reader names when any readers exist.
    pub fn canonical_name(&self) -> String {
        let mut writers: Vec<&str> = self.writers.values().map(Username::as_str).collect();
        writers.extend(self.unresolved_writers.iter().map(String::as_str));
        writers.sort_unstable();

        let mut name = writers.join(",");
        if !self.readers.is_empty() || !self.unresolved_readers.is_empty() {
            let mut readers: Vec<&str> = self.readers.values().map(Username::as_str).collect();
            readers.extend(self.unresolved_readers.iter().map(String::as_str));
            readers.sort_unstable();
            name.push('#');
            name.push_str(&readers.join(","));
        }
        name
    }

    /// Re-resolves the handle against the identity service.
    ///
    /// Usernames of already-resolved members are refreshed, and unresolved
    /// assertions that now map to a user move into the member maps.
    pub async fn resolve_again<I: IdentityService>(
        &self,
        identity: &I,
    ) -> Result<Self, ServiceError> {
        let mut out = self.clone();

        for uid in out.writers.keys().copied().collect::<Vec<_>>() {
            let name = identity.username_of(uid).await?;
            out.writers.insert(uid, name);
        }
        for uid in out.readers.keys().copied().collect::<Vec<_>>() {
            let name = identity.username_of(uid).await?;
            out.readers.insert(uid, name);
        }

        for assertion in std::mem::take(&mut out.unresolved_writers) {
            match identity.resolve_assertion(&assertion).await? {
                Some(info) => {
                    out.writers.insert(info.uid, info.username);
                }
                None => {
                    out.unresolved_writers.insert(assertion);
                }
            }
        }
        for assertion in std::mem::take(&mut out.unresolved_readers) {
            match identity.resolve_assertion(&assertion).await? {
                Some(info) => {
                    out.readers.insert(info.uid, info.username);
                }
                None => {
                    out.unresolved_readers.insert(assertion);
                }
            }
        }

        // A user resolved on both sides is a writer; this is how a reader
        // promotion enters the handle.
        let writer_ids: Vec<UserId> = out.writers.keys().copied().collect();
        for uid in writer_ids {
            out.readers.remove(&uid);
        }

        Ok(out)
    }

    /// Re-resolves only the given user's entries.
    ///
    /// Used when the caller is not a writer: a non-writer may not alter
    /// other members, so resolution is restricted to the caller's own
    /// entry.
    pub async fn resolve_again_for_user<I: IdentityService>(
        &self,
        identity: &I,
        user: UserId,
    ) -> Result<Self, ServiceError> {
        let mut out = self.clone();

        if out.writers.contains_key(&user) {
            let name = identity.username_of(user).await?;
            out.writers.insert(user, name);
        }
        if out.readers.contains_key(&user) {
            let name = identity.username_of(user).await?;
            out.readers.insert(user, name);
        }

        for assertion in std::mem::take(&mut out.unresolved_writers) {
            match identity.resolve_assertion(&assertion).await? {
                Some(info) if info.uid == user => {
                    out.writers.insert(info.uid, info.username);
                }
                _ => {
                    out.unresolved_writers.insert(assertion);
                }
            }
        }
        for assertion in std::mem::take(&mut out.unresolved_readers) {
            match identity.resolve_assertion(&assertion).await? {
                Some(info) if info.uid == user => {
                    if !out.writers.contains_key(&info.uid) {
                        out.readers.insert(info.uid, info.username);
                    }
                }
                _ => {
                    out.unresolved_readers.insert(assertion);
                }
            }
        }

        if out.writers.contains_key(&user) {
            out.readers.remove(&user);
        }

        Ok(out)
    }
}
