//! Identifiers for folders, users, and key generations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a top-level folder, carrying its public bit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderId {
    id: [u8; 16],
    public: bool,
}

impl FolderId {
    /// Creates a private folder ID.
    pub fn new_private(id: [u8; 16]) -> Self {
        Self { id, public: false }
    }

    /// Creates a public folder ID.
    pub fn new_public(id: [u8; 16]) -> Self {
        Self { id, public: true }
    }

    /// Whether the folder is public.
    ///
    /// Public folders have a fixed sentinel key and no per-device wrappings.
    pub fn is_public(&self) -> bool {
        self.public
    }

    /// The raw ID bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.id
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({self})")
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.id[..4] {
            write!(f, "{b:02x}")?;
        }
        if self.public {
            write!(f, "+pub")?;
        }
        Ok(())
    }
}

/// A numbered epoch of a folder's symmetric key.
///
/// Generations start at [`KeyGen::FIRST_VALID`] and only ever increase. The
/// latest generation is the current encryption target; earlier generations
/// remain required for decrypting older content. Public folders use the
/// [`KeyGen::PUBLIC`] sentinel throughout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyGen(pub i32);

impl KeyGen {
    /// Sentinel generation for public folders.
    pub const PUBLIC: KeyGen = KeyGen(-1);

    /// Generation reported by a private folder with no bundles yet.
    pub const UNSET: KeyGen = KeyGen(0);

    /// The first usable key generation.
    pub const FIRST_VALID: KeyGen = KeyGen(1);

    /// The following generation.
    pub fn next(self) -> KeyGen {
        KeyGen(self.0 + 1)
    }

    /// The preceding generation.
    pub fn prev(self) -> KeyGen {
        KeyGen(self.0 - 1)
    }

    /// Position of this generation in a dense bundle list, if valid.
    pub fn to_index(self) -> Option<usize> {
        if self >= Self::FIRST_VALID {
            Some((self.0 - 1) as usize)
        } else {
            None
        }
    }
}

impl fmt::Debug for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyGen({})", self.0)
    }
}

impl fmt::Display for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque user identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId([u8; 16]);

impl UserId {
    /// Wraps raw ID bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw ID bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({self})")
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A user's canonical display name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Username(pub String);

impl Username {
    /// Creates a username from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity of a logged-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// The user's opaque ID.
    pub uid: UserId,
    /// The user's canonical name.
    pub username: Username,
}

/// Reference to an encrypted block, carrying the generation its key belongs
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    /// The block's opaque ID.
    pub id: [u8; 16],
    /// The key generation the block was encrypted under.
    pub key_gen: KeyGen,
}
