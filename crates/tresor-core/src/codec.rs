//! Canonical binary encoding.
//!
//! The format is CBOR (via ciborium). Structures that feed equality checks
//! keep their collections in `BTreeMap`/`BTreeSet` form, so the same
//! logical value always encodes to the same bytes.

use serde::Serialize;

use crate::error::KeyError;

/// Encode a value to canonical CBOR bytes.
///
/// # Errors
///
/// Returns `KeyError::Codec` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, KeyError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| KeyError::Codec(e.to_string()))?;
    Ok(bytes)
}

/// Compare two values by their canonical encodings.
///
/// Used for handle-changed detection, where provenance-insensitive equality
/// matters more than structural identity.
pub fn equal<T: Serialize>(a: &T, b: &T) -> Result<bool, KeyError> {
    Ok(encode(a)? == encode(b)?)
}
