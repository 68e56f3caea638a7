//! Entry checksum primitives
//!
//! Provides [`Checksum`], a strongly-typed 32-byte Blake3 digest stored on
//! every ledger entry, and [`Checksummer`], which computes it either plain or
//! keyed with a [`ChecksumKey`].

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte entry checksum (Blake3)
///
/// Immutable and cheap to clone (Copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Create a checksum from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create checksum from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChecksumError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ChecksumError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ChecksumVisitor;

        impl<'de> serde::de::Visitor<'de> for ChecksumVisitor {
            type Value = Checksum;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 32-byte checksum as hex string or byte array")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }

            fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Checksum::from_slice(value).map_err(serde::de::Error::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut arr = [0u8; 32];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &"32 bytes"))?;
                }
                Ok(Checksum::new(arr))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(ChecksumVisitor)
        } else {
            deserializer.deserialize_bytes(ChecksumVisitor)
        }
    }
}

/// Secret key for keyed checksums
///
/// Never printed: the `Debug` impl redacts the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ChecksumKey([u8; 32]);

impl ChecksumKey {
    /// Create key from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters
    ///
    /// # Errors
    /// Returns error on bad hex or wrong length
    pub fn from_hex(s: &str) -> Result<Self, ChecksumError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChecksumError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for ChecksumKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ChecksumKey(<redacted>)")
    }
}

/// Computes entry checksums, plain or keyed
///
/// A plain checksum detects accidental corruption only: anyone holding the
/// entry can recompute it. A keyed checksum additionally requires the key.
#[derive(Debug, Clone, Default)]
pub struct Checksummer {
    key: Option<ChecksumKey>,
}

impl Checksummer {
    /// Plain Blake3
    #[inline]
    #[must_use]
    pub fn unkeyed() -> Self {
        Self { key: None }
    }

    /// Keyed Blake3
    #[inline]
    #[must_use]
    pub fn keyed(key: ChecksumKey) -> Self {
        Self { key: Some(key) }
    }

    /// Whether a key is configured
    #[inline]
    #[must_use]
    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    /// Digest canonical bytes
    #[must_use]
    pub fn digest(&self, data: &[u8]) -> Checksum {
        let hash = match &self.key {
            Some(key) => blake3::keyed_hash(&key.0, data),
            None => blake3::hash(data),
        };
        Checksum::new(*hash.as_bytes())
    }
}

/// Errors that can occur when parsing checksums or keys
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// Invalid byte length
    #[error("invalid checksum length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_from_slice_invalid_length() {
        let result = Checksum::from_slice(&[1u8; 31]);
        assert!(matches!(
            result,
            Err(ChecksumError::InvalidLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn digest_is_deterministic() {
        let c = Checksummer::unkeyed();
        assert_eq!(c.digest(b"entry"), c.digest(b"entry"));
        assert_ne!(c.digest(b"entry"), c.digest(b"entry2"));
    }

    #[test]
    fn keyed_digest_differs_from_plain() {
        let plain = Checksummer::unkeyed();
        let keyed = Checksummer::keyed(ChecksumKey::new([7u8; 32]));
        assert!(keyed.is_keyed());
        assert_ne!(plain.digest(b"entry"), keyed.digest(b"entry"));

        let other = Checksummer::keyed(ChecksumKey::new([8u8; 32]));
        assert_ne!(keyed.digest(b"entry"), other.digest(b"entry"));
    }

    #[test]
    fn display_and_parse() {
        let sum = Checksummer::unkeyed().digest(b"test");
        let parsed: Checksum = sum.to_string().parse().unwrap();
        assert_eq!(sum, parsed);
        assert!(sum.to_string().starts_with(&sum.short()));
    }

    #[test]
    fn serde_json_uses_hex() {
        let sum = Checksummer::unkeyed().digest(b"test");
        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json.len(), 66);
        let decoded: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(sum, decoded);
    }

    #[test]
    fn key_from_hex() {
        let key = ChecksumKey::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key, ChecksumKey::new([0xab; 32]));
        assert!(ChecksumKey::from_hex("abcd").is_err());
        assert!(ChecksumKey::from_hex("zz").is_err());
        assert_eq!(format!("{key:?}"), "ChecksumKey(<redacted>)");
    }
}
