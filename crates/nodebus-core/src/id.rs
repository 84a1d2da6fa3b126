//! Node identifiers: bus addresses and 8-byte hardware ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::protocol::constants::MAX_NODES;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("Hardware id too short: {actual} bytes, expected 8")]
    TooShort { actual: usize },
    #[error("Malformed hardware id '{0}': expected 8 hex pairs separated by ':'")]
    Malformed(String),
}

/// Bus address of a node. 0 is reserved, 1..=127 are assignable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u8);

impl NodeId {
    /// The reserved address, never given to a node.
    pub const RESERVED: NodeId = NodeId(0);

    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Check if this address can be allocated to a node.
    pub fn is_assignable(self) -> bool {
        self.0 != 0 && (self.0 as usize) < MAX_NODES
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// 8-byte hardware identifier burned into a node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Udid([u8; 8]);

impl Udid {
    pub const LEN: usize = 8;

    /// All-zero identifier; never accepted for registration.
    pub const NULL: Udid = Udid([0; 8]);

    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl TryFrom<&[u8]> for Udid {
    type Error = IdError;

    /// Takes the first 8 bytes of `bytes`.
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < Self::LEN {
            return Err(IdError::TooShort {
                actual: bytes.len(),
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..Self::LEN]);
        Ok(Self(id))
    }
}

impl fmt::Display for Udid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Udid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Udid({})", self)
    }
}

/// Parses the canonical lowercase form only.
impl FromStr for Udid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdError::Malformed(s.to_string());

        // "xx:xx:xx:xx:xx:xx:xx:xx"
        if s.len() != Self::LEN * 3 - 1 || !s.is_ascii() {
            return Err(malformed());
        }

        let src = s.as_bytes();
        let mut id = [0u8; 8];
        for (i, byte) in id.iter_mut().enumerate() {
            let pos = i * 3;
            if i > 0 && src[pos - 1] != b':' {
                return Err(malformed());
            }
            let pair = &s[pos..pos + 2];
            if !pair.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')) {
                return Err(malformed());
            }
            *byte = u8::from_str_radix(pair, 16).map_err(|_| malformed())?;
        }
        Ok(Self(id))
    }
}

impl Serialize for Udid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Udid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
