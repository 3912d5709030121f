use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Identity of an execution node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Identity of a dataset, either standalone or owned by a node output slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Name of a data type, e.g. `image`, `detection` or `int`.
///
/// The engine never interprets the name itself, it only uses it to pick the
/// payload [`Codec`](crate::data::Codec) for the bridge wire format.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataType(ArcStr);

impl DataType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataType({})", self.0)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataType {
    fn from(value: &str) -> Self {
        DataType::new(value)
    }
}

impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(DataType::new)
    }
}

/// A 32-byte BLAKE3 hash of an item's encoded payload.
///
/// Two items with equal hashes hold byte-identical data, which is how reruns
/// can be compared without loading anything.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Where the bytes behind an item live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Provider {
    /// The storage owns a copy of the bytes.
    Owned,
    /// The item links to another item's bytes without copying them.
    Reference { dataset: DatasetId, key: String },
}

/// One addressable unit of data within a dataset.
#[derive(Clone, Debug, Serialize)]
pub struct Item {
    pub dataset: DatasetId,
    pub key: String,
    pub ext: String,
    pub format: String,
    pub metadata: String,
    pub provider: Provider,
    /// Hash of the encoded payload, absent until bytes are written.
    pub hash: Option<Hash32>,
}

/// Descriptor for an item created without writing a payload through the
/// engine, for example when the operator produces the file itself.
#[derive(Clone, Debug, Default)]
pub struct ItemSpec {
    pub key: String,
    pub ext: String,
    pub format: String,
    pub metadata: String,
}

/// A keyed collection of items, ordered by key.
#[derive(Clone, Debug, Serialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub data_type: DataType,
    /// Set once every item of a node output has been produced.
    pub done: bool,
}

/// How [`Storage::copy_item`](crate::storage::Storage::copy_item) moves bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyMode {
    ByValue,
    /// Link to the source bytes when no format conversion is needed.
    ByReference,
}
