//! Typed item payloads and their wire encoding.
//!
//! A [`Data`] value is an ordered run of records of one [`DataType`]. Records
//! are CBOR values, so a single image, a list of detections per frame, or a
//! sequence of video frames all share one representation that can be sliced
//! into chunks and streamed.
//!
//! How a data type travels over the bridge is decided by its [`Codec`]. The
//! [`Codecs`] table maps type names to codecs and falls back to
//! [`CborCodec`] for anything not registered.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::ops::Range;
use std::sync::Arc;

use ciborium::Value;

use crate::core::{DataType, Hash32};

/// Number of records sent per `job` packet.
pub const CHUNK_SIZE: usize = 32;

/// An ordered run of records of a single data type.
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    data_type: DataType,
    records: Vec<Value>,
}

impl Data {
    pub fn new(data_type: DataType, records: Vec<Value>) -> Self {
        Self { data_type, records }
    }

    pub fn empty(data_type: DataType) -> Self {
        Self::new(data_type, Vec::new())
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Value> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn slice(&self, range: Range<usize>) -> Data {
        Data::new(self.data_type.clone(), self.records[range].to_vec())
    }

    /// Canonical CBOR encoding, independent of the wire codec.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(&self.records, &mut buffer)
            .map_err(|e| io::Error::other(format!("{e:?}")))?;
        Ok(buffer)
    }

    pub fn fingerprint(&self) -> io::Result<Hash32> {
        Ok(Hash32::hash(self.to_bytes()?))
    }
}

/// Accumulates streamed chunks of one data type into a single [`Data`].
#[derive(Debug)]
pub struct DataBuilder {
    data_type: DataType,
    records: Vec<Value>,
}

impl DataBuilder {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            records: Vec::new(),
        }
    }

    pub fn write(&mut self, chunk: Data) {
        self.records.extend(chunk.into_records());
    }

    pub fn finish(self) -> Data {
        Data::new(self.data_type, self.records)
    }
}

/// Per data type payload encoding used on the bridge.
pub trait Codec: Send + Sync {
    fn encode(&self, data: &Data, writer: &mut dyn Write) -> io::Result<()>;
    fn decode(&self, data_type: &DataType, reader: &mut dyn Read) -> io::Result<Data>;
}

/// Length-prefixed CBOR array of records.
///
/// Each payload is a big-endian `u32` byte count followed by a CBOR array
/// holding the chunk's records.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn encode(&self, data: &Data, writer: &mut dyn Write) -> io::Result<()> {
        let buffer = data.to_bytes()?;
        let len = u32::try_from(buffer.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&buffer)
    }

    fn decode(&self, data_type: &DataType, reader: &mut dyn Read) -> io::Result<Data> {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let mut buffer = vec![0u8; u32::from_be_bytes(len) as usize];
        reader.read_exact(&mut buffer)?;

        let records: Vec<Value> = ciborium::from_reader(buffer.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}")))?;

        Ok(Data::new(data_type.clone(), records))
    }
}

/// Table of payload codecs keyed by data type.
#[derive(Clone)]
pub struct Codecs {
    codecs: HashMap<DataType, Arc<dyn Codec>>,
    fallback: Arc<dyn Codec>,
}

impl Codecs {
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
            fallback: Arc::new(CborCodec),
        }
    }

    pub fn register(&mut self, data_type: DataType, codec: impl Codec + 'static) -> &mut Self {
        self.codecs.insert(data_type, Arc::new(codec));
        self
    }

    pub fn get(&self, data_type: &DataType) -> &dyn Codec {
        self.codecs
            .get(data_type)
            .map(Arc::as_ref)
            .unwrap_or(self.fallback.as_ref())
    }
}

impl Default for Codecs {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks several inputs in lockstep, `size` records at a time.
///
/// Each step yields the record offset, the number of records in the step and
/// one slice per input. The walk stops at the shortest input.
pub fn chunks(inputs: &[Data], size: usize) -> impl Iterator<Item = (usize, usize, Vec<Data>)> + '_ {
    let total = inputs.iter().map(Data::len).min().unwrap_or(0);
    let size = size.max(1);

    (0..total).step_by(size).map(move |pos| {
        let len = size.min(total - pos);
        let slices = inputs.iter().map(|d| d.slice(pos..pos + len)).collect();
        (pos, len, slices)
    })
}
