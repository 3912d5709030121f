//! Control packets exchanged with a worker.
//!
//! Every packet is a big-endian `u32` byte count followed by that many bytes
//! of JSON. `job` and `data_data` packets are immediately followed by one
//! codec payload per data type involved.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::DataType;
use crate::error::BridgeError;

/// Handshake sent once, before any session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaPacket {
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    /// The node's operator configuration, passed through untouched.
    pub config: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Init,
    Job,
    Finish,
}

/// Caller to worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPacket {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: JobType,
    /// Records per input following a `job` packet.
    #[serde(default)]
    pub length: usize,
}

impl JobPacket {
    pub fn init(key: &str) -> Self {
        Self {
            key: key.to_string(),
            kind: JobType::Init,
            length: 0,
        }
    }

    pub fn job(key: &str, length: usize) -> Self {
        Self {
            key: key.to_string(),
            kind: JobType::Job,
            length,
        }
    }

    pub fn finish(key: &str) -> Self {
        Self {
            key: key.to_string(),
            kind: JobType::Finish,
            length: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    DataData,
    DataFinish,
    Finish,
}

/// Worker to caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePacket {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub key: String,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub length: usize,
}

pub fn write_packet<T: Serialize>(writer: &mut dyn Write, packet: &T) -> Result<(), BridgeError> {
    let buffer = serde_json::to_vec(packet)?;
    let len = u32::try_from(buffer.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&buffer)?;
    Ok(())
}

/// Reads one packet, or `None` when the stream ends cleanly between packets.
pub fn read_packet<T: DeserializeOwned>(reader: &mut dyn Read) -> Result<Option<T>, BridgeError> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match reader.read(&mut len[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut buffer = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut buffer)?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_packet_json() {
        let json = serde_json::to_string(&JobPacket::job("frame-1", 32)).unwrap();
        assert_eq!(json, r#"{"key":"frame-1","type":"job","length":32}"#);
    }

    #[test]
    fn test_response_defaults() {
        let packet: ResponsePacket = serde_json::from_str(r#"{"type":"finish","key":"a"}"#).unwrap();
        assert_eq!(packet.kind, ResponseType::Finish);
        assert_eq!(packet.output_key, "");
        assert_eq!(packet.length, 0);
    }

    #[test]
    fn test_framing() {
        let mut buffer = Vec::new();
        write_packet(&mut buffer, &JobPacket::init("a")).unwrap();
        write_packet(&mut buffer, &JobPacket::finish("a")).unwrap();

        let mut reader = buffer.as_slice();
        let first: JobPacket = read_packet(&mut reader).unwrap().unwrap();
        let second: JobPacket = read_packet(&mut reader).unwrap().unwrap();
        assert_eq!(first.kind, JobType::Init);
        assert_eq!(second.kind, JobType::Finish);
        assert!(read_packet::<JobPacket>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame() {
        let mut buffer = Vec::new();
        write_packet(&mut buffer, &JobPacket::init("a")).unwrap();
        buffer.truncate(2);

        let err = read_packet::<JobPacket>(&mut buffer.as_slice()).unwrap_err();
        assert!(matches!(err, BridgeError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_malformed_json() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&3u32.to_be_bytes());
        buffer.extend_from_slice(b"{{{");

        let err = read_packet::<JobPacket>(&mut buffer.as_slice()).unwrap_err();
        assert!(matches!(err, BridgeError::Json(_)));
    }
}
