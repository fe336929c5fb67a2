//! Binary Wire Format
//!
//! Every message is framed as `[type: u8][length: varint][payload]` with
//! unsigned LEB128 varints. Type values partition into disjoint ranges, one
//! per protocol direction, so a frame arriving in the wrong connection
//! state is detectable from its first byte. Payloads are msgpack.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::search::types::{QueryDescriptor, SearchResult};
use crate::storage::index::{Changeset, Document};

pub const PROTOCOL_VERSION_MAJOR: u16 = 1;
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

/// Escape: the next byte is an inner type, then a compressed file stream.
pub const FILE_FOLLOWS: u8 = 0xFD;
/// Escape: the connection switches to the replication protocol.
pub const SWITCH_TO_REPL: u8 = 0xFE;

// ── Type ranges ──────────────────────────────────────────────────────────

pub const REMOTE_MSG_BASE: u8 = 0x00;
pub const REMOTE_MSG_MAX: u8 = 0x03;
pub const REMOTE_REPLY_BASE: u8 = 0x40;
pub const REMOTE_REPLY_MAX: u8 = 0x45;
pub const REPL_MSG_BASE: u8 = 0x80;
pub const REPL_MSG_MAX: u8 = 0x81;
pub const REPL_REPLY_BASE: u8 = 0xA0;
pub const REPL_REPLY_MAX: u8 = 0xA6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteMessageType {
    Query = 0x00,
    FetchDocument = 0x01,
    DatabaseInfo = 0x02,
}

impl TryFrom<u8> for RemoteMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Query),
            0x01 => Ok(Self::FetchDocument),
            0x02 => Ok(Self::DatabaseInfo),
            _ => Err(Error::ProtocolViolation(format!(
                "invalid remote message type {:#04x}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteReplyType {
    Update = 0x40,
    Results = 0x41,
    Document = 0x42,
    DatabaseInfo = 0x43,
    Exception = 0x44,
}

impl TryFrom<u8> for RemoteReplyType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x40 => Ok(Self::Update),
            0x41 => Ok(Self::Results),
            0x42 => Ok(Self::Document),
            0x43 => Ok(Self::DatabaseInfo),
            0x44 => Ok(Self::Exception),
            _ => Err(Error::ProtocolViolation(format!(
                "invalid remote reply type {:#04x}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationMessageType {
    GetChangesets = 0x80,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(Self::GetChangesets),
            _ => Err(Error::ProtocolViolation(format!(
                "invalid replication message type {:#04x}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationReplyType {
    Changeset = 0xA0,
    EndOfChanges = 0xA1,
    Fail = 0xA2,
    DbFilename = 0xA3,
    DbFiledata = 0xA4,
    DbFooter = 0xA5,
}

impl TryFrom<u8> for ReplicationReplyType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xA0 => Ok(Self::Changeset),
            0xA1 => Ok(Self::EndOfChanges),
            0xA2 => Ok(Self::Fail),
            0xA3 => Ok(Self::DbFilename),
            0xA4 => Ok(Self::DbFiledata),
            0xA5 => Ok(Self::DbFooter),
            _ => Err(Error::ProtocolViolation(format!(
                "invalid replication reply type {:#04x}",
                value
            ))),
        }
    }
}

// ── Varint lengths ───────────────────────────────────────────────────────

const MAX_VARINT_BYTES: usize = 10;

pub fn encode_length(out: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

/// Decode a varint from the front of `buf` without consuming it.
/// `Ok(None)` means more bytes are needed; `Err` means the encoding itself
/// is broken.
pub fn decode_length(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(Error::ProtocolViolation("varint too long".to_string()));
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        return Err(Error::ProtocolViolation("varint too long".to_string()));
    }
    Ok(None)
}

/// Frame a message: `[type][varint length][payload]`.
pub fn encode_frame(type_byte: u8, payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(1 + MAX_VARINT_BYTES + payload.len());
    frame.put_u8(type_byte);
    encode_length(&mut frame, payload.len() as u64);
    frame.put_slice(payload);
    frame
}

// ── Payloads ─────────────────────────────────────────────────────────────

/// Initial reply a serving connection emits when the remote protocol comes
/// up, acknowledging readiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUpdate {
    pub node_name: String,
    pub version_major: u16,
    pub version_minor: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteQuery {
    pub index_path: String,
    pub descriptor: QueryDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResults {
    pub result: SearchResult,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFetch {
    pub index_path: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub document: Option<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfoRequest {
    pub index_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfoReply {
    pub index_path: String,
    pub revision: u64,
    pub doc_count: usize,
}

/// Storage errors cross the wire as an error frame; the connection stays
/// open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteException {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetChangesets {
    pub index_path: String,
    pub from_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetFrame {
    pub changeset: Changeset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbFooter {
    pub revision: u64,
}

pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(payload)?)
}
