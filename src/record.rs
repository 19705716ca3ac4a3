//! On-disk record framing
//!
//! A data file is a raw concatenation of records, one per frame. There is
//! no file level header, footer or magic number; all structure lives in the
//! side index (see [`crate::index`]). Unless otherwise noted everything is
//! byte-exact and alignment is to a 4 byte boundary.
//!
//! | Type    | Name    | Description |
//! | ------: | ------- | ----------- |
//! | [u8; N] | payload | The frame bytes, opaque to this layer, N >= 1 |
//! | [u8; P] | padding | `P = (4 - N % 4) % 4` zero bytes |
//!
//! A [`FrameLocator`] is enough to seek to a record and strip the padding
//! back off, so reads never have to scan the file.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Records are padded out to this boundary.
pub const RECORD_ALIGN: usize = 4;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("a record must hold at least one payload byte")]
    EmptyPayload,
    #[error("record buffer is {actual} bytes, locator says {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Where one frame's record lives inside a chunk's data file.
///
/// Immutable once written. On the wire this is the triple
/// `[offset, pad_len, payload_len]` inside the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocator {
    pub offset: u64,
    pub payload_len: u32,
    pub pad_len: u8,
}

impl FrameLocator {
    /// Total bytes on disk for this record, padding included.
    pub fn record_len(&self) -> usize {
        self.payload_len as usize + self.pad_len as usize
    }
}

/// An encoded record ready to be written at some offset.
pub struct Record {
    pub bytes: Vec<u8>,
    pub payload_len: u32,
    pub pad_len: u8,
}

/// Pad length that brings `payload_len` up to the next alignment boundary.
///
/// Always in `[0, 3]`, zero when the payload is already aligned.
pub fn pad_len(payload_len: usize) -> u8 {
    ((RECORD_ALIGN - payload_len % RECORD_ALIGN) % RECORD_ALIGN) as u8
}

/// Encode one frame payload into an aligned record.
pub fn encode(payload: &[u8]) -> Result<Record, RecordError> {
    if payload.is_empty() {
        return Err(RecordError::EmptyPayload);
    }

    let pad = pad_len(payload.len());
    let mut bytes = Vec::with_capacity(payload.len() + pad as usize);
    bytes.extend_from_slice(payload);
    bytes.resize(payload.len() + pad as usize, 0);

    Ok(Record {
        bytes,
        payload_len: payload.len() as u32,
        pad_len: pad,
    })
}

/// Strip the padding from a record buffer read back off disk.
///
/// The buffer must be exactly `payload_len + pad_len` bytes as described by
/// the locator, anything else means the index and the data file disagree.
pub fn decode(buf: Vec<u8>, locator: &FrameLocator) -> Result<Vec<u8>, RecordError> {
    if buf.len() != locator.record_len() {
        return Err(RecordError::LengthMismatch {
            expected: locator.record_len(),
            actual: buf.len(),
        });
    }

    let mut payload = buf;
    payload.truncate(locator.payload_len as usize);
    Ok(payload)
}

// Serde impls
//
// The index file stores locators as a bare [offset, pad, length] triple to
// stay interoperable with existing chunk directories.
impl Serialize for FrameLocator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.offset)?;
        tup.serialize_element(&self.pad_len)?;
        tup.serialize_element(&self.payload_len)?;
        tup.end()
    }
}

struct FrameLocatorVisitor;

impl<'de> Visitor<'de> for FrameLocatorVisitor {
    type Value = FrameLocator;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a [offset, pad, length] triple")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let offset = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let pad_len = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let payload_len = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(2, &self))?;

        Ok(FrameLocator {
            offset,
            payload_len,
            pad_len,
        })
    }
}

impl<'de> Deserialize<'de> for FrameLocator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FrameLocator, D::Error> {
        deserializer.deserialize_tuple(3, FrameLocatorVisitor)
    }
}
