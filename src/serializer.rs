//! Pluggable index file encodings
//!
//! The index schema is fixed (see [`crate::index`]), the byte encoding is
//! not: chunks and directories only ever talk to the [`Serializer`] trait.
//! Two encodings are provided, a structured text one for tooling and
//! interoperability, and a self-describing binary one for bulk use. The
//! binary encoding must be self-describing since item metadata is opaque
//! and carries its own shape.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use thiserror::Error;

use crate::index::ChunkIndex;

#[derive(Error, Debug)]
pub enum SerializerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

pub trait Serializer: Send + Sync {
    fn load(&self, path: &Path) -> Result<ChunkIndex, SerializerError>;
    fn dump(&self, index: &ChunkIndex, path: &Path) -> Result<(), SerializerError>;
}

/// JSON text encoding of the index file.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn load(&self, path: &Path) -> Result<ChunkIndex, SerializerError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn dump(&self, index: &ChunkIndex, path: &Path) -> Result<(), SerializerError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, index)?;
        Ok(())
    }
}

/// MessagePack binary encoding of the index file.
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn load(&self, path: &Path) -> Result<ChunkIndex, SerializerError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(rmp_serde::decode::from_read(reader)?)
    }

    fn dump(&self, index: &ChunkIndex, path: &Path) -> Result<(), SerializerError> {
        let mut writer = BufWriter::new(File::create(path)?);
        rmp_serde::encode::write(&mut writer, index)?;
        Ok(())
    }
}

#[cfg(test)]
mod test_serializers {
    use super::*;
    use serde_json::json;

    use crate::record::FrameLocator;

    fn sample_index() -> ChunkIndex {
        let mut index = ChunkIndex::new();

        for (i, id) in ["walk", "0", "jump"].iter().enumerate() {
            let entry = index.entry_or_default(id);
            entry.frames.push(FrameLocator {
                offset: i as u64 * 16,
                payload_len: 13,
                pad_len: 3,
            });
            entry.meta_data.push(json!({"label": id, "idx": i}));
        }

        index
    }

    fn roundtrip(serializer: &dyn Serializer) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta_0.gmeta");
        let index = sample_index();

        serializer.dump(&index, &path).unwrap();
        let back = serializer.load(&path).unwrap();

        let ids: Vec<&str> = back.ids().collect();
        assert_eq!(ids, vec!["walk", "0", "jump"]);
        for id in ids {
            assert_eq!(back.get(id), index.get(id));
        }
    }

    #[test]
    fn json_roundtrip() {
        roundtrip(&JsonSerializer);
    }

    #[test]
    fn messagepack_roundtrip() {
        roundtrip(&MessagePackSerializer);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = JsonSerializer.load(&dir.path().join("absent.gmeta"));
        assert!(matches!(err, Err(SerializerError::Io(_))));
    }
}
