//! Aggregate index over every chunk in one storage location
//!
//! A directory is rebuilt from scratch each time it is opened: scan the
//! location for chunk file pairs, load every chunk's index eagerly, then
//! fold them into one global item map. Item ids must be unique across the
//! whole location; a violation means the location is corrupt or was
//! tampered with and nothing in it can be trusted.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use serde_json::Value;
use thiserror::Error;

use crate::chunk::{Chunk, ChunkError, ItemData};
use crate::serializer::Serializer;

pub const DATA_PREFIX: &str = "data_";
pub const DATA_SUFFIX: &str = ".gulp";
pub const META_PREFIX: &str = "meta_";
pub const META_SUFFIX: &str = ".gmeta";

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("data and index files do not pair up (data only: {data_only:?}, index only: {index_only:?})")]
    MismatchedChunkFiles {
        data_only: Vec<u64>,
        index_only: Vec<u64>,
    },
    #[error("chunk id {id} appears twice ({first} and {second})")]
    DuplicateChunkId { id: u64, first: String, second: String },
    #[error("item {id} is present in chunk {first} and chunk {second}")]
    DuplicateItem { id: String, first: u64, second: u64 },
    #[error("item {0} is not in this directory")]
    UnknownItem(String),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Chunk id embedded in a file name: the first run of ascii digits, which
/// covers both the plain (`data_3.gulp`) and zero-padded (`data_003.gulp`)
/// naming variants.
fn chunk_id(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    if !name.starts_with(prefix) || !name.ends_with(suffix) {
        return None;
    }

    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();

    digits.parse().ok()
}

/// Scan one naming convention out of a directory listing.
fn scan_ids(
    names: &[String],
    prefix: &str,
    suffix: &str,
) -> Result<BTreeMap<u64, String>, DirectoryError> {
    let mut ids = BTreeMap::new();

    for name in names {
        if let Some(id) = chunk_id(name, prefix, suffix) {
            if let Some(first) = ids.insert(id, name.clone()) {
                return Err(DirectoryError::DuplicateChunkId {
                    id,
                    first,
                    second: name.clone(),
                });
            }
        }
    }

    Ok(ids)
}

pub struct Directory {
    location: PathBuf,
    chunks: BTreeMap<u64, Chunk>,
    item_to_chunk: HashMap<String, u64>,
    merged_meta: HashMap<String, Value>,
    serializer: Arc<dyn Serializer>,
}

impl Directory {
    /// Scan `location` and build the global item index. Fails outright on a
    /// data/index pairing mismatch or on an item id owned by two chunks;
    /// a location that trips either check must not be used further.
    pub fn open(
        location: impl Into<PathBuf>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, DirectoryError> {
        let location = location.into();

        let names: Vec<String> = fs::read_dir(&location)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();

        let data_ids = scan_ids(&names, DATA_PREFIX, DATA_SUFFIX)?;
        let index_ids = scan_ids(&names, META_PREFIX, META_SUFFIX)?;

        if data_ids.len() != index_ids.len()
            || !data_ids.keys().eq(index_ids.keys())
        {
            return Err(DirectoryError::MismatchedChunkFiles {
                data_only: data_ids.keys().filter(|id| !index_ids.contains_key(*id)).copied().collect(),
                index_only: index_ids.keys().filter(|id| !data_ids.contains_key(*id)).copied().collect(),
            });
        }

        let mut chunks = BTreeMap::new();
        for (&id, data_name) in &data_ids {
            let chunk = Chunk::new(
                id,
                location.join(data_name),
                location.join(&index_ids[&id]),
                Arc::clone(&serializer),
            )?;
            chunks.insert(id, chunk);
        }

        let mut item_to_chunk = HashMap::new();
        let mut merged_meta = HashMap::new();
        for (&chunk_id, chunk) in &chunks {
            for (item_id, entry) in chunk.index().iter() {
                if let Some(first) = item_to_chunk.insert(item_id.to_string(), chunk_id) {
                    return Err(DirectoryError::DuplicateItem {
                        id: item_id.to_string(),
                        first,
                        second: chunk_id,
                    });
                }
                merged_meta.insert(item_id.to_string(), entry.first_meta());
            }
        }

        info!(
            "directory {}: {} chunks, {} items",
            location.display(),
            chunks.len(),
            item_to_chunk.len()
        );

        Ok(Directory {
            location,
            chunks,
            item_to_chunk,
            merged_meta,
            serializer,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Total items across all chunks.
    pub fn len(&self) -> usize {
        self.item_to_chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_to_chunk.is_empty()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.item_to_chunk.contains_key(item_id)
    }

    /// Merged first-metadata entry for an item, without touching the data
    /// file.
    pub fn metadata(&self, item_id: &str) -> Option<&Value> {
        self.merged_meta.get(item_id)
    }

    /// Chunks in ascending id order, read-ready but not yet opened.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks.values_mut()
    }

    /// Resolve the owning chunk and read an item through a scoped read
    /// session.
    pub fn get(
        &mut self,
        item_id: &str,
        frame_range: Option<Range<usize>>,
    ) -> Result<ItemData, DirectoryError> {
        let chunk_id = *self
            .item_to_chunk
            .get(item_id)
            .ok_or_else(|| DirectoryError::UnknownItem(item_id.to_string()))?;
        let chunk = self
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| DirectoryError::UnknownItem(item_id.to_string()))?;

        Ok(chunk.with_read(|c| c.read(item_id, frame_range))?)
    }

    /// Hand out `count` fresh chunks with consecutive ids starting right
    /// after the highest existing one. No files are touched until a chunk
    /// is first opened for write, and the new chunks are not registered
    /// here: reopen the directory once they are written.
    pub fn allocate_new_chunks(&self, count: usize) -> Result<Vec<Chunk>, DirectoryError> {
        let next_id = self.chunks.keys().next_back().map_or(0, |id| id + 1);

        (next_id..next_id + count as u64)
            .map(|id| {
                Chunk::new(
                    id,
                    self.location.join(format!("{DATA_PREFIX}{id}{DATA_SUFFIX}")),
                    self.location.join(format!("{META_PREFIX}{id}{META_SUFFIX}")),
                    Arc::clone(&self.serializer),
                )
                .map_err(DirectoryError::from)
            })
            .collect()
    }
}
