//! One data file + one index file
//!
//! A chunk owns exactly one `data_<id>.gulp` / `meta_<id>.gmeta` pair. The
//! data file is append-only and written in a single write session; the
//! index is kept in memory and persisted through the chunk's serializer on
//! flush/close. Reads are random access, one seek per frame record.
//!
//! A chunk is either closed, open for read, or open for write, never more
//! than one at a time. The scoped [`Chunk::with_read`] / [`Chunk::with_write`]
//! helpers guarantee the close (flush included) runs on every exit path.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rand::seq::SliceRandom;
use serde_json::Value;
use thiserror::Error;

use crate::index::ChunkIndex;
use crate::record::{self, FrameLocator, RecordError};
use crate::serializer::{Serializer, SerializerError};

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk {0} is already open")]
    AlreadyOpen(u64),
    #[error("chunk {id} is not open for {needed}")]
    UnsupportedMode { id: u64, needed: &'static str },
    #[error("item {0} is not in this chunk")]
    UnknownItem(String),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum State {
    Closed,
    Reading(File),
    Writing { file: BufWriter<File>, offset: u64 },
}

/// Frames of one item plus its first metadata entry, as handed back by
/// reads and iteration.
pub type ItemData = (Vec<Vec<u8>>, Value);

pub struct Chunk {
    id: u64,
    data_path: PathBuf,
    index_path: PathBuf,
    serializer: Arc<dyn Serializer>,
    index: ChunkIndex,
    state: State,
}

impl Chunk {
    /// Bind a chunk to its file pair, loading the index file if one exists.
    ///
    /// Neither file is created here; that happens on the first write.
    pub fn new(
        id: u64,
        data_path: PathBuf,
        index_path: PathBuf,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, ChunkError> {
        let index = if index_path.exists() {
            serializer.load(&index_path)?
        } else {
            ChunkIndex::new()
        };

        Ok(Chunk {
            id,
            data_path,
            index_path,
            serializer,
            index,
            state: State::Closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Number of items indexed in this chunk.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.index.contains(item_id)
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Begin a write session: the data file is created (truncated if it
    /// somehow exists) and the index starts over empty. Appends are only
    /// valid until the matching close.
    pub fn open_for_write(&mut self) -> Result<(), ChunkError> {
        if !matches!(self.state, State::Closed) {
            return Err(ChunkError::AlreadyOpen(self.id));
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.data_path)?;

        self.index.clear();
        self.state = State::Writing {
            file: BufWriter::new(file),
            offset: 0,
        };
        debug!("chunk {}: open for write", self.id);
        Ok(())
    }

    pub fn open_for_read(&mut self) -> Result<(), ChunkError> {
        if !matches!(self.state, State::Closed) {
            return Err(ChunkError::AlreadyOpen(self.id));
        }

        let file = File::open(&self.data_path)?;
        self.state = State::Reading(file);
        debug!("chunk {}: open for read", self.id);
        Ok(())
    }

    /// Release the file handle; a write session flushes the index first.
    /// Closing a closed chunk is a no-op.
    pub fn close(&mut self) -> Result<(), ChunkError> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => Ok(()),
            State::Reading(_) => {
                debug!("chunk {}: closed (read)", self.id);
                Ok(())
            }
            State::Writing { mut file, .. } => {
                file.flush()?;
                self.flush()?;
                debug!("chunk {}: closed (write, {} items)", self.id, self.index.len());
                Ok(())
            }
        }
    }

    /// Run `f` inside a write session, closing (and thereby flushing the
    /// index) whether or not `f` succeeds.
    pub fn with_write<T, F>(&mut self, f: F) -> Result<T, ChunkError>
    where
        F: FnOnce(&mut Chunk) -> Result<T, ChunkError>,
    {
        self.open_for_write()?;
        let out = f(self);
        let closed = self.close();
        match out {
            Ok(v) => closed.map(|()| v),
            Err(e) => Err(e),
        }
    }

    /// Run `f` inside a read session, closing on every exit path.
    pub fn with_read<T, F>(&mut self, f: F) -> Result<T, ChunkError>
    where
        F: FnOnce(&mut Chunk) -> Result<T, ChunkError>,
    {
        self.open_for_read()?;
        let out = f(self);
        let closed = self.close();
        match out {
            Ok(v) => closed.map(|()| v),
            Err(e) => Err(e),
        }
    }

    /// Append one item: every frame becomes one record at the current write
    /// position, and `meta` lands on the item's metadata list. The write
    /// cursor only ever moves forward. An empty frame list is legal and
    /// produces an entry with metadata but no locators.
    pub fn append(&mut self, item_id: &str, meta: Value, frames: &[Vec<u8>]) -> Result<(), ChunkError> {
        let (file, offset) = match &mut self.state {
            State::Writing { file, offset } => (file, offset),
            _ => {
                return Err(ChunkError::UnsupportedMode {
                    id: self.id,
                    needed: "write",
                })
            }
        };

        for frame in frames {
            let rec = record::encode(frame)?;
            file.write_all(&rec.bytes)?;

            self.index.entry_or_default(item_id).frames.push(FrameLocator {
                offset: *offset,
                payload_len: rec.payload_len,
                pad_len: rec.pad_len,
            });
            *offset += rec.bytes.len() as u64;
        }

        self.index.entry_or_default(item_id).meta_data.push(meta);
        Ok(())
    }

    /// Read an item's frames back, optionally restricted to a sub-range of
    /// frame positions (clamped to the frame count, like a slice).
    pub fn read(
        &mut self,
        item_id: &str,
        frame_range: Option<Range<usize>>,
    ) -> Result<ItemData, ChunkError> {
        let file = match &mut self.state {
            State::Reading(file) => file,
            _ => {
                return Err(ChunkError::UnsupportedMode {
                    id: self.id,
                    needed: "read",
                })
            }
        };

        let entry = self
            .index
            .get(item_id)
            .ok_or_else(|| ChunkError::UnknownItem(item_id.to_string()))?;

        let count = entry.frames.len();
        let range = match frame_range {
            Some(r) => r.start.min(count)..r.end.min(count),
            None => 0..count,
        };
        let locators = if range.start < range.end {
            &entry.frames[range]
        } else {
            &[]
        };

        let mut frames = Vec::with_capacity(locators.len());
        for locator in locators {
            file.seek(SeekFrom::Start(locator.offset))?;
            let mut buf = vec![0; locator.record_len()];
            file.read_exact(&mut buf)?;
            frames.push(record::decode(buf, locator)?);
        }

        Ok((frames, entry.first_meta()))
    }

    /// Persist the in-memory index to the index file. Idempotent; safe at
    /// any point during a write session.
    pub fn flush(&self) -> Result<(), ChunkError> {
        self.serializer.dump(&self.index, &self.index_path)?;
        Ok(())
    }

    /// Lazily iterate every item as (frames, metadata) pairs.
    ///
    /// `filter_ids` restricts to the intersection with the chunk's ids,
    /// keeping the chunk's natural order; `shuffled` instead visits a fresh
    /// uniformly random permutation. The chunk is held open for read for
    /// the iterator's whole lifetime and closed when it is exhausted or
    /// dropped.
    pub fn iter_all(
        &mut self,
        filter_ids: Option<&HashSet<String>>,
        shuffled: bool,
    ) -> Result<ItemIter<'_>, ChunkError> {
        let mut ids: Vec<String> = self
            .index
            .ids()
            .filter(|id| filter_ids.map_or(true, |f| f.contains(*id)))
            .map(str::to_string)
            .collect();

        if shuffled {
            ids.shuffle(&mut rand::thread_rng());
        }

        self.open_for_read()?;
        Ok(ItemIter {
            chunk: self,
            ids,
            pos: 0,
            closed: false,
        })
    }
}

pub struct ItemIter<'a> {
    chunk: &'a mut Chunk,
    ids: Vec<String>,
    pos: usize,
    closed: bool,
}

impl Iterator for ItemIter<'_> {
    type Item = Result<ItemData, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        if self.pos >= self.ids.len() {
            self.close_once();
            return None;
        }

        let id = self.ids[self.pos].clone();
        self.pos += 1;
        Some(self.chunk.read(&id, None))
    }
}

impl ItemIter<'_> {
    fn close_once(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.chunk.close() {
                warn!("chunk {}: close after iteration failed: {}", self.chunk.id, e);
            }
        }
    }
}

impl Drop for ItemIter<'_> {
    fn drop(&mut self) {
        self.close_once();
    }
}

#[cfg(test)]
mod test_chunk {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    use crate::serializer::JsonSerializer;

    fn test_chunk(dir: &Path) -> Chunk {
        Chunk::new(
            0,
            dir.join("data_0.gulp"),
            dir.join("meta_0.gmeta"),
            Arc::new(JsonSerializer),
        )
        .unwrap()
    }

    fn frames(spec: &[&[u8]]) -> Vec<Vec<u8>> {
        spec.iter().map(|f| f.to_vec()).collect()
    }

    #[test]
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                c.append("a", json!({"label": "first"}), &frames(&[b"one", b"three", b"fifteen!"]))?;
                c.append("b", json!({"label": "second"}), &frames(&[b"x"]))?;
                Ok(())
            })
            .unwrap();

        let (got, meta) = chunk.with_read(|c| c.read("a", None)).unwrap();
        assert_eq!(got, frames(&[b"one", b"three", b"fifteen!"]));
        assert_eq!(meta, json!({"label": "first"}));

        let (got, meta) = chunk.with_read(|c| c.read("b", None)).unwrap();
        assert_eq!(got, frames(&[b"x"]));
        assert_eq!(meta, json!({"label": "second"}));
    }

    #[test]
    fn offsets_are_aligned_and_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                c.append("a", Value::Null, &frames(&[b"1", b"22", b"333", b"4444", b"55555"]))
            })
            .unwrap();

        let locators = &chunk.index().get("a").unwrap().frames;
        let mut last_end = 0;
        for locator in locators {
            assert_eq!(locator.offset % 4, 0);
            assert_eq!(locator.offset, last_end);
            last_end = locator.offset + locator.record_len() as u64;
        }
    }

    #[test]
    fn read_sub_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                c.append("clip", json!({"fps": 10}), &frames(&[b"f0", b"f1", b"f2", b"f3", b"f4"]))
            })
            .unwrap();

        let (got, meta) = chunk.with_read(|c| c.read("clip", Some(1..3))).unwrap();
        assert_eq!(got, frames(&[b"f1", b"f2"]));
        assert_eq!(meta, json!({"fps": 10}));

        // Out of range ends clamp instead of failing
        let (got, _) = chunk.with_read(|c| c.read("clip", Some(3..99))).unwrap();
        assert_eq!(got, frames(&[b"f3", b"f4"]));

        let (got, _) = chunk.with_read(|c| c.read("clip", Some(7..9))).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn unknown_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| c.append("a", Value::Null, &frames(&[b"z"])))
            .unwrap();

        let err = chunk.with_read(|c| c.read("nope", None));
        assert!(matches!(err, Err(ChunkError::UnknownItem(id)) if id == "nope"));
    }

    #[test]
    fn wrong_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        assert!(matches!(
            chunk.append("a", Value::Null, &frames(&[b"z"])),
            Err(ChunkError::UnsupportedMode { needed: "write", .. })
        ));

        chunk
            .with_write(|c| {
                // Reading mid write session is not a thing
                assert!(matches!(
                    c.read("a", None),
                    Err(ChunkError::UnsupportedMode { needed: "read", .. })
                ));
                c.append("a", Value::Null, &frames(&[b"z"]))
            })
            .unwrap();
    }

    #[test]
    fn reopen_while_open_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk.open_for_write().unwrap();
        assert!(matches!(chunk.open_for_write(), Err(ChunkError::AlreadyOpen(0))));
        assert!(matches!(chunk.open_for_read(), Err(ChunkError::AlreadyOpen(0))));
        chunk.close().unwrap();

        // And close is idempotent
        chunk.close().unwrap();
    }

    #[test]
    fn empty_frame_list_keeps_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| c.append("hollow", json!({"why": "no frames"}), &[]))
            .unwrap();

        assert!(chunk.contains("hollow"));
        let entry = chunk.index().get("hollow").unwrap();
        assert!(entry.frames.is_empty());

        let (got, meta) = chunk.with_read(|c| c.read("hollow", None)).unwrap();
        assert!(got.is_empty());
        assert_eq!(meta, json!({"why": "no frames"}));
    }

    #[test]
    fn failed_write_session_still_closes_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        let err: Result<(), ChunkError> = chunk.with_write(|c| {
            c.append("kept", json!(1), &frames(&[b"data"]))?;
            Err(ChunkError::UnknownItem("boom".to_string()))
        });
        assert!(err.is_err());

        // The session closed on the error path, so the chunk can reopen and
        // the index made it to disk.
        let reloaded = test_chunk(dir.path());
        assert!(reloaded.contains("kept"));
    }

    #[test]
    fn flush_is_idempotent_mid_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                c.append("a", json!(1), &frames(&[b"aa"]))?;
                c.flush()?;
                c.flush()?;
                c.append("b", json!(2), &frames(&[b"bb"]))?;
                Ok(())
            })
            .unwrap();

        let reloaded = test_chunk(dir.path());
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn index_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut chunk = test_chunk(dir.path());
            chunk
                .with_write(|c| c.append("persisted", json!({"k": "v"}), &frames(&[b"abcd", b"efg"])))
                .unwrap();
        }

        let mut chunk = test_chunk(dir.path());
        assert_eq!(chunk.len(), 1);
        let (got, meta) = chunk.with_read(|c| c.read("persisted", None)).unwrap();
        assert_eq!(got, frames(&[b"abcd", b"efg"]));
        assert_eq!(meta, json!({"k": "v"}));
    }

    #[test]
    fn iterate_all_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                for id in ["c", "a", "b"] {
                    c.append(id, json!({ "id": id }), &frames(&[id.as_bytes()]))?;
                }
                Ok(())
            })
            .unwrap();

        let metas: Vec<Value> = chunk
            .iter_all(None, false)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(metas, vec![json!({"id": "c"}), json!({"id": "a"}), json!({"id": "b"})]);

        // Iterator closed the chunk behind itself
        chunk.open_for_read().unwrap();
        chunk.close().unwrap();
    }

    #[test]
    fn iterate_filtered_follows_chunk_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                for id in ["c", "a", "b"] {
                    c.append(id, json!({ "id": id }), &frames(&[id.as_bytes()]))?;
                }
                Ok(())
            })
            .unwrap();

        let filter: HashSet<String> = ["b", "c", "ghost"].iter().map(|s| s.to_string()).collect();
        let metas: Vec<Value> = chunk
            .iter_all(Some(&filter), false)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();

        // Chunk order, not filter order; missing ids are ignored
        assert_eq!(metas, vec![json!({"id": "c"}), json!({"id": "b"})]);
    }

    #[test]
    fn iterate_shuffled_is_a_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| {
                for i in 0..16 {
                    let id = format!("item-{i}");
                    c.append(&id, json!({ "id": id }), &frames(&[b"payload"]))?;
                }
                Ok(())
            })
            .unwrap();

        let mut seen: Vec<String> = chunk
            .iter_all(None, true)
            .unwrap()
            .map(|r| r.unwrap().1["id"].as_str().unwrap().to_string())
            .collect();
        seen.sort();

        let mut expect: Vec<String> = (0..16).map(|i| format!("item-{i}")).collect();
        expect.sort();
        assert_eq!(seen, expect);
    }

    #[test]
    fn abandoned_iterator_releases_the_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = test_chunk(dir.path());

        chunk
            .with_write(|c| c.append("a", Value::Null, &frames(&[b"zz"])))
            .unwrap();

        {
            let mut iter = chunk.iter_all(None, false).unwrap();
            let _ = iter.next();
            // dropped before exhaustion
        }

        chunk.open_for_read().unwrap();
        chunk.close().unwrap();
    }
}
