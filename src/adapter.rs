//! Item sources for ingestion
//!
//! Adapters enumerate the items to be packed and hand the pipeline their
//! frames and metadata. The pipeline never looks inside frame payloads;
//! whatever the adapter yields is what lands on disk.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::PathBuf;

use serde_json::{json, Value};

/// Adapter failures are opaque to the pipeline; they abort the worker that
/// hit them and surface unwrapped.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

// TODO: yield frames lazily so an oversized item does not have to sit in
// memory whole before its first record is written
/// One source item: an ordered frame sequence plus its metadata record.
pub struct Item {
    pub id: String,
    pub meta: Value,
    pub frames: Vec<Vec<u8>>,
}

/// An enumerable source of items.
///
/// `len` fixes the item universe up front so ranges can be partitioned
/// before any worker starts; `iter_range` must be lazy, finite, and
/// restartable on every call.
pub trait Adapter: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter_range(&self, range: Range<usize>)
        -> Box<dyn Iterator<Item = Result<Item, AdapterError>> + '_>;
}

/// Filesystem adapter: every direct subdirectory of a root is one item,
/// the files inside it (sorted by name) are its frame payloads.
pub struct FsAdapter {
    items: Vec<PathBuf>,
}

impl FsAdapter {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let mut items: Vec<PathBuf> = fs::read_dir(&root)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .collect();
        items.sort();

        Ok(FsAdapter { items })
    }

    fn load_item(path: &PathBuf) -> Result<Item, AdapterError> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("unusable item directory name: {}", path.display()))?
            .to_string();

        let mut frame_paths: Vec<PathBuf> = fs::read_dir(path)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|e| e.path().is_file())
            .map(|e| e.path())
            .collect();
        frame_paths.sort();

        let mut frames = Vec::with_capacity(frame_paths.len());
        for frame_path in &frame_paths {
            frames.push(fs::read(frame_path)?);
        }

        let meta = json!({
            "id": id,
            "source": path.display().to_string(),
            "frame_count": frames.len(),
        });

        Ok(Item { id, meta, frames })
    }
}

impl Adapter for FsAdapter {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn iter_range(
        &self,
        range: Range<usize>,
    ) -> Box<dyn Iterator<Item = Result<Item, AdapterError>> + '_> {
        let range = range.start.min(self.items.len())..range.end.min(self.items.len());
        Box::new(self.items[range].iter().map(Self::load_item))
    }
}

#[cfg(test)]
mod test_fs_adapter {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();

        for (item, frames) in [("walk", vec!["f0", "f1"]), ("jump", vec!["f0"])] {
            let item_dir = dir.path().join(item);
            fs::create_dir(&item_dir).unwrap();
            for frame in frames {
                fs::write(item_dir.join(frame), format!("{item}:{frame}")).unwrap();
            }
        }
        fs::write(dir.path().join("stray.txt"), "not an item").unwrap();

        dir
    }

    #[test]
    fn items_are_sorted_subdirectories() {
        let dir = fixture();
        let adapter = FsAdapter::open(dir.path()).unwrap();

        assert_eq!(adapter.len(), 2);

        let items: Vec<Item> = adapter
            .iter_range(0..adapter.len())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items[0].id, "jump");
        assert_eq!(items[1].id, "walk");
        assert_eq!(items[1].frames, vec![b"walk:f0".to_vec(), b"walk:f1".to_vec()]);
        assert_eq!(items[0].meta["frame_count"], 1);
    }

    #[test]
    fn iter_range_is_restartable() {
        let dir = fixture();
        let adapter = FsAdapter::open(dir.path()).unwrap();

        for _ in 0..2 {
            let ids: Vec<String> = adapter
                .iter_range(1..2)
                .map(|r| r.unwrap().id)
                .collect();
            assert_eq!(ids, vec!["walk"]);
        }
    }

    #[test]
    fn out_of_bounds_range_is_clamped() {
        let dir = fixture();
        let adapter = FsAdapter::open(dir.path()).unwrap();

        assert_eq!(adapter.iter_range(5..9).count(), 0);
    }
}
