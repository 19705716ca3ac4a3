//! In-memory side index of one chunk
//!
//! Maps item ids to the frame locators and metadata needed to read them
//! back. Iteration order is insertion order and survives a save/load cycle,
//! it is the chunk's natural item order.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::record::FrameLocator;

/// One logical item inside a chunk.
///
/// Frames are ordered, append-only; the index position is the temporal
/// order. `meta_data` is normally a single entry, the first one is the
/// authoritative record for lookups.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ItemEntry {
    #[serde(rename = "frame_info")]
    pub frames: Vec<FrameLocator>,
    #[serde(rename = "meta_data")]
    pub meta_data: Vec<Value>,
}

impl ItemEntry {
    pub fn first_meta(&self) -> Value {
        self.meta_data.first().cloned().unwrap_or(Value::Null)
    }
}

/// Insertion-ordered map of item id to [`ItemEntry`].
#[derive(Debug, Clone, Default)]
pub struct ChunkIndex {
    ids: Vec<String>,
    entries: HashMap<String, ItemEntry>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        ChunkIndex::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ItemEntry> {
        self.entries.get(id)
    }

    /// Item ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ItemEntry)> {
        self.ids.iter().map(move |id| {
            let entry = &self.entries[id];
            (id.as_str(), entry)
        })
    }

    /// Fetch the entry for `id`, inserting an empty one first if the id is
    /// new. The only way entries come into existence.
    pub fn entry_or_default(&mut self, id: &str) -> &mut ItemEntry {
        if !self.entries.contains_key(id) {
            self.ids.push(id.to_string());
        }
        self.entries.entry(id.to_string()).or_default()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.entries.clear();
    }
}

// Serde impls
//
// The top level of the index file is a plain id -> entry mapping, but the
// key order carries meaning (natural iteration order), so the map is
// serialized by hand from the ordered id list and rebuilt in encounter
// order on load.
impl Serialize for ChunkIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.ids.len()))?;
        for (id, entry) in self.iter() {
            map.serialize_entry(id, entry)?;
        }
        map.end()
    }
}

struct ChunkIndexVisitor;

impl<'de> Visitor<'de> for ChunkIndexVisitor {
    type Value = ChunkIndex;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a mapping of item id to index entry")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut index = ChunkIndex::new();

        while let Some((id, entry)) = map.next_entry::<String, ItemEntry>()? {
            index.ids.push(id.clone());
            index.entries.insert(id, entry);
        }

        Ok(index)
    }
}

impl<'de> Deserialize<'de> for ChunkIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ChunkIndex, D::Error> {
        deserializer.deserialize_map(ChunkIndexVisitor)
    }
}
