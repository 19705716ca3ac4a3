//! Parallel ingestion pipeline
//!
//! Turns an adapter's whole item range into a set of new chunks. The item
//! range is partitioned into fixed-size slices before anything runs, one
//! fresh chunk is allocated per slice, and a worker pool writes the slices
//! independently. Workers share nothing: each owns its chunk outright and
//! only meets the others at the filesystem.
//!
//! Which chunk an item lands in is decided entirely by the partitioning,
//! so the output is reproducible for a fixed `items_per_chunk` no matter
//! how many workers run. A failing worker fails the run, but chunks other
//! workers already finished stay on disk; staging to a scratch location is
//! the caller's tool if all-or-nothing output is needed.

use std::fs;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use thiserror::Error;

use crate::adapter::{Adapter, AdapterError};
use crate::chunk::{Chunk, ChunkError};
use crate::directory::{Directory, DirectoryError};
use crate::serializer::Serializer;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("items_per_chunk and workers must both be nonzero")]
    InvalidOptions,
    #[error("adapter failed: {0}")]
    Adapter(#[source] AdapterError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Slice size of the range partitioning; also the item capacity of each
    /// produced chunk (the last one may hold fewer).
    pub items_per_chunk: usize,
    /// Worker pool size; effective parallelism is additionally bounded by
    /// the number of slices.
    pub workers: usize,
    /// Whether frame payloads are codec output or raw sample buffers. The
    /// pipeline records the choice for readers and the adapter boundary,
    /// it never looks at payload bytes itself.
    pub encode_frames: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            items_per_chunk: 100,
            workers: 1,
            encode_frames: true,
        }
    }
}

/// What one ingestion run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub chunks_written: usize,
    pub items_written: usize,
    pub items_skipped: usize,
}

/// Partition `[0, total)` into half-open slices of `items_per_chunk`, the
/// last one possibly shorter. Slice count is `ceil(total / items_per_chunk)`.
pub fn calculate_ranges(items_per_chunk: usize, total: usize) -> Vec<Range<usize>> {
    assert!(items_per_chunk > 0, "items_per_chunk must be nonzero");

    (0..total)
        .step_by(items_per_chunk)
        .map(|start| start..(start + items_per_chunk).min(total))
        .collect()
}

pub struct Ingestor<'a, A> {
    adapter: &'a A,
    output: PathBuf,
    serializer: Arc<dyn Serializer>,
    options: IngestOptions,
}

impl<'a, A: Adapter> Ingestor<'a, A> {
    pub fn new(
        adapter: &'a A,
        output: impl Into<PathBuf>,
        serializer: Arc<dyn Serializer>,
        options: IngestOptions,
    ) -> Self {
        Ingestor {
            adapter,
            output: output.into(),
            serializer,
            options,
        }
    }

    /// Run the whole pipeline and wait for every worker.
    ///
    /// The first worker error surfaces as the run error; chunks completed
    /// by other workers are left in place.
    pub fn run(&self) -> Result<IngestReport, IngestError> {
        if self.options.items_per_chunk == 0 || self.options.workers == 0 {
            return Err(IngestError::InvalidOptions);
        }

        fs::create_dir_all(&self.output)?;

        let directory = Directory::open(&self.output, Arc::clone(&self.serializer))?;
        let ranges = calculate_ranges(self.options.items_per_chunk, self.adapter.len());
        let chunks = directory.allocate_new_chunks(ranges.len())?;

        info!(
            "ingesting {} items into {} chunks under {} ({} workers, {} frames)",
            self.adapter.len(),
            ranges.len(),
            self.output.display(),
            self.options.workers,
            if self.options.encode_frames { "encoded" } else { "raw" },
        );

        let work: Vec<(Range<usize>, Chunk)> = ranges.into_iter().zip(chunks).collect();
        let chunks_written = work.len();

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .build()?;

        let counts: Vec<(usize, usize)> = pool.install(|| {
            work.into_par_iter()
                .map(|(range, mut chunk)| self.write_slice(range, &mut chunk))
                .collect::<Result<Vec<_>, IngestError>>()
        })?;

        let report = IngestReport {
            chunks_written,
            items_written: counts.iter().map(|c| c.0).sum(),
            items_skipped: counts.iter().map(|c| c.1).sum(),
        };
        info!(
            "ingestion done: {} items written, {} skipped, {} chunks",
            report.items_written, report.items_skipped, report.chunks_written
        );
        Ok(report)
    }

    /// One worker: a single write session on a single chunk. The close (and
    /// with it the index flush) runs whether or not the slice succeeded.
    fn write_slice(&self, range: Range<usize>, chunk: &mut Chunk) -> Result<(usize, usize), IngestError> {
        debug!("chunk {}: writing items {:?}", chunk.id(), range);

        chunk.open_for_write()?;
        let result = self.append_slice(range, chunk);
        let closed = chunk.close();

        let counts = result?;
        closed?;
        Ok(counts)
    }

    fn append_slice(&self, range: Range<usize>, chunk: &mut Chunk) -> Result<(usize, usize), IngestError> {
        let mut written = 0;
        let mut skipped = 0;

        for item in self.adapter.iter_range(range) {
            let item = item.map_err(IngestError::Adapter)?;

            if item.frames.is_empty() {
                warn!("item {}: no frames, skipping", item.id);
                skipped += 1;
                continue;
            }

            chunk.append(&item.id, item.meta, &item.frames)?;
            written += 1;
        }

        Ok((written, skipped))
    }
}

#[cfg(test)]
mod test_ranges {
    use super::*;

    #[test]
    fn concrete_partitioning() {
        assert_eq!(calculate_ranges(3, 10), vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn exact_multiple() {
        assert_eq!(calculate_ranges(5, 10), vec![0..5, 5..10]);
    }

    #[test]
    fn single_oversized_slice() {
        assert_eq!(calculate_ranges(100, 7), vec![0..7]);
    }

    #[test]
    fn empty_source() {
        assert!(calculate_ranges(4, 0).is_empty());
    }

    #[test]
    fn partitioning_properties() {
        for items_per_chunk in 1..8 {
            for total in 1..40 {
                let ranges = calculate_ranges(items_per_chunk, total);

                // ceil(total / items_per_chunk) slices
                assert_eq!(ranges.len(), total.div_ceil(items_per_chunk));

                // contiguous, non overlapping, covering [0, total)
                let mut expect_start = 0;
                for range in &ranges {
                    assert_eq!(range.start, expect_start);
                    assert!(range.len() >= 1 && range.len() <= items_per_chunk);
                    expect_start = range.end;
                }
                assert_eq!(expect_start, total);
            }
        }
    }
}
