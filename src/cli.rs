use std::path::PathBuf;
use serde::Deserialize;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "Gulp")]
#[command(about = "Pack frame sequences into chunked storage with random access reads")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest a directory of items into a chunked storage location
    Ingest {
        /// Source directory, one subdirectory per item
        #[arg(short, long)]
        input: PathBuf,

        /// Storage location for the chunk file pairs
        #[arg(short, long)]
        output: PathBuf,

        /// Items packed into each chunk
        #[arg(long)]
        items_per_chunk: Option<usize>,

        /// Ingestion worker count
        #[arg(long)]
        workers: Option<usize>,

        /// Index file encoding
        #[arg(long, value_enum)]
        format: Option<IndexFormat>,

        /// Mark frame payloads as raw sample buffers instead of codec output
        #[arg(long)]
        raw_frames: bool,
    },

    /// List the chunks and items of a storage location
    List {
        /// The storage location to scan
        location: PathBuf,

        /// Index file encoding
        #[arg(long, value_enum)]
        format: Option<IndexFormat>,
    },

    /// Extract one item's frames and metadata
    Extract {
        /// The storage location to read from
        location: PathBuf,

        /// The item id to extract
        #[arg(short, long)]
        id: String,

        /// Output directory for frame files and metadata
        #[arg(short, long)]
        output: PathBuf,

        /// Index file encoding
        #[arg(long, value_enum)]
        format: Option<IndexFormat>,
    },
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexFormat {
    #[default]
    Json,
    Msgpack,
}

// Configuration defaults; explicit flags win over the file
#[derive(Deserialize, Debug, Default)]
pub struct Config {
    pub items_per_chunk: Option<usize>,
    pub workers: Option<usize>,
    pub format: Option<IndexFormat>,
}
