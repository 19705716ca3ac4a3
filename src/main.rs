use std::error::Error;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::error;

mod cli;
use crate::cli::Cli;
use crate::cli::Commands;
use crate::cli::Config;
use crate::cli::IndexFormat;

use gulp::adapter::FsAdapter;
use gulp::directory::Directory;
use gulp::ingest::{IngestOptions, Ingestor};
use gulp::serializer::{JsonSerializer, MessagePackSerializer, Serializer};

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    let config: Config = match &cli.config {
        Some(path) => match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: bad config {}: {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            },
            Err(e) => {
                eprintln!("error: cannot read config {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serializer_for(format: IndexFormat) -> Arc<dyn Serializer> {
    match format {
        IndexFormat::Json => Arc::new(JsonSerializer),
        IndexFormat::Msgpack => Arc::new(MessagePackSerializer),
    }
}

fn run(command: Commands, config: Config) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Ingest {
            input,
            output,
            items_per_chunk,
            workers,
            format,
            raw_frames,
        } => {
            let adapter = FsAdapter::open(&input)?;

            let defaults = IngestOptions::default();
            let options = IngestOptions {
                items_per_chunk: items_per_chunk
                    .or(config.items_per_chunk)
                    .unwrap_or(defaults.items_per_chunk),
                workers: workers.or(config.workers).unwrap_or(defaults.workers),
                encode_frames: !raw_frames,
            };
            let serializer = serializer_for(format.or(config.format).unwrap_or_default());

            let report = Ingestor::new(&adapter, &output, serializer, options).run()?;
            println!(
                "{} items into {} chunks under {} ({} skipped)",
                report.items_written,
                report.chunks_written,
                output.display(),
                report.items_skipped,
            );
        }

        Commands::List { location, format } => {
            let serializer = serializer_for(format.or(config.format).unwrap_or_default());
            let directory = Directory::open(&location, serializer)?;

            println!(
                "{}: {} chunks, {} items",
                location.display(),
                directory.chunks().count(),
                directory.len(),
            );
            for chunk in directory.chunks() {
                println!("  chunk {} ({} items)", chunk.id(), chunk.len());
                for id in chunk.index().ids() {
                    println!("    {id}");
                }
            }
        }

        Commands::Extract {
            location,
            id,
            output,
            format,
        } => {
            let serializer = serializer_for(format.or(config.format).unwrap_or_default());
            let mut directory = Directory::open(&location, serializer)?;

            let (frames, meta) = directory.get(&id, None)?;

            fs::create_dir_all(&output)?;
            for (i, frame) in frames.iter().enumerate() {
                fs::write(output.join(format!("frame_{i:05}")), frame)?;
            }
            fs::write(output.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

            println!("{}: {} frames -> {}", id, frames.len(), output.display());
        }
    }

    Ok(())
}
