use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start faceidx as a service.
    Daemon {},

    /// Index faces from image files or directories
    Ingest {
        /// Image files or directories (searched recursively)
        #[clap(required = true)]
        paths: Vec<PathBuf>,

        /// Keep at most this many faces per image
        #[clap(long)]
        max_faces: Option<usize>,
    },

    /// Find stored faces similar to the face in an image
    Search {
        /// Query image
        image: PathBuf,

        /// Maximum distance for a match (smaller is stricter)
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Number of matches to return
        #[clap(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Print index statistics
    Stats {},

    /// Check that the index on disk is readable and intact
    Verify {},
}
