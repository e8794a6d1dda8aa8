use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod commands;
mod config;
mod eid;
mod faces;
mod images;
mod lock;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::AppFactory;
use lock::IndexLock;

/// `RUST_LOG` wins; otherwise info level. The fmt subscriber also picks up
/// records from the `log` macros.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let paths = AppFactory::get_paths()?;

    match args.command {
        cli::Command::Daemon {} => {
            let _lock = IndexLock::try_acquire(Path::new(&paths.base_path), "daemon")
                .context("Failed to lock the face index")?;

            let service = AppFactory::create_service(&paths)?;
            web::start_daemon(service)
        }

        cli::Command::Ingest {
            paths: inputs,
            max_faces,
        } => {
            let _lock = IndexLock::try_acquire(Path::new(&paths.base_path), "ingest")
                .context("Failed to lock the face index")?;

            let mut config = AppFactory::create_config(&paths)?;
            if let Some(max_faces) = max_faces {
                if max_faces == 0 {
                    bail!("--max-faces must be greater than 0");
                }
                config.face_index.max_faces_per_image = max_faces;
            }

            let extractor = AppFactory::create_extractor(&config, &paths)?;
            let service = AppFactory::create_service_with(&paths, config, extractor)?;

            let summary = commands::ingest(&service, &inputs)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if summary.cancelled {
                log::warn!("ingestion cancelled");
            }
            Ok(())
        }

        cli::Command::Search {
            image,
            threshold,
            top_k,
        } => {
            let config = AppFactory::create_config(&paths)?;
            let outcome = commands::search(&paths, &config, &image, threshold, top_k)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }

        cli::Command::Stats {} => {
            let config = AppFactory::create_config(&paths)?;
            let stats = commands::stats(&paths, &config)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }

        cli::Command::Verify {} => {
            let config = AppFactory::create_config(&paths)?;
            let report = commands::verify(&paths, &config)?;
            println!("{report}");
            Ok(())
        }
    }
}
