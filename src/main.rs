use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;
use tracing_subscriber::EnvFilter;

mod app;
mod cache;
mod cli;
mod config;
mod dedup;
mod embedding;
mod errors;
mod geometry;
mod indexer;
mod jobs;
mod matcher;
mod metadata;
mod reference;
mod scanner;
mod search;
mod store;
#[cfg(test)]
mod tests;
mod web;

use app::App;
use config::Config;
use reference::ImageReference;
use search::Query;

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}")
    {
        pb.set_style(style);
    }
    pb
}

async fn run(command: cli::Command, app: App) -> anyhow::Result<()> {
    match command {
        cli::Command::Serve { listen } => web::start_daemon(app, &listen).await,

        cli::Command::Index { folder, batch_size } => {
            let root: ImageReference = folder.parse()?;
            let batch_size = batch_size.unwrap_or(app.config.default_batch_size);

            let cancel = Arc::new(AtomicBool::new(false));
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::warn!("stopping after the current batch");
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            });

            let pb = progress_bar();
            pb.set_message(root.to_string());
            let report = app
                .indexer
                .index_folder(&root, batch_size, &cancel, {
                    let pb = pb.clone();
                    move |processed: usize, total: usize| {
                        pb.set_length(total as u64);
                        pb.set_position(processed as u64);
                    }
                })
                .await?;
            pb.finish_and_clear();

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        cli::Command::Scan { folder } => {
            let root: ImageReference = folder.parse()?;
            let refs = app.scanner.scan(&root).await?;
            for reference in &refs {
                println!("{reference}");
            }
            eprintln!("{} images", refs.len());
            Ok(())
        }

        cli::Command::Search {
            query,
            image,
            top_k,
            geo,
            start,
            end,
        } => {
            let query = if image {
                Query::Image(query.parse()?)
            } else {
                Query::Text(query)
            };
            let hits = app
                .search
                .search(&query, top_k, geo.bounds(), start.as_deref(), end.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
            Ok(())
        }

        cli::Command::DeleteCollection { yes } => {
            let collection = &app.config.store.collection;
            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Are you sure you want to delete collection {collection} ({} points)?",
                    app.store.count().await?
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            app.store.delete_collection().await?;
            println!("collection {collection} deleted");
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let config = Config::load_with(&PathBuf::from(&args.base_dir))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?
        .block_on(async {
            let app = App::connect(config).await?;
            run(args.command, app).await
        })
}
