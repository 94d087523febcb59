use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod documents;
mod semantic;
#[cfg(test)]
mod tests;
mod web;
use cli::{CacheAction, Command};
use config::Config;
use semantic::{EmbeddingCache, EmbeddingModel, SearchEngine};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_cache(config: &Config) -> anyhow::Result<EmbeddingCache> {
    let path = config.cache_path();
    EmbeddingCache::open(&path)
        .with_context(|| format!("failed to open embedding cache at {}", path.display()))
}

fn create_engine(config: &Config) -> anyhow::Result<SearchEngine> {
    let timeout = Duration::from_secs(config.embedding.download_timeout_secs);
    let model = EmbeddingModel::new(
        &config.embedding.model,
        config.base_path().to_path_buf(),
        Some(timeout),
    )
    .context("failed to load embedding model")?;

    Ok(SearchEngine::new(
        Arc::new(model),
        open_cache(config)?,
        config.index.backend,
    ))
}

fn print_results(results: &[semantic::SearchResult]) {
    if results.is_empty() {
        println!("No results found");
        return;
    }

    for (rank, result) in results.iter().enumerate() {
        println!("{}. {} (score={:.3})", rank + 1, result.doc_id, result.score);
        println!("   {}", result.preview);
        println!(
            "   overlap: {} ({:.3}) {:?}",
            result.match_info.token_overlap,
            result.match_info.overlap_ratio,
            result.match_info.matched_tokens
        );
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let config = Config::load().context("failed to load config")?;
    let docs_folder = args
        .docs
        .map(PathBuf::from)
        .unwrap_or_else(|| config.docs_folder_path());

    match args.command {
        Command::Index { force } => {
            let engine = create_engine(&config)?;
            engine.load_documents(&docs_folder)?;
            let report = engine.build_index(force)?;
            engine.close()?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Command::Search { query, top_k, json } => {
            let engine = create_engine(&config)?;
            engine.load_documents(&docs_folder)?;
            engine.build_index(false)?;

            let top_k = top_k.unwrap_or(config.search.default_top_k);
            let results = engine.search(&query, top_k)?;
            engine.close()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
            Ok(())
        }

        Command::Status {} => {
            let engine = create_engine(&config)?;
            if let Err(err) = engine.load_documents(&docs_folder) {
                log::warn!("{err}");
            }

            let status = engine.status();
            let cached = engine.cache().len()?;
            engine.close()?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "docs_folder": docs_folder,
                    "cache": config.cache_path(),
                    "cached_embeddings": cached,
                    "engine": status,
                }))?
            );
            Ok(())
        }

        Command::Cache { action } => {
            let cache = open_cache(&config)?;
            match action {
                CacheAction::List { json } => {
                    let entries = cache.all()?;
                    if json {
                        let rows: Vec<_> = entries
                            .iter()
                            .map(|e| {
                                serde_json::json!({
                                    "doc_id": e.doc_id,
                                    "filename": e.filename,
                                    "content_hash": e.content_hash,
                                    "dimensions": e.embedding.len(),
                                    "updated_at": e.updated_at.to_rfc3339(),
                                })
                            })
                            .collect();
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    } else {
                        for e in &entries {
                            println!(
                                "{}\t{}\t{}\t{}d\t{}",
                                e.doc_id,
                                e.filename,
                                &e.content_hash[..e.content_hash.len().min(12)],
                                e.embedding.len(),
                                e.updated_at.to_rfc3339()
                            );
                        }
                        println!("{} entries", entries.len());
                    }
                }
                CacheAction::Prune {} => {
                    let keep: Vec<String> = documents::load_documents(&docs_folder)?
                        .into_iter()
                        .map(|d| d.doc_id)
                        .collect();
                    let removed = cache.prune(&keep)?;
                    println!("{removed} stale entries removed");
                }
            }
            cache.close()?;
            Ok(())
        }

        Command::Serve { listen } => {
            let engine = Arc::new(create_engine(&config)?);

            match engine.load_documents(&docs_folder) {
                Ok(count) => {
                    if count == 0 {
                        log::warn!("no documents found in '{}'", docs_folder.display());
                    }
                    if let Err(err) = engine.build_index(false) {
                        log::error!("failed to build index: {err}");
                    }
                }
                Err(err) => log::warn!("{err}"),
            }

            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let state = web::SharedState {
                engine,
                default_top_k: config.search.default_top_k,
            };
            web::start_daemon(state, &listen)
        }
    }
}
