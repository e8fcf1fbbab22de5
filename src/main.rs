//! Execution controller: the `storyweaver` CLI.
//!
//! Drives ingest → storytell → export, owns the LLM cache lifecycle,
//! builds the route-specific clients, pre-builds retrieval assets
//! when any tier enables memory, and reports run statistics. Exit
//! code is non-zero on validation, configuration, or runtime failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};

use storyweaver::cache::LlmCache;
use storyweaver::config::schema::ChatRoute;
use storyweaver::config::{load_config, masked_env_snapshot, AppConfig, LoadOptions};
use storyweaver::export::{export_book_markdown, ExportMode};
use storyweaver::ingest::ingest_book;
use storyweaver::llm::{EmbeddingProvider, HttpEmbeddingClient, LlmClient};
use storyweaver::retrieval::{prepare_retrieval_assets, HybridRetriever};
use storyweaver::storage::Store;
use storyweaver::storyteller::{
    has_storyteller_memory_retrieval, storytell_book, storytell_book_steps, StorytellerRuntime,
};
use storyweaver::summarize::summarize_book;
use storyweaver::vector::VectorStore;

#[derive(Parser)]
#[command(name = "storyweaver", version, about = "Chapter-by-chapter storyteller rewrites")]
struct Cli {
    /// Path to a custom config YAML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Config profile name under configs/profiles/.
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Override the output directory.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate and print the effective config.
    Config,

    /// Parse chapters, split chunks, store in SQLite.
    Ingest {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        chapter_regex: Option<String>,
    },

    /// LEGACY: generate v1 map-reduce summaries.
    Summarize {
        #[arg(long)]
        book_id: i64,
        #[arg(long)]
        no_export: bool,
    },

    /// Run the chapter-by-chapter storyteller rewrite.
    Storytell {
        #[arg(long)]
        book_id: i64,
        #[arg(long)]
        from_chapter: Option<i64>,
        #[arg(long)]
        to_chapter: Option<i64>,
        #[arg(long)]
        step_size: Option<i64>,
    },

    /// Export markdown outputs from storyteller or legacy data.
    Export {
        #[arg(long)]
        book_id: i64,
        #[arg(long, default_value = "storyteller")]
        mode: String,
    },

    /// Build the vector index and FTS assets for a book.
    Embed {
        #[arg(long)]
        book_id: i64,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },

    /// Run the pipeline: ingest → storytell → export.
    Run {
        #[arg(long)]
        book_id: Option<i64>,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        chapter_regex: Option<String>,
        #[arg(long)]
        from_chapter: Option<i64>,
        #[arg(long)]
        to_chapter: Option<i64>,
        #[arg(long)]
        no_export: bool,
    },
}

fn print_kv(title: &str, rows: &[(&str, String)]) {
    println!("== {title} ==");
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("  {key:width$}  {value}");
    }
}

/// Services shared by the commands: store, cache, vector store, and
/// the embedding client when one resolves.
struct Services {
    store: Arc<Store>,
    cache: Arc<LlmCache>,
    vectors: Arc<VectorStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Services {
    fn open(config: &AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            Store::open(&config.storage.sqlite_path)
                .with_context(|| format!("opening {}", config.storage.sqlite_path.display()))?,
        );
        let cache = Arc::new(LlmCache::open(&config.cache, &config.app.data_dir));
        let vectors = Arc::new(
            VectorStore::open(&config.storage.vector_dir)
                .with_context(|| format!("opening {}", config.storage.vector_dir.display()))?,
        );
        let embedder: Option<Arc<dyn EmbeddingProvider>> = match HttpEmbeddingClient::new(config) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                log::warn!("Embedding client unavailable, dense retrieval disabled: {err}");
                None
            }
        };
        Ok(Self {
            store,
            cache,
            vectors,
            embedder,
        })
    }

    fn chat_client(&self, config: &AppConfig, route: ChatRoute) -> Option<Arc<LlmClient>> {
        match LlmClient::new(config, self.cache.clone(), route) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                log::warn!(
                    "LLM client unavailable route={}; fallback mode enabled: {err}",
                    route.as_str()
                );
                None
            }
        }
    }

    fn storyteller_runtime(&self, config: &Arc<AppConfig>) -> StorytellerRuntime {
        let memory = match (&self.embedder, has_storyteller_memory_retrieval(config)) {
            (Some(embedder), true) => Some(Arc::new(HybridRetriever::new(
                self.store.clone(),
                self.vectors.clone(),
                embedder.clone(),
            )) as Arc<dyn storyweaver::retrieval::MemoryRetriever>),
            _ => None,
        };
        StorytellerRuntime {
            store: self.store.clone(),
            config: config.clone(),
            entity_llm: self.chat_client(config, ChatRoute::StorytellerEntity),
            narration_llm: self.chat_client(config, ChatRoute::StorytellerNarration),
            refine_llm: self.chat_client(config, ChatRoute::StorytellerRefine),
            memory,
        }
    }

    /// Vectors + FTS for a book; best-effort when the embedder is
    /// missing (keyword retrieval still works off the FTS rows).
    async fn prebuild_assets(&self, book_id: i64, batch_size: usize) -> anyhow::Result<()> {
        match &self.embedder {
            Some(embedder) => {
                let stats = prepare_retrieval_assets(
                    &self.store,
                    &self.vectors,
                    embedder.as_ref(),
                    book_id,
                    batch_size,
                )
                .await?;
                log::info!(
                    "Retrieval assets ready chunk_vectors={} narration_vectors={} chunk_fts={} narration_fts={}",
                    stats.chunk_vectors_embedded,
                    stats.narration_vectors_embedded,
                    stats.chunk_fts_rows,
                    stats.narration_fts_rows
                );
            }
            None => {
                let (chunk_rows, narration_rows) = self.store.session(|sess| {
                    Ok((
                        sess.rebuild_chunks_fts_for_book(book_id)?,
                        sess.rebuild_narrations_fts_for_book(book_id)?,
                    ))
                })?;
                log::info!(
                    "FTS assets ready (no embedder) chunk_fts={chunk_rows} narration_fts={narration_rows}"
                );
            }
        }
        Ok(())
    }
}

async fn run_storytell(
    services: &Services,
    config: Arc<AppConfig>,
    book_id: i64,
    from_chapter: Option<i64>,
    to_chapter: Option<i64>,
) -> anyhow::Result<()> {
    if has_storyteller_memory_retrieval(&config) {
        if let Err(err) = services.prebuild_assets(book_id, 32).await {
            log::warn!("Retrieval assets prebuild failed for storyteller retrieval: {err}");
        }
    }
    let runtime = services.storyteller_runtime(&config);

    if config.storyteller.step_size > 1 {
        let stats = storytell_book_steps(&runtime, book_id, from_chapter, to_chapter).await?;
        print_kv(
            "Storytell (step mode)",
            &[
                ("Book ID", stats.book_id.to_string()),
                ("Step size", stats.step_size.to_string()),
                (
                    "Steps (total/processed/cached/skipped)",
                    format!(
                        "{}/{}/{}/{}",
                        stats.steps_total,
                        stats.steps_processed,
                        stats.steps_cached,
                        stats.steps_skipped
                    ),
                ),
                ("Chapters covered", stats.chapters_covered.to_string()),
                ("Checkpoints written", stats.checkpoints_written.to_string()),
                ("LLM calls (est)", stats.llm_calls_estimated.to_string()),
                (
                    "Cache hits/misses",
                    format!("{}/{}", stats.llm_cache_hits, stats.llm_cache_misses),
                ),
                (
                    "Tokens in/out (est)",
                    format!(
                        "{}/{}",
                        stats.input_tokens_estimated, stats.output_tokens_estimated
                    ),
                ),
                (
                    "Consistency warnings/actions",
                    format!("{}/{}", stats.consistency_warnings, stats.consistency_actions),
                ),
                (
                    "Evidence supported/unsupported",
                    format!(
                        "{}/{}",
                        stats.evidence_supported_claims, stats.evidence_unsupported_claims
                    ),
                ),
                ("Runtime (s)", format!("{:.1}", stats.runtime_seconds)),
            ],
        );
    } else {
        let stats = storytell_book(&runtime, book_id, from_chapter, to_chapter).await?;
        print_kv(
            "Storytell",
            &[
                ("Book ID", stats.book_id.to_string()),
                ("Chapters total", stats.chapters_total.to_string()),
                ("Chapters processed", stats.chapters_processed.to_string()),
                ("Chapters skipped", stats.chapters_skipped.to_string()),
                ("LLM calls (est)", stats.llm_calls_estimated.to_string()),
                ("Refine LLM calls", stats.refine_llm_calls_estimated.to_string()),
                (
                    "Cache hits/misses",
                    format!("{}/{}", stats.llm_cache_hits, stats.llm_cache_misses),
                ),
                (
                    "Tokens in/out (est)",
                    format!(
                        "{}/{}",
                        stats.input_tokens_estimated, stats.output_tokens_estimated
                    ),
                ),
                (
                    "Refine tokens in/out (est)",
                    format!(
                        "{}/{}",
                        stats.refine_input_tokens_estimated, stats.refine_output_tokens_estimated
                    ),
                ),
                (
                    "Consistency warnings/actions",
                    format!("{}/{}", stats.consistency_warnings, stats.consistency_actions),
                ),
                (
                    "Evidence supported/unsupported",
                    format!(
                        "{}/{}",
                        stats.evidence_supported_claims, stats.evidence_unsupported_claims
                    ),
                ),
                ("Runtime (s)", format!("{:.1}", stats.runtime_seconds)),
            ],
        );
    }
    Ok(())
}

fn run_export(
    services: &Services,
    config: &AppConfig,
    book_id: i64,
    mode: &str,
) -> anyhow::Result<()> {
    let Some(mode) = ExportMode::parse(mode) else {
        bail!("unsupported export mode: {mode}");
    };
    let result = export_book_markdown(&services.store, config, book_id, mode)?;
    print_kv(
        "Export",
        &[
            ("Mode", result.mode.to_string()),
            ("Output dir", result.output_dir.display().to_string()),
            ("Files written", result.files.len().to_string()),
        ],
    );
    Ok(())
}

fn run_ingest(
    services: &Services,
    config: &AppConfig,
    input: &PathBuf,
    title: Option<&str>,
    author: Option<&str>,
    chapter_regex: Option<&str>,
) -> anyhow::Result<i64> {
    if !input.exists() {
        bail!("input file not found: {}", input.display());
    }
    let stats = ingest_book(&services.store, config, input, title, author, chapter_regex)?;
    print_kv(
        "Ingest",
        &[
            ("Book ID", stats.book_id.to_string()),
            ("Book hash", stats.book_hash.clone()),
            (
                "Encoding",
                format!("{} (confidence {:.2})", stats.encoding, stats.encoding_confidence),
            ),
            (
                "Chapters (total/new)",
                format!("{}/{}", stats.chapters_total, stats.chapters_inserted),
            ),
            (
                "Chunks (total/new)",
                format!("{}/{}", stats.chunks_total, stats.chunks_inserted),
            ),
        ],
    );
    Ok(stats.book_id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut overrides = serde_json::Map::new();
    let mut app_overrides = serde_json::Map::new();
    if let Some(output_dir) = &cli.output_dir {
        app_overrides.insert(
            "output_dir".to_string(),
            serde_json::Value::String(output_dir.display().to_string()),
        );
    }
    if let Some(data_dir) = &cli.data_dir {
        app_overrides.insert(
            "data_dir".to_string(),
            serde_json::Value::String(data_dir.display().to_string()),
        );
    }
    if !app_overrides.is_empty() {
        overrides.insert("app".to_string(), serde_json::Value::Object(app_overrides));
    }

    let mut config = load_config(&LoadOptions {
        config_path: cli.config.clone(),
        profile: cli.profile.clone(),
        overrides: if overrides.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(overrides))
        },
        ..Default::default()
    })?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.app.log_level.clone()),
    )
    .try_init()
    .ok();
    log::info!("Loaded configuration");

    if let Command::Config = cli.command {
        println!("{}", serde_yaml::to_string(&config)?);
        let snapshot: Vec<(String, String)> = masked_env_snapshot(&config)
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_else(|| "-".to_string())))
            .collect();
        let rows: Vec<(&str, String)> = snapshot
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        print_kv("Env snapshot", &rows);
        return Ok(());
    }

    // Command-level knobs that patch the effective config.
    if let Command::Storytell {
        step_size: Some(step_size),
        ..
    } = &cli.command
    {
        if *step_size <= 0 {
            bail!("--step-size must be positive");
        }
        config.storyteller.step_size = *step_size;
    }

    let services = Services::open(&config)?;
    let config = Arc::new(config);

    match cli.command {
        Command::Config => unreachable!("handled above"),

        Command::Ingest {
            input,
            title,
            author,
            chapter_regex,
        } => {
            run_ingest(
                &services,
                &config,
                &input,
                title.as_deref(),
                author.as_deref(),
                chapter_regex.as_deref(),
            )?;
        }

        Command::Summarize { book_id, no_export } => {
            println!(
                "Legacy command: `summarize` belongs to the v1 map-reduce pipeline. \
                 Prefer `storytell`/`run` for the current workflow."
            );
            let client = services
                .chat_client(&config, ChatRoute::Summarize)
                .context("summarize requires a configured LLM route")?;
            let stats = summarize_book(&services.store, &config, client, book_id).await?;
            print_kv(
                "Summarize",
                &[
                    ("Book ID", stats.book_id.to_string()),
                    (
                        "Chapters (total/new)",
                        format!("{}/{}", stats.chapters_total, stats.chapters_new),
                    ),
                    ("Book summary new", stats.book_summary_new.to_string()),
                    ("Characters new", stats.characters_new.to_string()),
                    ("Timeline new", stats.timeline_new.to_string()),
                    ("Story new", stats.story_new.to_string()),
                ],
            );
            if !no_export {
                run_export(&services, &config, book_id, "legacy")?;
            }
        }

        Command::Storytell {
            book_id,
            from_chapter,
            to_chapter,
            ..
        } => {
            run_storytell(&services, config.clone(), book_id, from_chapter, to_chapter).await?;
        }

        Command::Export { book_id, mode } => {
            run_export(&services, &config, book_id, &mode)?;
        }

        Command::Embed {
            book_id,
            batch_size,
        } => {
            if services.embedder.is_none() {
                bail!("embed requires a resolvable embedding route and API key");
            }
            services.prebuild_assets(book_id, batch_size).await?;
        }

        Command::Run {
            book_id,
            input,
            title,
            author,
            chapter_regex,
            from_chapter,
            to_chapter,
            no_export,
        } => {
            let book_id = match book_id {
                Some(book_id) => book_id,
                None => {
                    let Some(input) = input else {
                        bail!("run requires either --book-id or --input");
                    };
                    run_ingest(
                        &services,
                        &config,
                        &input,
                        title.as_deref(),
                        author.as_deref(),
                        chapter_regex.as_deref(),
                    )?
                }
            };
            run_storytell(&services, config.clone(), book_id, from_chapter, to_chapter).await?;
            if !no_export {
                run_export(&services, &config, book_id, "auto")?;
            }
        }
    }

    Ok(())
}
