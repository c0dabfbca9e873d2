use std::{
    collections::HashSet,
    io::{BufRead, IsTerminal, Write},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use docrag::{
    DataDir,
    Error,
    LocalStore,
    Result,
    chunking::ChunkingConfig,
    cli::{
        AskArgs,
        ChunkArgs,
        Cli,
        Command,
        ConfigAction,
        IndexArgs,
        SearchArgs,
    },
    config::{Overrides, Setting, Settings},
    indexer::{Indexer, IndexerConfig},
    ingestion::{self, ChunkDump, SourceChunk},
    mcp::{self, McpState},
    rag::{AskOptions, Orchestrator, RagAnswer},
    search::{self, HybridRetriever, SearchParams},
    store::{self, IndexStore},
    usage::UsageTotals,
    walker,
};
use kdam::{BarExt, tqdm};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // These never touch the data directory.
    match &cli.command {
        Command::Completions(args) => {
            args.generate();
            return Ok(());
        }
        Command::Chunk(args) => return cmd_chunk(args).await,
        _ => {}
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let store: Arc<dyn IndexStore> = Arc::new(LocalStore::open(&data_dir)?);

    match cli.command {
        Command::Index(args) => cmd_index(store, &args).await?,
        Command::Search(args) => cmd_search(store, &args).await?,
        Command::Ask(args) => cmd_ask(store, &args).await?,
        Command::Status(args) => {
            cmd_status(store.as_ref(), &data_dir, args.json).await?
        }
        Command::Remove { source } => {
            if !store.delete_document(&source).await? {
                return Err(Error::NotFound {
                    kind: "document",
                    name: source,
                });
            }
            eprintln!("Removed '{source}'.");
        }
        Command::Config { action } => cmd_config(store.as_ref(), action).await?,
        Command::Mcp => cmd_mcp(store).await?,
        Command::Completions(_) | Command::Chunk(_) => {}
    }

    Ok(())
}

/// Discover and chunk a directory on the blocking pool.
async fn chunk_directory(dir: &std::path::Path) -> Result<Vec<SourceChunk>> {
    let files = walker::discover_files(dir)?;
    eprintln!("Found {} markdown files", files.len());
    let chunks = tokio::task::spawn_blocking(move || {
        ingestion::prepare_files(&files, &ChunkingConfig::default())
    })
    .await?;
    Ok(chunks)
}

async fn cmd_chunk(args: &ChunkArgs) -> Result<()> {
    let chunks = chunk_directory(&args.dir).await?;
    let dump = ChunkDump::new(chunks, &ChunkingConfig::default());

    match &args.output {
        Some(path) => {
            dump.write(path)?;
            eprintln!(
                "Wrote {} chunks to {}",
                dump.metadata.total_chunks,
                path.display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&dump)?),
    }
    Ok(())
}

async fn cmd_index(store: Arc<dyn IndexStore>, args: &IndexArgs) -> Result<()> {
    let overrides = Overrides {
        embed_model: args.embed_model.clone(),
        ..Overrides::default()
    };
    let settings = Settings::load(store.as_ref(), &overrides).await?;
    let embedder = settings.embedder()?;

    let chunks = match (&args.from_dump, &args.dir) {
        (Some(dump), _) => {
            let dump = ChunkDump::read(dump)?;
            eprintln!("Loaded {} chunks from dump", dump.chunks.len());
            dump.chunks
        }
        (None, Some(dir)) => chunk_directory(dir).await?,
        (None, None) => {
            return Err(Error::Config(
                "a directory or --from-dump is required".into(),
            ));
        }
    };

    if args.prune {
        let present: HashSet<&str> = chunks
            .iter()
            .map(|c| c.document.source_path.as_str())
            .collect();
        let mut pruned = 0;
        for doc in store.list_documents().await? {
            if !present.contains(doc.meta.source_path.as_str())
                && store.delete_document(&doc.meta.source_path).await?
            {
                tracing::debug!(
                    source = %doc.meta.source_path,
                    "pruned document"
                );
                pruned += 1;
            }
        }
        eprintln!("Pruned {pruned} documents no longer in the source");
    }

    let indexer = Indexer::new(store, embedder).with_config(IndexerConfig {
        batch_size: args.batch_size,
    });

    let mut bar = None;
    let report = indexer
        .index_with_progress(chunks, |progress| {
            let bar = bar.get_or_insert_with(|| {
                tqdm!(
                    total = progress.total_batches,
                    desc = "Embedding",
                    unit = " batches"
                )
            });
            let _ = bar.update(1);
        })
        .await?;
    if bar.is_some() {
        eprintln!();
    }

    eprintln!(
        "Indexed {} documents: {} inserted, {} updated, {} unchanged \
         ({} moved), {} failed ({} tokens)",
        report.documents,
        report.inserted,
        report.updated,
        report.skipped,
        report.relocated,
        report.failed,
        report.embedding_tokens,
    );
    if !report.is_complete() {
        eprintln!(
            "{} of {} batches failed; run the command again to retry them.",
            report.failed_batches.len(),
            report.batches
        );
    }
    Ok(())
}

async fn cmd_search(
    store: Arc<dyn IndexStore>,
    args: &SearchArgs,
) -> Result<()> {
    let settings =
        Settings::load(store.as_ref(), &Overrides::default()).await?;
    let embedder = settings.embedder()?;
    let retriever = HybridRetriever::new(Arc::clone(&store), embedder);

    let params = SearchParams {
        query: args.query.clone(),
        limit: args.limit,
        threshold: args.threshold,
    };
    let mut results = retriever.search(&params).await?;

    if args.rerank {
        let reranked = settings.reranker()?.rerank(&args.query, results).await;
        if let Some(usage) = reranked.usage {
            store::record_best_effort(store.as_ref(), usage).await;
        }
        results = reranked.results;
    }

    if args.json {
        search::format_json(&results, &args.query)?;
    } else {
        search::format_human(&results);
    }
    Ok(())
}

async fn cmd_ask(store: Arc<dyn IndexStore>, args: &AskArgs) -> Result<()> {
    let overrides = Overrides {
        chat_model: args.model.clone(),
        ..Overrides::default()
    };
    let settings = Settings::load(store.as_ref(), &overrides).await?;
    settings.require_all(&[Setting::VoyageApiKey, Setting::OpenAiApiKey])?;

    let question = match args.question_text() {
        Some(question) => question,
        None => tokio::task::spawn_blocking(read_question)
            .await??
            .ok_or(Error::EmptyQuestion)?,
    };

    let embedder = settings.embedder()?;
    let retriever = HybridRetriever::new(Arc::clone(&store), embedder);
    let reranker = settings.reranker()?;
    let orchestrator =
        Orchestrator::new(store, retriever, reranker, settings.llm()?);
    let options = AskOptions {
        limit: args.limit,
        threshold: args.threshold,
        model: settings.chat_model().to_string(),
        rerank: !args.no_rerank,
    };
    let timeout = args.timeout.map(Duration::from_secs);

    if args.stream {
        let answer = match timeout {
            Some(timeout) => {
                orchestrator
                    .stream_with_timeout(
                        &question,
                        &options,
                        timeout,
                        print_token,
                    )
                    .await?
            }
            None => {
                let stream =
                    orchestrator.answer_stream(&question, &options).await?;
                stream.finish(print_token).await?
            }
        };
        println!();
        print_sources(&answer);
        return Ok(());
    }

    let answer = match timeout {
        Some(timeout) => {
            orchestrator
                .answer_with_timeout(&question, &options, timeout)
                .await?
        }
        None => orchestrator.answer(&question, &options).await?,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer);
    }
    Ok(())
}

/// Prompt on stderr and read one line. `None` when nothing was entered.
fn read_question() -> Result<Option<String>> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Question: ");
        std::io::stderr().flush()?;
    }
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}

fn print_token(token: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{token}")?;
    stdout.flush()?;
    Ok(())
}

fn print_answer(answer: &RagAnswer) {
    println!("{}", answer.answer);
    print_sources(answer);
}

fn print_sources(answer: &RagAnswer) {
    if answer.sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for source in &answer.sources {
        let section = source
            .heading
            .as_deref()
            .map(|h| format!(" > {h}"))
            .unwrap_or_default();
        println!(
            "  [{}] {}{section} ({:.4})",
            source.citation_number, source.title, source.similarity
        );
        println!("      {}", source.url);
    }
    if let Some(usage) = answer.usage {
        eprintln!(
            "Tokens: {} prompt, {} completion",
            usage.prompt_tokens, usage.completion_tokens
        );
    }
}

async fn cmd_status(
    store: &dyn IndexStore,
    data_dir: &DataDir,
    json: bool,
) -> Result<()> {
    let stats = store.stats().await?;
    let totals = UsageTotals::from_records(&store.list_usage().await?);

    if json {
        let out = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "index": stats,
            "usage": totals,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Documents: {}", stats.documents);
        println!(
            "Chunks: {} ({} embedded)",
            stats.chunks, stats.embedded_chunks
        );
        println!("Token usage ({} records):", totals.records);
        println!("  embedding:  {}", totals.embedding_tokens);
        println!("  rerank:     {}", totals.rerank_tokens);
        println!("  generation: {}", totals.generation_tokens);
    }
    Ok(())
}

async fn cmd_config(
    store: &dyn IndexStore,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let settings = Settings::load(store, &Overrides::default()).await?;
            if json {
                let out: serde_json::Map<String, serde_json::Value> =
                    Setting::ALL
                        .into_iter()
                        .map(|s| {
                            let value = settings.display_value(s);
                            (s.key().to_string(), value.into())
                        })
                        .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for setting in Setting::ALL {
                    println!(
                        "{:<16} {:<22} {}",
                        setting.key(),
                        setting.env_var(),
                        settings.display_value(setting)
                    );
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let setting = parse_setting(&key)?;
            store.set_setting(setting.key(), &value).await?;
            eprintln!("Stored {setting}.");
        }
        ConfigAction::Clear { key } => {
            let setting = parse_setting(&key)?;
            // Blank values resolve as unset.
            store.set_setting(setting.key(), "").await?;
            eprintln!("Cleared {setting}.");
        }
    }
    Ok(())
}

fn parse_setting(key: &str) -> Result<Setting> {
    Setting::from_key(key).ok_or_else(|| {
        let known: Vec<&str> = Setting::ALL.iter().map(|s| s.key()).collect();
        Error::Config(format!(
            "unknown setting '{key}' (expected one of: {})",
            known.join(", ")
        ))
    })
}

async fn cmd_mcp(store: Arc<dyn IndexStore>) -> Result<()> {
    let settings =
        Settings::load(store.as_ref(), &Overrides::default()).await?;
    let embedder = settings.embedder()?;
    let retriever = HybridRetriever::new(Arc::clone(&store), embedder);
    let llm = match settings.llm() {
        Ok(llm) => Some(llm),
        Err(Error::MissingCredential(var)) => {
            tracing::warn!(
                "{var} is not set, query_knowledge_base is disabled"
            );
            None
        }
        Err(e) => return Err(e),
    };
    let state = McpState::new(
        store,
        retriever,
        settings.reranker()?,
        llm,
        settings.chat_model(),
    );
    mcp::run_mcp(state).await
}
