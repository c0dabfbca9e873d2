//! docrag - hybrid retrieval and grounded question answering over markdown
//! documentation.
//!
//! Markdown files are split into overlapping chunks, embedded in batches and
//! stored in a local [redb](https://github.com/cberner/redb) database with a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index alongside.
//! Queries run a dense and a sparse search concurrently, fuse the two
//! rankings with reciprocal rank fusion, optionally rerank, and hand the
//! best chunks to a chat model as cited context.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docrag::{DataDir, LocalStore, config::{Overrides, Settings}};
//! use docrag::rag::{AskOptions, Orchestrator};
//! use docrag::search::HybridRetriever;
//! use docrag::store::IndexStore;
//!
//! # async fn run() -> docrag::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let store: Arc<dyn IndexStore> = Arc::new(LocalStore::open(&data_dir)?);
//! let settings = Settings::load(store.as_ref(), &Overrides::default()).await?;
//!
//! let embedder = settings.embedder()?;
//! let retriever = HybridRetriever::new(Arc::clone(&store), embedder);
//! let reranker = settings.reranker()?;
//! let orchestrator =
//!     Orchestrator::new(store, retriever, reranker, settings.llm()?);
//!
//! let answer = orchestrator
//!     .answer("How do I cancel a fetch request?", &AskOptions::default())
//!     .await?;
//! println!("{}", answer.answer);
//! for source in &answer.sources {
//!     println!("[{}] {}", source.citation_number, source.url);
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunk_db;
pub mod chunking;
pub mod citation;
pub mod cli;
pub mod config;
pub mod data_dir;
pub mod doc_id;
pub mod embedding;
pub mod error;
pub mod frontmatter;
pub mod http;
pub mod incremental;
pub mod indexer;
pub mod ingestion;
pub mod llm;
pub mod local_store;
pub mod mcp;
pub mod rag;
pub mod reranker;
pub mod search;
pub mod store;
pub mod tantivy_index;
pub mod text_util;
pub mod usage;
pub mod vector;
pub mod walker;

pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use error::{Error, Result};
pub use local_store::LocalStore;
pub use store::IndexStore;
