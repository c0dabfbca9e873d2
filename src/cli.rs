use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::{
    indexer::DEFAULT_BATCH_SIZE,
    search::{DEFAULT_LIMIT, DEFAULT_THRESHOLD},
};

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    version,
    about = "Hybrid search and grounded answers over markdown documentation"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk, embed and store a directory of markdown files
    Index(IndexArgs),
    /// Chunk a directory without embedding and write the chunks as JSON
    Chunk(ChunkArgs),
    /// Hybrid search over indexed chunks
    Search(SearchArgs),
    /// Answer a question from the indexed documentation
    Ask(AskArgs),
    /// Show index statistics and token usage
    Status(StatusArgs),
    /// Remove a document and its chunks from the index
    Remove {
        /// Source path of the document, relative to the indexed root
        source: String,
    },
    /// Show or change stored provider settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Directory of markdown files
    #[arg(required_unless_present = "from_dump", conflicts_with = "from_dump")]
    pub dir: Option<PathBuf>,

    /// Index a chunk dump written by `docrag chunk` instead of a directory
    #[arg(long, value_name = "FILE")]
    pub from_dump: Option<PathBuf>,

    /// Chunks per embedding request
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Remove indexed documents that are no longer in the source
    #[arg(long)]
    pub prune: bool,

    /// Embedding model to use
    #[arg(long)]
    pub embed_model: Option<String>,
}

// -- Chunk --

#[derive(Debug, Parser)]
pub struct ChunkArgs {
    /// Directory of markdown files
    pub dir: PathBuf,

    /// Write the dump here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    /// Minimum fused score
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f32,

    /// Rerank results with the cross-encoder
    #[arg(long)]
    pub rerank: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question; prompted for on stdin when omitted
    #[arg(trailing_var_arg = true)]
    pub question: Vec<String>,

    /// Number of context chunks
    #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    /// Minimum fused score for context chunks
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f32,

    /// Chat model to answer with
    #[arg(long)]
    pub model: Option<String>,

    /// Skip reranking of retrieved chunks
    #[arg(long)]
    pub no_rerank: bool,

    /// Print the answer as it is generated
    #[arg(long, conflicts_with = "json")]
    pub stream: bool,

    /// Output the answer and sources as JSON
    #[arg(long)]
    pub json: bool,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl AskArgs {
    /// The question from the trailing words, if any were given.
    pub fn question_text(&self) -> Option<String> {
        let joined = self.question.join(" ");
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every resolved setting and where defaults apply
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in the index database
    Set {
        /// Setting key (e.g. chat_model, voyage_api_key)
        key: String,
        value: String,
    },
    /// Clear a stored setting
    Clear {
        /// Setting key
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}
