use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docsift",
    about = "Search your documents by keyword, typo-tolerant and semantic matching"
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
    /// Manage indexed directories
    Dir {
        #[command(subcommand)]
        action: DirAction,
    },
    /// Bring the index in line with the registered directories
    Sync(SyncArgs),
    /// Search indexed documents
    Search(SearchArgs),
    /// Complete the last word of a partial query
    Suggest {
        /// The partial query
        partial: String,
    },
    /// Show or rebuild the topic hierarchy
    Topics(TopicsArgs),
    /// Migrate every document to another embedding model
    Reencode(ReencodeArgs),
    /// Show index statistics
    Status(StatusArgs),
    /// Show or change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Directory subcommands --

#[derive(Debug, Subcommand)]
pub enum DirAction {
    /// Register a directory for indexing
    Add {
        /// Path to the directory
        path: PathBuf,
        /// Name for the directory (defaults to its file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Unregister a directory and drop its documents from the index
    Remove {
        /// Name of the directory
        name: String,
    },
    /// List registered directories
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Sync --

#[derive(Debug, Parser)]
pub struct SyncArgs {
    /// Sync only this directory
    #[arg(long)]
    pub name: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query; supports AND, OR, NOT, quotes and parentheses
    pub query: String,

    /// Disable boolean keyword matching
    #[arg(long)]
    pub no_exact: bool,

    /// Disable typo-tolerant matching
    #[arg(long)]
    pub no_fuzzy: bool,

    /// Disable embedding similarity
    #[arg(long)]
    pub no_semantic: bool,

    /// Only return these file types (repeatable, e.g. --type md)
    #[arg(long = "type")]
    pub file_types: Vec<String>,

    /// Only documents modified on or after this date (YYYY-MM-DD)
    #[arg(long)]
    pub since: Option<String>,

    /// Only documents modified on or before this date (YYYY-MM-DD)
    #[arg(long)]
    pub until: Option<String>,

    /// Minimum relevance score in [0, 1]
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Sort by relevance, date or name
    #[arg(long, default_value = "relevance")]
    pub sort: String,

    /// 1-based result page
    #[arg(long, default_value = "1")]
    pub page: usize,

    /// Results per page (defaults to the configured page size)
    #[arg(short = 'n', long)]
    pub page_size: Option<usize>,

    /// Restrict results to a topic path, e.g. cooking/recipes
    #[arg(long)]
    pub topic: Option<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Topics --

#[derive(Debug, Parser)]
pub struct TopicsArgs {
    /// Rebuild the hierarchy before printing it
    #[arg(long)]
    pub regenerate: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Re-encoding --

#[derive(Debug, Parser)]
pub struct ReencodeArgs {
    /// Model to migrate to
    pub model: String,

    /// Only retry documents left on an older model by a previous run
    #[arg(long)]
    pub retry_legacy: bool,
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
    /// Print the effective configuration as JSON
    Show,
    /// Persist a setting, e.g. `search.enable_fuzzy false`
    Set {
        /// Dotted setting key
        key: String,
        /// JSON value; bare words are taken as strings
        value: String,
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
            "docsift",
            &mut std::io::stdout(),
        );
    }
}
