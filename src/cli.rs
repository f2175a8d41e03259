use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::tenant::TenantId;

#[derive(Debug, Parser)]
#[command(
    name = "ragdex",
    about = "Per-tenant semantic document retrieval"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Tenant namespace to operate on
    #[arg(long, global = true, default_value = "global")]
    pub tenant: TenantId,

    /// Embedding backend
    #[arg(long, global = true, value_enum, default_value_t = EmbedderKind::Colbert)]
    pub embedder: EmbedderKind,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    /// ColBERT checkpoint, mean-pooled
    Colbert,
    /// Model-free feature hashing
    Hashing,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a document and add it to the tenant's index
    Add(AddArgs),
    /// Search the tenant's documents
    Search(SearchArgs),
    /// Re-embed every stored document of the tenant
    Rebuild,
    /// Show index and storage statistics
    Status(StatusArgs),
    /// Manage engine settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Add --

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Document identifier, unique within the tenant
    pub document_id: String,

    /// Read the document text from this file
    #[arg(long, conflicts_with = "text", required_unless_present = "text")]
    pub file: Option<PathBuf>,

    /// Use this string as the document text
    #[arg(long)]
    pub text: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return (defaults to the top_k setting)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
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
    /// Show the effective settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting
    Set {
        /// Setting name (e.g. top_k, hnsw.m, model_name)
        key: String,
        value: String,
    },
    /// Remove a stored setting (revert to default)
    Unset { key: String },
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
            "ragdex",
            &mut std::io::stdout(),
        );
    }
}
