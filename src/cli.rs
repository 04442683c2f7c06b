use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "annosearch",
    about = "Per-project search indexes over annotated documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory holding the project workspaces (default: <data dir>/workspace)
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Rebuild a project's index from its documents
    Reindex(ReindexArgs),
    /// Search a project's index
    Search(SearchArgs),
    /// Show index status for one or all projects
    Status(StatusArgs),
    /// Delete a project's index and its record
    Remove(RemoveArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Reindex --

#[derive(Debug, Parser)]
pub struct ReindexArgs {
    /// Project name
    pub project: String,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Project name
    pub project: String,

    /// The search query
    pub query: String,

    /// Search as this annotator
    #[arg(short, long, default_value = "anonymous")]
    pub user: String,

    /// Restrict to one source document (by file name)
    #[arg(short, long)]
    pub document: Option<String>,

    /// Only report hits inside spans of this layer
    #[arg(short, long)]
    pub layer: Option<String>,

    /// Group hits by this feature of --layer
    #[arg(short, long, requires = "layer")]
    pub feature: Option<String>,

    /// Skip this many hits
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Number of hits to return
    #[arg(short = 'n', long, default_value = "50")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Build the index now if it is not ready, then search
    #[arg(long)]
    pub wait: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Only show this project
    pub project: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Remove --

#[derive(Debug, Parser)]
pub struct RemoveArgs {
    /// Project name
    pub project: String,
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
            "annosearch",
            &mut std::io::stdout(),
        );
    }
}
