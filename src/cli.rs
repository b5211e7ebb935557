use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use docseek::hybrid::SortMode;

#[derive(Debug, Parser)]
#[command(
    name = "docseek",
    about = "Hybrid keyword and semantic search over a folder of documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

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

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index a folder, reusing cached results for unchanged files
    Index(IndexArgs),
    /// Search an indexed folder
    Search(SearchArgs),
    /// Show model, index and cache status
    Status(StatusArgs),
    /// Delete every cached index
    ClearCache,
    /// Download models into the data directory
    Download(DownloadArgs),
    /// Manage the model setting
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Interactive session: index once, then search repeatedly
    Shell(ShellArgs),
    /// Write a zip with status, settings and cache metadata for bug reports
    Diagnostics(DiagnosticsArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
    /// Fetch one model from the HuggingFace Hub (used by `download`)
    #[command(hide = true)]
    FetchModel(FetchModelArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Folder to index
    pub folder: PathBuf,

    /// Descend into subfolders
    #[arg(short, long)]
    pub recursive: bool,

    /// Password for a protected document, as RELATIVE_PATH=PASSWORD
    #[arg(long = "password", value_parser = parse_password)]
    pub passwords: Vec<(String, String)>,
}

fn parse_password(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((file, password)) if !file.is_empty() => {
            Ok((file.to_string(), password.to_string()))
        }
        _ => Err(format!("expected FILE=PASSWORD, got {raw:?}")),
    }
}

// -- Search --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SortArg {
    #[default]
    Score,
    Filename,
    Mtime,
}

impl From<SortArg> for SortMode {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Score => SortMode::Score,
            SortArg::Filename => SortMode::Filename,
            SortArg::Mtime => SortMode::Mtime,
        }
    }
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Folder to search (defaults to the most recently indexed one)
    #[arg(short, long)]
    pub folder: Option<PathBuf>,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Only return files with this extension (repeatable)
    #[arg(long = "ext")]
    pub extensions: Vec<String>,

    /// File name substring or glob
    #[arg(long)]
    pub name: Option<String>,

    /// Relative path substring
    #[arg(long)]
    pub path: Option<String>,

    /// Result ordering
    #[arg(long, value_enum, default_value_t)]
    pub sort: SortArg,

    /// Rank by vector similarity only
    #[arg(long)]
    pub no_hybrid: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Load the cached index of this folder before reporting
    #[arg(short, long)]
    pub folder: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Diagnostics --

#[derive(Debug, Parser)]
pub struct DiagnosticsArgs {
    /// Where to write the zip
    #[arg(short, long, default_value = "docseek-diagnostics.zip")]
    pub output: PathBuf,

    /// Load the cached index of this folder first
    #[arg(short, long)]
    pub folder: Option<PathBuf>,
}

// -- Download --

#[derive(Debug, Parser)]
pub struct DownloadArgs {
    /// Model IDs to download (defaults to the configured model)
    pub models: Vec<String>,
}

// -- Model --

#[derive(Debug, Subcommand)]
pub enum ModelAction {
    /// Show the currently resolved model
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a default model ID or local path in the settings file
    Set {
        /// Model ID (HuggingFace) or local path
        model: String,
    },
    /// Clear the stored model setting (revert to default)
    Clear,
}

// -- Shell --

#[derive(Debug, Parser)]
pub struct ShellArgs {
    /// Folder to index and search
    pub folder: PathBuf,

    /// Descend into subfolders
    #[arg(short, long)]
    pub recursive: bool,
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
            "docseek",
            &mut std::io::stdout(),
        );
    }
}

// -- Fetch model --

#[derive(Debug, Parser)]
pub struct FetchModelArgs {
    /// Model ID on the HuggingFace Hub
    pub model: String,

    /// Directory to download into
    #[arg(long)]
    pub dest: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["docseek", "search", "leave policy"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "leave policy");
                assert_eq!(args.count, None);
                assert_eq!(args.sort, SortArg::Score);
                assert!(args.extensions.is_empty());
                assert!(!args.no_hybrid);
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_index_passwords() {
        let cli = Cli::parse_from([
            "docseek",
            "index",
            "/docs",
            "--password",
            "secret.pdf=hunter=2",
            "-r",
        ]);
        match cli.command {
            Command::Index(args) => {
                assert!(args.recursive);
                assert_eq!(
                    args.passwords,
                    vec![("secret.pdf".to_string(), "hunter=2".to_string())]
                );
            }
            _ => panic!("expected index command"),
        }
    }

    #[test]
    fn rejects_malformed_password() {
        assert!(
            Cli::try_parse_from(["docseek", "index", "/docs", "--password", "nofile"])
                .is_err()
        );
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["docseek", "-q", "-v", "status"]).is_err());
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
