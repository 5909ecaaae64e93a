/// CLI argument parsing

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "sqlbackup-cli")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up every user database and upload the archive
    Run(RunArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect checkpointed runs
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Backup configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enter the configuration interactively
    #[arg(short, long, conflicts_with = "config")]
    pub interactive: bool,

    /// Local directory for staging, archive and run state
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the planned stages without touching any host
    #[arg(long)]
    pub dry_run: bool,

    /// Continue an aborted run from its state file
    #[arg(long, value_name = "STATE_FILE")]
    pub resume: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Configuration file (defaults to the saved default)
        path: Option<PathBuf>,
    },

    /// Print a sample configuration
    Template,

    /// Remember a configuration file and output directory as defaults
    SetDefault {
        path: PathBuf,

        /// Default local output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Show a run state file
    Show { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "sqlbackup-cli",
            "-vv",
            "run",
            "--config",
            "prod.json",
            "--dry-run",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.config, Some(PathBuf::from("prod.json")));
                assert!(args.dry_run);
                assert!(args.resume.is_none());
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_interactive_conflicts_with_config() {
        let result = Cli::try_parse_from(["sqlbackup-cli", "run", "-i", "-c", "prod.json"]);
        assert!(result.is_err());
    }
}
