#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]

mod commands;
mod logging;

use clap::Parser;
use commands::install::InstallArgs;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fastpkg")]
#[command(author, version, about = "Install npm packages into node_modules", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install packages (from package.json when no spec is given)
    Install {
        /// Package specs, e.g. `react`, `lodash@^4`, `@types/node@20`
        specs: Vec<String>,

        /// Registry URL (overrides .npmrc and FASTPKG_NPM_REGISTRY)
        #[arg(long, value_name = "URL")]
        registry: Option<String>,

        /// Use a throwaway cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Maximum concurrent downloads
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// Also install devDependencies
        #[arg(long)]
        dev: bool,

        /// Skip optionalDependencies
        #[arg(long)]
        no_optional: bool,
    },

    /// Inspect or clear the tarball cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Print version information
    Version,
}

#[derive(clap::Subcommand, Debug, Clone, Copy)]
enum CacheCommands {
    /// List cached tarballs
    List,
    /// Remove every cached tarball
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Install {
            specs,
            registry,
            no_cache,
            concurrency,
            dev,
            no_optional,
        } => commands::install::run(
            &cwd,
            &InstallArgs {
                specs,
                registry,
                no_cache,
                concurrency,
                dev,
                no_optional,
            },
            cli.json,
        ),
        Commands::Cache { action } => match action {
            CacheCommands::List => commands::cache::list(&cwd, cli.json),
            CacheCommands::Clear => commands::cache::clear(&cwd, cli.json),
        },
        Commands::Version => {
            println!("fastpkg {}", fastpkg_core::VERSION);
            Ok(())
        }
    }
}
