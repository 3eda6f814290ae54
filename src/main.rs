//! pkgflow - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pkgflow::util::config::{load_config, LoaderConfig};
use pkgflow::util::logger::{self, LogLevel};
use pkgflow::{demo, dump_package, NAME, VERSION};
use std::path::PathBuf;

/// Asynchronous package loading engine
#[derive(Parser, Debug)]
#[command(name = "pkgflow")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header of a package file
    Inspect {
        /// Package file to inspect
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Load a synthetic import chain and print what happened
    Demo {
        /// Length of the import chain
        #[arg(long, default_value_t = 8)]
        packages: usize,

        /// Exports per package
        #[arg(long, default_value_t = 16)]
        exports: usize,

        /// Worker threads (0 runs everything from the ticking thread)
        #[arg(long)]
        workers: Option<usize>,

        /// I/O budget in bytes
        #[arg(long)]
        budget: Option<u64>,

        /// Loader config file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Inspect { file } => {
            logger::init_with_level(if args.verbose { LogLevel::Debug } else { LogLevel::Warn });
            dump_package(&file).with_context(|| format!("Failed to inspect: {}", file.display()))?;
        }
        Commands::Demo {
            packages,
            exports,
            workers,
            budget,
            config,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)
                    .with_context(|| format!("Failed to load config: {}", path.display()))?,
                None => LoaderConfig::default(),
            };
            if let Some(workers) = workers {
                config.worker_threads = workers;
            }
            if let Some(budget) = budget {
                config.io_budget_bytes = budget;
            }
            logger::init_with_level(if args.verbose {
                LogLevel::Debug
            } else {
                config.log_level()
            });

            let report = demo::run_chain(config, packages, exports);
            for completion in &report.completions {
                println!(
                    "{} {}: {:?}{}",
                    completion.request_id,
                    completion.package_name,
                    completion.result,
                    completion
                        .error
                        .as_ref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
            }
            println!("{} objects loaded in {:?}\n", report.objects, report.elapsed);
            println!("{}", report.stats);
        }
    }

    Ok(())
}
