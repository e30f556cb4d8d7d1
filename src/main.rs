//! Exercise the Ananas inode and dentry caches from the command line.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

mod app_config;
mod stress;
mod trc;
mod walk;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Stress and inspect the Ananas VFS inode and dentry caches."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to an ananas-vfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hammer one inode cache from several threads and check its invariants.
    Stress {
        /// Number of worker threads. Defaults to `workload.threads`.
        #[arg(short, long)]
        threads: Option<usize>,

        /// Lookups per thread. Defaults to `workload.ops`.
        #[arg(short, long)]
        ops: Option<usize>,

        /// Number of distinct inodes. Defaults to `workload.keys`.
        #[arg(short, long)]
        keys: Option<u64>,
    },

    /// Resolve paths in a generated tree and dump both caches.
    Walk {
        /// Paths to resolve, e.g. `/etc/motd` or `/mnt/readme`.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    match args.command {
        Command::Stress { threads, ops, keys } => {
            let workload = stress::Workload {
                threads: threads.unwrap_or(config.workload.threads),
                ops: ops.unwrap_or(config.workload.ops),
                keys: keys.unwrap_or(config.workload.keys),
            };
            if workload.threads == 0 || workload.keys == 0 {
                error!("--threads and --keys must be at least 1");
                std::process::exit(1);
            }
            match stress::run(&config.cache.icache, workload) {
                Ok(report) => info!(
                    elapsed = ?report.elapsed,
                    loads = report.loads,
                    exhausted = report.exhausted,
                    stats = ?report.stats,
                    "stress run passed"
                ),
                Err(e) => {
                    error!("Stress run failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Walk { paths } => {
            if let Err(e) = walk::run(&config.cache, &paths) {
                error!("Walk failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Config => match config.to_toml() {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },
    }
}
