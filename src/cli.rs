//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keystone - dependency-ordered Bundle reconciliation
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(version)]
#[command(about = "Reconcile Bundles of interdependent resources in dependency order")]
#[command(
    long_about = "Keystone builds the dependency graph of a Bundle, applies its resources in order against an object store and reports per-resource and aggregate status."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a bundle's dependency graph and print its processing order
    Validate {
        /// Bundle manifest (YAML or JSON)
        #[arg(short, long)]
        bundle: PathBuf,
    },

    /// Reconcile a bundle against an in-memory store and print its status
    Run {
        /// Bundle manifest (YAML or JSON)
        #[arg(short, long)]
        bundle: PathBuf,

        /// Controller configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Namespace used when the manifest sets none
        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// Print the transition counters after the pass
        #[arg(long, default_value_t = false)]
        metrics: bool,
    },
}
