use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// devshell - reproducible development shells from a declarative manifest
///
/// devshell reads `devshell.toml`, resolves its pinned inputs into
/// content-addressed snapshots, layers overlays onto the base package set and
/// evaluates shell definitions into environment descriptors for every
/// supported platform.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the manifest
    #[arg(
        short,
        long,
        global = true,
        env = "DEVSHELL_MANIFEST",
        value_name = "PATH",
        default_value = "devshell.toml"
    )]
    pub manifest: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Output the activation script for a shell on this platform
    ///
    /// Evaluates the shell for the current (or given) platform only and prints
    /// nothing unless every requested package resolves.
    Env {
        /// Shell syntax (zsh, bash, fish); defaults to config or $SHELL
        #[arg(short, long, value_name = "SHELL")]
        shell: Option<String>,

        /// Shell definition from the manifest
        #[arg(short, long, value_name = "NAME", default_value = "default")]
        name: String,

        /// Target platform (defaults to the host)
        #[arg(short, long, value_name = "PLATFORM")]
        platform: Option<String>,
    },

    /// Evaluate a shell for several platforms
    Build {
        /// Shell definition from the manifest
        #[arg(short, long, value_name = "NAME", default_value = "default")]
        name: String,

        /// Platforms to build (defaults to every supported platform)
        #[arg(short, long = "platform", value_name = "PLATFORM")]
        platforms: Vec<String>,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the composed package set for a platform
    Show {
        /// Target platform (defaults to the host)
        #[arg(short, long, value_name = "PLATFORM")]
        platform: Option<String>,
    },

    /// Resolve every input and write devshell.lock
    Lock {
        /// Re-resolve only these inputs, ignoring their locked revision
        #[arg(short, long = "update", value_name = "INPUT")]
        update: Vec<String>,
    },

    /// Validate the manifest and report every issue
    Check,
}
