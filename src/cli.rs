//! Command line interface for the `reassembly` binary.
//!
//! The binary replays fragment scripts through a reassembly table, which is
//! handy for reproducing dissector bug reports without a capture file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command line arguments for the `reassembly` binary.
#[derive(Debug, Parser)]
#[command(name = "reassembly", version, about = "Replay fragment scripts through a reassembly table")]
pub struct Cli {
    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands understood by the binary.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Feed a fragment script through a table and print completed messages.
    Replay {
        /// Path to the fragment script.
        script: PathBuf,

        /// Number of passes over the script; later passes must agree with the first.
        #[arg(short, long, default_value_t = 2)]
        passes: usize,

        /// Print the fragment tree of every completed message.
        #[arg(long)]
        tree: bool,

        /// Treat a second, different final fragment as an error.
        #[arg(long)]
        strict_tails: bool,

        /// Key identities by addresses only, ignoring ports.
        #[arg(long)]
        ignore_ports: bool,

        /// Largest message accepted, in bytes.
        #[arg(long)]
        max_message_size: Option<usize>,
    },
}
