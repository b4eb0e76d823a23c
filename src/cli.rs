use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line entry point for wrenmail.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the config file (spec §6 key=value format).
    #[arg(long, default_value = "wrenmail.conf")]
    pub config: PathBuf,

    /// Verbose logging: overrides the config file's log_level with "debug".
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Export a folder's cached messages to a Maildir on disk.
    ExportMaildir {
        /// Folder to export.
        folder: String,
        /// Destination Maildir root.
        destination: PathBuf,
    },
    /// Re-encrypt the cache and address book under a new password.
    ChangePassword,
    /// Run the interactive client (default when no subcommand is given).
    Run,
}
