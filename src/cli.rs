mod help_text;

use crate::dispatch::DEFAULT_STATE_DIR;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Mediated, auditable filesystem access for local assistants
#[derive(Parser, Debug)]
#[command(name = "sandward", version, about, long_about = help_text::ROOT_LONG_ABOUT)]
pub struct Cli {
    /// Sandbox root; change to this directory before operating
    #[arg(short = 'C', value_name = "DIRECTORY", global = true)]
    pub directory: Option<PathBuf>,

    /// State directory, relative to the sandbox root
    #[arg(long, value_name = "DIR", default_value = DEFAULT_STATE_DIR, global = true)]
    pub state_dir: PathBuf,

    /// Increase log verbosity (-v info, -vv debug). Takes precedence over RUST_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Set the log level explicitly. Takes precedence over RUST_LOG.
    #[arg(
        long,
        value_name = "LEVEL",
        value_enum,
        conflicts_with = "verbose",
        global = true
    )]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Args, Debug)]
pub struct ManifestArg {
    /// Manifest file, absolute or relative to the sandbox root [default: <STATE_DIR>/manifest]
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show where a path resolves inside the sandbox
    Resolve {
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Print a file from the sandbox
    Read {
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// List a directory in the sandbox
    List {
        #[arg(value_name = "PATH", default_value = ".")]
        path: String,
    },

    /// Stage a write without touching the target
    #[command(long_about = help_text::PROPOSE_LONG_ABOUT)]
    Propose {
        #[arg(value_name = "PATH")]
        path: String,

        /// Proposed file content
        #[arg(long, value_name = "TEXT", required_unless_present = "from_file")]
        content: Option<String>,

        /// Read the proposed content from a file
        #[arg(long, value_name = "FILE", conflicts_with = "content")]
        from_file: Option<PathBuf>,
    },

    /// Commit a staged proposal to disk
    #[command(long_about = help_text::APPLY_LONG_ABOUT)]
    Apply {
        #[arg(value_name = "ID")]
        id: String,

        /// Never use git apply; always write atomically
        #[arg(long)]
        no_git: bool,
    },

    /// List staged proposals, oldest first
    Proposals,

    /// Delete a staged proposal without applying it
    Discard {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Verify tracked files against the integrity manifest
    #[command(long_about = help_text::VERIFY_LONG_ABOUT)]
    Verify {
        #[command(flatten)]
        manifest: ManifestArg,
    },

    /// Restore tracked files from the reference tarball
    #[command(long_about = help_text::RESTORE_LONG_ABOUT)]
    Restore {
        /// Files to restore [default: everything verify flags]
        #[arg(value_name = "PATHS")]
        paths: Vec<String>,

        /// Show what would be restored without writing
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        manifest: ManifestArg,
    },

    /// Write a reference tarball and an integrity manifest
    #[command(long_about = help_text::MANIFEST_LONG_ABOUT)]
    Manifest {
        /// Files to track [default: every regular file in the sandbox]
        #[arg(value_name = "FILES")]
        files: Vec<String>,

        /// Reference tarball to write [default: <STATE_DIR>/reference.tar.gz]
        #[arg(long, value_name = "PATH")]
        tarball: Option<PathBuf>,

        #[command(flatten)]
        manifest: ManifestArg,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
