mod apply;
mod checksum;
mod cli;
mod diffing;
mod dir_list;
mod dispatch;
mod manifest;
mod path_guard;
mod proposal;
mod restore;
mod util;
mod verify;

use anyhow::Context;
use apply::ApplyOptions;
use cli::{Cli, Command, LogLevel};
use dispatch::{DispatchError, Request, Response, RestoreTargets, Sandbox, SandboxConfig};
use std::fmt as stdfmt;
use std::io::{IsTerminal, stderr};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Event, Level, Subscriber, error, info};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

struct SandwardExitCode;

impl SandwardExitCode {
    /// Exit code used when verification found problems or a dry run has work
    /// left to do.
    fn unclean() -> ExitCode {
        ExitCode::from(1)
    }

    /// Exit code used for other errors (rejected paths, drift, I/O errors, etc.).
    fn any_error() -> ExitCode {
        ExitCode::from(255)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_level);

    // Change working directory if -C was specified
    if let Some(directory) = &cli.directory {
        if let Err(e) = std::env::set_current_dir(directory) {
            error!(
                "Failed to change directory to {}: {}",
                directory.display(),
                e
            );
            return SandwardExitCode::any_error();
        }
    }

    match run(cli) {
        Ok(exit_code) => exit_code,
        Err(err) => {
            error!("{err:#}");
            SandwardExitCode::any_error()
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = SandboxConfig::new(PathBuf::from("."));
    config.state_dir = cli.state_dir;

    let request = match cli.command {
        Command::Resolve { path } => Request::Resolve { path },
        Command::Read { path } => Request::Read { path },
        Command::List { path } => Request::List { path },
        Command::Propose {
            path,
            content,
            from_file,
        } => {
            let content = match (content, from_file) {
                (Some(content), _) => content,
                (None, Some(file)) => std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                (None, None) => anyhow::bail!("No content given for {path}"),
            };
            Request::Propose { path, content }
        }
        Command::Apply { id, no_git } => Request::Apply {
            id,
            options: ApplyOptions { use_git: !no_git },
        },
        Command::Proposals => Request::Proposals,
        Command::Discard { id } => Request::Discard { id },
        Command::Verify { manifest } => {
            config.manifest = manifest.manifest;
            Request::Verify
        }
        Command::Restore {
            paths,
            dry_run,
            manifest,
        } => {
            config.manifest = manifest.manifest;
            let targets = if paths.is_empty() {
                RestoreTargets::Flagged
            } else {
                RestoreTargets::Paths(paths)
            };
            Request::Restore { targets, dry_run }
        }
        Command::Manifest {
            files,
            tarball,
            manifest,
        } => {
            config.manifest = manifest.manifest;
            Request::GenerateManifest { tarball, files }
        }
    };

    let sandbox = Sandbox::open(&config)?;

    let response = match sandbox.dispatch(request) {
        Ok(response) => response,
        Err(DispatchError::Restore(failure)) => {
            if !failure.restored.is_empty() {
                diffing::print_fields(
                    &Response::Restored {
                        restored: failure.restored.clone(),
                    }
                    .fields(),
                );
            }
            return Err(DispatchError::Restore(failure).into());
        }
        Err(e) => return Err(e.into()),
    };

    match &response {
        Response::Read { content, .. } => print!("{}", content),
        Response::Verified(report) => diffing::print_report(report),
        other => diffing::print_fields(&other.fields()),
    }

    if let Response::WouldRestore { pending } = &response {
        info!("DRY RUN - {} file(s) would be restored", pending.len());
    }

    if response.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(SandwardExitCode::unclean())
    }
}

/// The filter directive chosen by the command line, if any. `None` defers to
/// RUST_LOG.
fn cli_log_directive(verbose: u8, log_level: Option<LogLevel>) -> Option<&'static str> {
    match (log_level, verbose) {
        (Some(level), _) => Some(level.as_directive()),
        (None, 0) => None,
        (None, 1) => Some("info"),
        (None, _) => Some("debug"),
    }
}

fn init_tracing(verbose: u8, log_level: Option<LogLevel>) {
    let stderr_is_terminal = stderr().is_terminal();
    let formatter = EmojiFormatter { stderr_is_terminal };

    let filter = match cli_log_directive(verbose, log_level) {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    let fmt_layer = tracing_fmt::layer()
        .event_format(formatter)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

struct EmojiFormatter {
    stderr_is_terminal: bool,
}

impl<S, N> FormatEvent<S, N> for EmojiFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        if self.stderr_is_terminal {
            match *event.metadata().level() {
                Level::DEBUG => write!(writer, "🔍 ")?,
                Level::INFO => write!(writer, "ℹ️ ")?,
                Level::WARN => write!(writer, "⚠️  ")?,
                Level::ERROR => write!(writer, "❌ ")?,
                _ => write!(writer, "🔬 ")?,
            }
        } else {
            match *event.metadata().level() {
                Level::DEBUG => writer.write_str("DEBUG: ")?,
                Level::INFO => writer.write_str("INFO: ")?,
                Level::WARN => writer.write_str("WARN: ")?,
                Level::ERROR => writer.write_str("ERROR: ")?,
                _ => writer.write_str("TRACE: ")?,
            }
        }

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
