use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::bids::pipeline::RunMode;
use crate::commands::{self, CommandReport};
use crate::logging;

#[derive(Debug, Parser)]
#[command(
    name = "mspaths2bids",
    version,
    about = "Convert MSPATHS DICOM bundles into a BIDS tree"
)]
pub struct Cli {
    /// Log verbosity when RUST_LOG is unset.
    #[arg(
        long,
        global = true,
        default_value = "info",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    log_level: String,

    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert every not-yet-processed bundle archive under SOURCE.
    Extract { source: PathBuf, target: PathBuf },
    /// Convert a single bundle archive.
    ExtractBundle {
        zipfile: PathBuf,
        target: PathBuf,
        /// Convert even if the ledger lists the archive.
        #[arg(long)]
        force: bool,
    },
    /// Replace raw date session labels with sequential ses-NNN ids.
    Cleanup { target: PathBuf },
    /// List subject ids present in a BIDS tree.
    Subjects { target: PathBuf },
    /// Show resolved paths, config and converter availability.
    Status,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "{}: {}",
        report.command,
        if report.ok { "ok" } else { "failed" }
    );
    for line in &report.details {
        println!("  {line}");
    }
    for line in &report.warnings {
        println!("  warning: {line}");
    }
    for line in &report.issues {
        println!("  issue: {line}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let report = match cli.command {
        Command::Extract { source, target } => {
            commands::extract::run(&commands::extract::ExtractOptions {
                source,
                target,
                mode: RunMode::Batch,
            })?
        }
        Command::ExtractBundle {
            zipfile,
            target,
            force,
        } => commands::extract::run(&commands::extract::ExtractOptions {
            source: zipfile,
            target,
            mode: RunMode::Single { force },
        })?,
        Command::Cleanup { target } => {
            commands::cleanup::run(&commands::cleanup::CleanupOptions { target })?
        }
        Command::Subjects { target } => {
            commands::subjects::run(&commands::subjects::SubjectsOptions { target })?
        }
        Command::Status => commands::status::run()?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
