// pyznap is a policy-driven ZFS snapshot and replication tool
// Copyright (C) 2025  The pyznap authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::config::{self, PolicyEntry};
use crate::global;
use crate::global::defaults::{CONFIG_DIR, CONFIG_FILE};
use crate::ui;
use crate::utils::format_count;

pub mod cmd_send;
pub mod cmd_setup;
pub mod cmd_snap;

// CLI arguments
#[derive(Parser, Debug)]
#[clap(
    version = env!("CARGO_PKG_VERSION"),
    about = "ZFS snapshot and replication tool",
)]
pub struct Cli {
    // Subcommand
    #[command(subcommand)]
    pub command: Command,

    // Global arguments
    #[clap(flatten)]
    pub global_args: GlobalArgs,
}

// List of commands
#[derive(Subcommand, Debug)]
pub enum Command {
    Setup(cmd_setup::CmdArgs),
    Snap(cmd_snap::CmdArgs),
    Send(cmd_send::CmdArgs),
}

#[derive(Parser, Debug)]
pub struct GlobalArgs {
    /// Path to the config file
    #[clap(long, value_parser)]
    pub config: Option<PathBuf>,

    /// Dry-run, log commands without executing them
    #[clap(short = 'n', long, value_parser)]
    pub dry_run: bool,

    /// Print more verbose output
    #[clap(short = 'v', long, value_parser)]
    pub verbose: bool,

    /// Disable output
    #[clap(long, value_parser)]
    pub quiet: bool,
}

pub fn run(args: &Cli) -> Result<()> {
    match &args.command {
        Command::Setup(cmd_args) => cmd_setup::run(&args.global_args, cmd_args),
        Command::Snap(cmd_args) => cmd_snap::run(&args.global_args, cmd_args),
        Command::Send(cmd_args) => cmd_send::run(&args.global_args, cmd_args),
    }
}

/// Loads the policy file named on the command line, falling back to the
/// system default path.
pub(crate) fn load_config(global_args: &GlobalArgs) -> Result<Vec<PolicyEntry>> {
    let path = global_args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
    Ok(config::read_config(&path)?)
}

/// Shared epilogue of the phase commands: nonzero exit on any per-dataset
/// failure or interrupt.
pub(crate) fn finish(failures: u32) -> Result<()> {
    if global::interrupted() {
        bail!("interrupted");
    }
    if failures > 0 {
        bail!("{} failed", format_count(failures, "dataset", "datasets"));
    }
    ui::cli::log!("Finished successfully...");
    Ok(())
}
