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
use clap::Args;

use crate::commands::{GlobalArgs, finish, load_config};
use crate::global;
use crate::location::Location;
use crate::replicate::{self, DestSpec};
use crate::replicate::stream::Compression;
use crate::ui;

#[derive(Args, Debug)]
#[clap(
    about = "Replicate snapshots to backup destinations",
    long_about = "Replicate snapshots to the destinations given in the config, or from a \
                  single source to a single dest given on the command line."
)]
pub struct CmdArgs {
    /// Source filesystem
    #[clap(short, long, value_parser)]
    pub source: Option<String>,

    /// Destination filesystem
    #[clap(short, long, value_parser)]
    pub dest: Option<String>,

    /// Compression for the ssh transfer (none, lzop, lz4, gzip, pigz, bzip2, xz)
    #[clap(short, long, value_parser)]
    pub compress: Option<String>,

    /// ssh key if only source or dest is remote
    #[clap(short = 'i', long, value_parser)]
    pub key: Option<PathBuf>,

    /// ssh key for the source if both are remote
    #[clap(short = 'j', long, value_parser)]
    pub source_key: Option<PathBuf>,

    /// ssh key for the dest if both are remote
    #[clap(short = 'k', long, value_parser)]
    pub dest_key: Option<PathBuf>,

    /// Datasets to exclude (glob patterns against full source paths)
    #[clap(short = 'e', long, value_parser, num_args = 1..)]
    pub exclude: Vec<String>,

    /// Raw zfs send
    #[clap(short = 'w', long, value_parser)]
    pub raw: bool,

    /// Resumable send
    #[clap(short = 'r', long, value_parser)]
    pub resume: bool,

    /// Create the destination if it does not exist
    #[clap(long, value_parser)]
    pub dest_auto_create: bool,

    /// Number of retries on connection errors
    #[clap(long, value_parser, default_value_t = 0)]
    pub retries: u32,

    /// Interval in seconds between retries
    #[clap(long, value_parser, default_value_t = 10)]
    pub retry_interval: u64,
}

pub fn run(global_args: &GlobalArgs, args: &CmdArgs) -> Result<()> {
    ui::cli::log!("Sending snapshots...");

    let failures = match (&args.source, &args.dest) {
        (Some(source), Some(dest)) => send_one_shot(source, dest, args)?,
        (Some(_), None) => bail!("missing dest"),
        (None, Some(_)) => bail!("missing source"),
        (None, None) => send_from_config(global_args)?,
    };

    finish(failures)
}

/// `send -s SRC -d DST`: a synthetic single-entry config.
fn send_one_shot(source: &str, dest: &str, args: &CmdArgs) -> Result<u32> {
    let mut source = Location::parse(source)?;
    let mut dest = Location::parse(dest)?;

    // -i serves whichever single end is remote; -j/-k pin the keys when
    // both are.
    let mut source_key = args.source_key.clone();
    let mut dest_key = args.dest_key.clone();
    if let Some(key) = &args.key {
        if dest.is_remote() && dest_key.is_none() {
            dest_key = Some(key.clone());
        } else if source.is_remote() && source_key.is_none() {
            source_key = Some(key.clone());
        }
    }
    source.set_key(source_key);
    dest.set_key(dest_key);

    let compress = match &args.compress {
        Some(name) => name.parse::<Compression>()?,
        None => Compression::default(),
    };

    let dest_spec = DestSpec {
        location: dest,
        compress,
        exclude: args.exclude.clone(),
        raw: args.raw,
        resume: args.resume,
        auto_create: args.dest_auto_create,
        retries: args.retries,
        retry_interval: args.retry_interval,
    };

    Ok(replicate::send_entry(&source, &[dest_spec]))
}

fn send_from_config(global_args: &GlobalArgs) -> Result<u32> {
    let config = load_config(global_args)?;

    let mut failures = 0;
    for entry in config.iter().filter(|e| !e.dests.is_empty()) {
        if global::interrupted() {
            break;
        }
        failures += replicate::send_entry(&entry.location, &entry.dests);
    }
    Ok(failures)
}
