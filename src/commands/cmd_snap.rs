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

use anyhow::Result;
use clap::Args;

use crate::commands::{GlobalArgs, finish, load_config};
use crate::global;
use crate::{clean, take};

#[derive(Args, Debug)]
#[clap(about = "Take and clean snapshots according to the config")]
pub struct CmdArgs {
    /// Take snapshots
    #[clap(long)]
    pub take: bool,

    /// Clean old snapshots
    #[clap(long)]
    pub clean: bool,

    /// Take snapshots, then clean old ones (default)
    #[clap(long)]
    pub full: bool,
}

pub fn run(global_args: &GlobalArgs, args: &CmdArgs) -> Result<()> {
    let config = load_config(global_args)?;

    // Default if no flags are given
    let full = args.full || (!args.take && !args.clean);

    let mut failures = 0;
    if args.take || full {
        failures += take::take_config(&config);
    }
    if (args.clean || full) && !global::interrupted() {
        failures += clean::clean_config(&config);
    }

    finish(failures)
}
