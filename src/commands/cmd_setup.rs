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

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::commands::GlobalArgs;
use crate::config::SAMPLE_CONFIG;
use crate::global::defaults::{CONFIG_DIR, CONFIG_FILE};
use crate::ui;

#[derive(Args, Debug)]
#[clap(about = "Create the config directory and a sample config")]
pub struct CmdArgs {
    /// Config directory
    #[clap(short, long, value_parser)]
    pub path: Option<PathBuf>,
}

pub fn run(_global_args: &GlobalArgs, args: &CmdArgs) -> Result<()> {
    let dir = args.path.clone().unwrap_or_else(|| PathBuf::from(CONFIG_DIR));

    ui::cli::log!("Initial setup...");

    if dir.is_dir() {
        ui::cli::log!("Directory {} does already exist...", dir.display());
    } else {
        ui::cli::log!("Creating directory {}...", dir.display());
        fs::create_dir_all(&dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("could not set permissions on {}", dir.display()))?;
    }

    let config_file = dir.join(CONFIG_FILE);
    if config_file.is_file() {
        ui::cli::log!("File {} does already exist...", config_file.display());
    } else {
        ui::cli::log!("Creating sample config {}...", config_file.display());
        fs::write(&config_file, SAMPLE_CONFIG)
            .with_context(|| format!("could not write {}", config_file.display()))?;
        fs::set_permissions(&config_file, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("could not set permissions on {}", config_file.display()))?;
    }

    Ok(())
}
