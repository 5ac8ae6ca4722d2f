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

//! The cleanup phase: destroys the snapshots the retention engine marked.
//! Snapshots pinned by holds or an ongoing receive are skipped with a
//! warning, never failed on.

use chrono::Local;

use crate::config::{self, PolicyEntry};
use crate::error::{Error, ZfsError};
use crate::global;
use crate::global::defaults::SNAPSHOT_PREFIX;
use crate::process::{Host, pretty_target};
use crate::replicate::connect;
use crate::retention;
use crate::ui;
use crate::zfs;

/// Destroys expired snapshots for every section with `clean = yes`.
/// Returns the number of failed datasets.
pub fn clean_config(config: &[PolicyEntry]) -> u32 {
    ui::cli::log!("Cleaning snapshots...");

    let sections = config::section_names(config);
    let mut failures = 0;

    for entry in config.iter().filter(|e| e.clean) {
        if global::interrupted() {
            break;
        }

        let host = match connect(&entry.location) {
            Ok(host) => host,
            Err(e) => {
                ui::cli::error!("Error while connecting to {}: {}...", entry.location, e);
                failures += 1;
                continue;
            }
        };

        let datasets = match zfs::list_datasets(&host, entry.location.dataset()) {
            Ok(datasets) => datasets,
            Err(Error::Zfs(ZfsError::DatasetNotFound(_))) => {
                ui::cli::error!("Dataset {} does not exist...", entry.location);
                failures += 1;
                continue;
            }
            Err(e) => {
                ui::cli::error!("Error while opening {}: {}...", entry.location, e);
                failures += 1;
                continue;
            }
        };

        for (i, dataset) in datasets.iter().enumerate() {
            if global::interrupted() {
                break;
            }
            if i > 0 && config::covered_by_other_section(&sections, entry, &dataset.name) {
                continue;
            }
            failures += clean_dataset(&host, &dataset.name, entry);
        }
    }
    failures
}

fn clean_dataset(host: &Host, dataset: &str, entry: &PolicyEntry) -> u32 {
    ui::cli::verbose!("Cleaning snapshots on {}...", pretty_target(host, dataset));

    let snapnames: Vec<String> = match zfs::list_snapshots(host, dataset) {
        Ok(snapshots) => snapshots.into_iter().map(|s| s.name).collect(),
        Err(e) => {
            ui::cli::error!(
                "Error while opening {}: {}...",
                pretty_target(host, dataset),
                e
            );
            return 1;
        }
    };

    let now = Local::now().naive_local();
    let plan = retention::plan(&snapnames, SNAPSHOT_PREFIX, &entry.retention, now);
    if plan.destroy.is_empty() {
        return 0;
    }

    // An interrupted receive references snapshots by stream state; destroying
    // them now would abort it.
    if zfs::receive_in_progress(host, dataset) {
        ui::cli::warn!(
            "Receive in progress on {}, not cleaning...",
            pretty_target(host, dataset)
        );
        return 0;
    }

    let mut failures = 0;
    for snapname in &plan.destroy {
        if global::interrupted() {
            break;
        }
        failures += clean_snap(host, dataset, snapname, entry.dry_run);
    }
    failures
}

fn clean_snap(host: &Host, dataset: &str, snapname: &str, dry_run: bool) -> u32 {
    let full = format!("{dataset}@{snapname}");
    let dry_run = dry_run || global::dry_run();
    let dry_msg = if dry_run { " *** DRY RUN ***" } else { "" };

    match zfs::holds(host, &full) {
        Ok(tags) if !tags.is_empty() => {
            ui::cli::warn!(
                "Snapshot {} is held ({}), not destroying...",
                pretty_target(host, &full),
                tags.join(", ")
            );
            return 0;
        }
        Ok(_) => {}
        Err(e) => {
            ui::cli::error!(
                "Error while checking holds on {}: {}...",
                pretty_target(host, &full),
                e
            );
            return 1;
        }
    }

    ui::cli::log!("Deleting snapshot {}...{}", pretty_target(host, &full), dry_msg);
    if dry_run {
        return 0;
    }

    match zfs::destroy_snapshot(host, &full) {
        Ok(()) => 0,
        Err(Error::Zfs(ZfsError::Busy(_))) => {
            ui::cli::warn!(
                "Snapshot {} is busy, not destroying...",
                pretty_target(host, &full)
            );
            0
        }
        Err(e) => {
            ui::cli::error!(
                "Error while deleting snapshot {}: {}...",
                pretty_target(host, &full),
                e
            );
            1
        }
    }
}
