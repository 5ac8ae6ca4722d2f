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

//! The snapshot phase: walks the configured dataset trees and creates the
//! snapshots the retention engine asks for. Failures are logged per dataset
//! and never abort the sweep.

use chrono::Local;

use crate::config::{self, PolicyEntry};
use crate::error::{Error, ZfsError};
use crate::global;
use crate::global::defaults::SNAPSHOT_PREFIX;
use crate::process::{Host, pretty_target};
use crate::replicate::connect;
use crate::retention;
use crate::snapname::SnapName;
use crate::ui;
use crate::zfs;

/// Takes snapshots for every section with `snap = yes`. Returns the number
/// of failed datasets.
pub fn take_config(config: &[PolicyEntry]) -> u32 {
    ui::cli::log!("Taking snapshots...");

    let sections = config::section_names(config);
    let mut failures = 0;

    for entry in config.iter().filter(|e| e.snap) {
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
            // A more specific section drives its own subtree.
            if i > 0 && config::covered_by_other_section(&sections, entry, &dataset.name) {
                continue;
            }
            failures += take_dataset(&host, &dataset.name, entry, i == 0);
        }
    }
    failures
}

/// Decides and creates the due snapshots of a single dataset. The root of a
/// configured tree snapshots recursively, seeding all children in one
/// atomic operation; children are visited afterwards to fill gaps.
fn take_dataset(host: &Host, dataset: &str, entry: &PolicyEntry, recursive: bool) -> u32 {
    ui::cli::verbose!("Taking snapshots on {}...", pretty_target(host, dataset));

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

    let mut failures = 0;
    for granularity in plan.take {
        if global::interrupted() {
            break;
        }
        let snapname = SnapName::new(SNAPSHOT_PREFIX, now, granularity).to_string();
        failures += take_snap(host, dataset, &snapname, recursive, entry.dry_run);
    }
    failures
}

fn take_snap(host: &Host, dataset: &str, snapname: &str, recursive: bool, dry_run: bool) -> u32 {
    let dry_run = dry_run || global::dry_run();
    let dry_msg = if dry_run { " *** DRY RUN ***" } else { "" };
    ui::cli::log!(
        "Taking snapshot {}@{}...{}",
        pretty_target(host, dataset),
        snapname,
        dry_msg
    );
    if dry_run {
        return 0;
    }

    match zfs::create_snapshot(host, dataset, snapname, recursive) {
        Ok(()) => 0,
        Err(Error::Zfs(ZfsError::DatasetExists(_))) => {
            // A recursive snapshot of an ancestor already created it.
            ui::cli::verbose!("Snapshot {}@{} already exists...", dataset, snapname);
            0
        }
        Err(e) => {
            ui::cli::error!(
                "Error while taking snapshot {}@{}: {}...",
                pretty_target(host, dataset),
                snapname,
                e
            );
            1
        }
    }
}
