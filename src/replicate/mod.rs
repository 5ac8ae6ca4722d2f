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

//! Drives replication of one configured source to its destinations: walks
//! the source dataset tree parents-first, applies exclusion rules, plans
//! each dataset pair and runs the planned streams, with retries for
//! transport failures.

pub mod plan;
pub mod stream;

use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result, ZfsError};
use crate::global;
use crate::location::{Location, rebase};
use crate::process::{Host, pretty_target};
use crate::replicate::plan::{DestState, PlanError, SendAction};
use crate::replicate::stream::{Compression, StreamOpts, run_stream};
use crate::ssh::SshSession;
use crate::ui;
use crate::utils::format_size;
use crate::zfs::{self, SendSpec};

/// One replication destination with its fully resolved per-dest options.
#[derive(Debug, Clone)]
pub struct DestSpec {
    pub location: Location,
    pub compress: Compression,
    pub exclude: Vec<String>,
    pub raw: bool,
    pub resume: bool,
    pub auto_create: bool,
    pub retries: u32,
    pub retry_interval: u64,
}

/// Opens the transport for a location. Local datasets need none.
pub fn connect(location: &Location) -> Result<Host> {
    match location {
        Location::Local { .. } => Ok(Host::Local),
        Location::Remote {
            user,
            host,
            port,
            key,
            ..
        } => Ok(Host::Remote(SshSession::connect(
            user,
            host,
            *port,
            key.as_deref(),
        )?)),
    }
}

/// Replicates one configured source to all of its destinations. Returns the
/// number of failed (source dataset, destination) pairs.
pub fn send_entry(source: &Location, dests: &[DestSpec]) -> u32 {
    let src_host = match connect(source) {
        Ok(host) => host,
        Err(e) => {
            ui::cli::error!("Error while connecting to source {}: {}...", source, e);
            return 1;
        }
    };

    let source_root = source.dataset();
    let datasets = match zfs::list_datasets(&src_host, source_root) {
        Ok(datasets) => datasets,
        Err(Error::Zfs(ZfsError::DatasetNotFound(_))) => {
            ui::cli::error!("Source {} does not exist...", source);
            return 1;
        }
        Err(e) => {
            ui::cli::error!("Error while opening source {}: {}...", source, e);
            return 1;
        }
    };

    let mut failures = 0;
    for dest in dests {
        if global::interrupted() {
            failures += 1;
            break;
        }
        failures += send_to_dest(&src_host, source_root, &datasets, dest);
    }
    failures
}

fn send_to_dest(
    src_host: &Host,
    source_root: &str,
    datasets: &[zfs::Dataset],
    dest: &DestSpec,
) -> u32 {
    let dest_host = match connect(&dest.location) {
        Ok(host) => host,
        Err(e) => {
            ui::cli::error!("Error while connecting to dest {}: {}...", dest.location, e);
            return 1;
        }
    };

    let exclude = match build_exclude_set(&dest.exclude) {
        Ok(set) => set,
        Err(e) => {
            ui::cli::error!("Invalid exclude rules for {}: {}...", dest.location, e);
            return 1;
        }
    };

    if let Err(e) = ensure_dest_root(&dest_host, dest) {
        ui::cli::error!("{}", e);
        return 1;
    }

    let dest_root = dest.location.dataset();
    let mut failures = 0;

    // Parents first: `zfs list -r` output is sorted by name, so a child's
    // destination lineage exists by the time the child is reached.
    for dataset in datasets {
        if global::interrupted() {
            failures += 1;
            break;
        }
        if exclude.is_match(&dataset.name) {
            ui::cli::verbose!("Matched {} in exclude rules, not sending...", dataset.name);
            continue;
        }

        let dest_name = rebase(&dataset.name, source_root, dest_root);
        if sync_with_retries(src_host, &dataset.name, &dest_host, &dest_name, dest).is_err() {
            failures += 1;
        }
    }
    failures
}

/// The whole sync of one dataset pair is retried on transport errors; each
/// attempt re-probes the destination, so a resume token left by a dropped
/// connection is picked up by the next attempt.
fn sync_with_retries(
    src_host: &Host,
    src_dataset: &str,
    dest_host: &Host,
    dest_dataset: &str,
    dest: &DestSpec,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sync_dataset(src_host, src_dataset, dest_host, dest_dataset, dest) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt <= dest.retries && !global::interrupted() => {
                ui::cli::log!(
                    "Retrying send in {}s (retry {} of {})...",
                    dest.retry_interval,
                    attempt,
                    dest.retries
                );
                std::thread::sleep(Duration::from_secs(dest.retry_interval));
            }
            Err(e) => {
                ui::cli::error!(
                    "Error while sending to {}: {}...",
                    pretty_target(dest_host, dest_dataset),
                    e
                );
                return Err(e);
            }
        }
    }
}

fn sync_dataset(
    src_host: &Host,
    src_dataset: &str,
    dest_host: &Host,
    dest_dataset: &str,
    dest: &DestSpec,
) -> Result<()> {
    let dest_log = pretty_target(dest_host, dest_dataset);
    ui::cli::verbose!(
        "Sending {} to {}...",
        pretty_target(src_host, src_dataset),
        dest_log
    );

    if zfs::receive_in_progress(dest_host, dest_dataset) {
        return Err(ZfsError::ReceiveInProgress(dest_log).into());
    }

    let src_names: Vec<String> = zfs::list_snapshots(src_host, src_dataset)?
        .into_iter()
        .map(|s| s.name)
        .collect();

    let opts = StreamOpts {
        raw: dest.raw,
        resume: dest.resume,
        compress: dest.compress,
    };

    // A completed resume changes the destination's snapshots, so the plan
    // is recomputed once afterwards.
    let mut allow_resume = dest.resume;
    for _pass in 0..2 {
        let state = observe_dest(dest_host, dest_dataset)?;
        let actions = match plan::plan(&src_names, &state, allow_resume) {
            Ok(actions) => actions,
            Err(PlanError::NoSnapshots) => {
                return Err(ZfsError::Generic(format!(
                    "no snapshots on {}, cannot send",
                    pretty_target(src_host, src_dataset)
                ))
                .into());
            }
            Err(PlanError::NoCommonBase) => {
                return Err(ZfsError::NoCommonBase(dest_log).into());
            }
        };

        if actions.is_empty() {
            ui::cli::log!("{} is up to date...", dest_log);
            return Ok(());
        }

        let mut resumed = false;
        for action in &actions {
            if global::interrupted() {
                return Err(Error::Cancelled);
            }
            run_action(src_host, src_dataset, dest_host, dest_dataset, action, &opts)?;
            if matches!(action, SendAction::Resume { .. }) {
                resumed = true;
                break;
            }
        }
        if !resumed {
            return Ok(());
        }
        allow_resume = false;
    }
    Ok(())
}

fn run_action(
    src_host: &Host,
    src_dataset: &str,
    dest_host: &Host,
    dest_dataset: &str,
    action: &SendAction,
    opts: &StreamOpts,
) -> Result<()> {
    let dest_log = pretty_target(dest_host, dest_dataset);

    let spec = match action {
        SendAction::Resume { token } => SendSpec {
            raw: opts.raw,
            resume_token: Some(token.clone()),
            ..Default::default()
        },
        SendAction::Full { snapname } => SendSpec {
            snapshot: format!("{src_dataset}@{snapname}"),
            raw: opts.raw,
            ..Default::default()
        },
        SendAction::Incremental { base, target } => SendSpec {
            snapshot: format!("{src_dataset}@{target}"),
            base: Some(format!("{src_dataset}@{base}")),
            intermediates: true,
            raw: opts.raw,
            ..Default::default()
        },
    };

    let size = zfs::stream_size(src_host, &spec);
    match action {
        SendAction::Resume { .. } => ui::cli::log!(
            "Found resume token. Resuming last transfer of {} (~{})...",
            dest_log,
            format_size(size, 1)
        ),
        SendAction::Full { snapname } => ui::cli::log!(
            "No common snapshots on {}, sending oldest snapshot {}@{} (~{})...",
            dest_log,
            src_dataset,
            snapname,
            format_size(size, 1)
        ),
        SendAction::Incremental { target, .. } => ui::cli::log!(
            "Updating {} with recent snapshot {}@{} (~{})...",
            dest_log,
            src_dataset,
            target,
            format_size(size, 1)
        ),
    }

    if global::dry_run() {
        ui::cli::log!("*** DRY RUN ***");
        return Ok(());
    }

    run_stream(src_host, dest_host, dest_dataset, &spec, opts, size)
}

fn observe_dest(dest_host: &Host, dest_dataset: &str) -> Result<DestState> {
    let Some(dataset) = zfs::probe_dataset(dest_host, dest_dataset)? else {
        return Ok(DestState::default());
    };

    let snapnames = zfs::list_snapshots(dest_host, dest_dataset)?
        .into_iter()
        .map(|s| s.name)
        .collect();

    Ok(DestState {
        exists: true,
        snapnames,
        resume_token: dataset.resume_token,
    })
}

/// The configured destination root must exist before anything is received
/// into it; `dest_auto_create` creates the missing lineage. Raw sends seed
/// the dataset through the receive itself.
fn ensure_dest_root(dest_host: &Host, dest: &DestSpec) -> Result<()> {
    let dest_root = dest.location.dataset();
    if zfs::probe_dataset(dest_host, dest_root)?.is_some() {
        return Ok(());
    }

    if !dest.auto_create {
        return Err(Error::Zfs(ZfsError::DatasetNotFound(format!(
            "destination {} does not exist, create it manually or use dest_auto_create",
            dest.location
        ))));
    }

    ui::cli::log!("Destination {} does not exist, will create it...", dest.location);
    if global::dry_run() {
        ui::cli::log!("*** DRY RUN ***");
        return Ok(());
    }
    if !dest.raw {
        zfs::create_dataset(dest_host, dest_root)?;
    }
    Ok(())
}

/// Compiles the per-dest exclude patterns. Globs have fnmatch semantics and
/// are matched against full source dataset paths.
pub fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("invalid exclude pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("could not compile exclude rules: {e}")))
}
