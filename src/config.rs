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

//! The INI policy file: one section per source location, scalar options
//! inherited down the dataset tree (closest ancestor wins, key by key),
//! per-destination options as comma-separated lists of exactly one entry
//! per destination.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::error::Error;
use crate::global::defaults::{DEFAULT_RETRIES, DEFAULT_RETRY_INTERVAL};
use crate::location::{Location, is_same_or_descendant};
use crate::replicate::DestSpec;
use crate::replicate::stream::Compression;
use crate::retention::RetentionPolicy;
use crate::ui;

/// Sample configuration seeded by `pyznap setup`.
pub const SAMPLE_CONFIG: &str = "\
# Example configuration for pyznap.
#
# Every section is a source location, either a local dataset path or
# ssh:PORT:USER@HOST:DATASET (empty port means 22). Options of a section
# apply to the whole subtree unless a more specific section overrides them.

[rpool/data]
frequent = 4
hourly = 24
daily = 7
weekly = 4
monthly = 6
yearly = 1
snap = yes
clean = yes

# Replicate to a local backup pool and to a remote box. Per-destination
# options are comma-separated, one entry per dest.
#dest = tank/backup, ssh::root@backup.example.com:tank/rpool
#dest_key = , /root/.ssh/id_rsa_backup
#compress = none, lzop
#exclude = , rpool/data/tmp rpool/data/*/cache
#retries = 0, 2
#retry_interval = 10, 30
";

/// One fully resolved config section.
#[derive(Debug, Clone)]
pub struct PolicyEntry {
    /// Canonical section name, port spelled out.
    pub name: String,
    pub location: Location,
    pub retention: RetentionPolicy,
    pub snap: bool,
    pub clean: bool,
    pub dry_run: bool,
    pub dests: Vec<DestSpec>,
}

/// Options as written in one section, before inheritance.
#[derive(Debug, Clone, Default)]
struct RawPolicy {
    name: String,
    key: Option<PathBuf>,
    frequent: Option<usize>,
    hourly: Option<usize>,
    daily: Option<usize>,
    weekly: Option<usize>,
    monthly: Option<usize>,
    yearly: Option<usize>,
    snap: Option<bool>,
    clean: Option<bool>,
    dry_run: Option<bool>,
    dest: Option<Vec<String>>,
    dest_key: Option<Vec<Option<PathBuf>>>,
    compress: Option<Vec<Compression>>,
    exclude: Option<Vec<Vec<String>>>,
    raw_send: Option<Vec<bool>>,
    resume: Option<Vec<bool>>,
    dest_auto_create: Option<Vec<bool>>,
    retries: Option<Vec<u32>>,
    retry_interval: Option<Vec<u64>>,
}

pub fn read_config(path: &Path) -> Result<Vec<PolicyEntry>, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("could not read {}: {e}", path.display())))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<Vec<PolicyEntry>, Error> {
    let stripped = strip_inline_comments(text);
    let ini = Ini::load_from_str(&stripped)
        .map_err(|e| Error::Config(format!("malformed config: {e}")))?;

    let mut raw_entries = Vec::new();
    for (section, properties) in ini.iter() {
        let Some(section) = section else { continue };
        let mut raw = parse_section(section, properties)?;
        // Canonicalize the section name so inheritance and the walkers
        // agree on spelling regardless of an omitted port.
        let location = Location::parse(section)?;
        raw.name = location.section_name(location.dataset());
        raw_entries.push((location, raw));
    }

    inherit(&mut raw_entries);

    // Parents before children, so auto-created lineages and recursive
    // snapshots land before the more specific sections run.
    raw_entries.sort_by(|a, b| {
        let ka: Vec<&str> = a.1.name.split('/').collect();
        let kb: Vec<&str> = b.1.name.split('/').collect();
        ka.cmp(&kb)
    });

    raw_entries
        .into_iter()
        .map(|(location, raw)| resolve(location, raw))
        .collect()
}

fn parse_section(section: &str, properties: &ini::Properties) -> Result<RawPolicy, Error> {
    let mut raw = RawPolicy {
        name: section.to_string(),
        ..Default::default()
    };

    for (option, value) in properties.iter() {
        let value = value.trim();
        match option {
            "key" => raw.key = parse_key_path(section, value),
            "frequent" => raw.frequent = Some(parse_count(section, option, value)?),
            "hourly" => raw.hourly = Some(parse_count(section, option, value)?),
            "daily" => raw.daily = Some(parse_count(section, option, value)?),
            "weekly" => raw.weekly = Some(parse_count(section, option, value)?),
            "monthly" => raw.monthly = Some(parse_count(section, option, value)?),
            "yearly" => raw.yearly = Some(parse_count(section, option, value)?),
            "snap" => raw.snap = parse_bool(value),
            "clean" => raw.clean = parse_bool(value),
            "dry_run" => raw.dry_run = parse_bool(value),
            "dest" => raw.dest = Some(split_list(value)),
            "dest_key" => {
                raw.dest_key = Some(
                    split_list(value)
                        .iter()
                        .map(|entry| parse_key_path(section, entry))
                        .collect(),
                )
            }
            "compress" => {
                raw.compress = Some(
                    split_list(value)
                        .iter()
                        .map(|entry| entry.parse::<Compression>())
                        .collect::<Result<_, _>>()?,
                )
            }
            "exclude" => {
                raw.exclude = Some(
                    value
                        .split(',')
                        .map(|entry| {
                            entry
                                .split_whitespace()
                                .map(|s| s.to_string())
                                .collect::<Vec<_>>()
                        })
                        .collect(),
                )
            }
            "raw_send" => raw.raw_send = Some(parse_bool_list(value)),
            "resume" => raw.resume = Some(parse_bool_list(value)),
            "dest_auto_create" => raw.dest_auto_create = Some(parse_bool_list(value)),
            "retries" => {
                raw.retries = Some(parse_int_list::<u32>(section, option, value)?);
            }
            "retry_interval" => {
                raw.retry_interval = Some(parse_int_list::<u64>(section, option, value)?);
            }
            _ => {
                ui::cli::verbose!("Ignoring unknown option '{}' in [{}]", option, section);
            }
        }
    }
    Ok(raw)
}

/// Scalar options flow down the dataset tree: an unset option takes the
/// value of the closest ancestor section on the same endpoint.
fn inherit(entries: &mut [(Location, RawPolicy)]) {
    let snapshot: Vec<(Location, RawPolicy)> = entries.to_vec();

    for (location, raw) in entries.iter_mut() {
        let mut ancestors: Vec<&(Location, RawPolicy)> = snapshot
            .iter()
            .filter(|(other, other_raw)| {
                other_raw.name != raw.name
                    && same_endpoint(location, other)
                    && is_same_or_descendant(location.dataset(), other.dataset())
            })
            .collect();
        // Closest ancestor first.
        ancestors.sort_by_key(|(other, _)| std::cmp::Reverse(other.dataset().len()));

        for (_, ancestor) in ancestors {
            raw.key = raw.key.take().or_else(|| ancestor.key.clone());
            raw.frequent = raw.frequent.or(ancestor.frequent);
            raw.hourly = raw.hourly.or(ancestor.hourly);
            raw.daily = raw.daily.or(ancestor.daily);
            raw.weekly = raw.weekly.or(ancestor.weekly);
            raw.monthly = raw.monthly.or(ancestor.monthly);
            raw.yearly = raw.yearly.or(ancestor.yearly);
            raw.snap = raw.snap.or(ancestor.snap);
            raw.clean = raw.clean.or(ancestor.clean);
        }
    }
}

fn same_endpoint(a: &Location, b: &Location) -> bool {
    match (a, b) {
        (Location::Local { .. }, Location::Local { .. }) => true,
        (
            Location::Remote {
                user: ua,
                host: ha,
                port: pa,
                ..
            },
            Location::Remote {
                user: ub,
                host: hb,
                port: pb,
                ..
            },
        ) => ua == ub && ha == hb && pa == pb,
        _ => false,
    }
}

/// Turns a raw section into a `PolicyEntry`, enforcing the per-dest list
/// invariant: every list is absent or has exactly one entry per dest.
fn resolve(mut location: Location, raw: RawPolicy) -> Result<PolicyEntry, Error> {
    location.set_key(raw.key.clone());

    let dest_names = raw.dest.clone().unwrap_or_default();
    let n = dest_names.len();

    let dest_keys = per_dest(&raw.name, "dest_key", raw.dest_key, n, None)?;
    let compress = per_dest(&raw.name, "compress", raw.compress, n, Compression::default())?;
    let excludes = per_dest(&raw.name, "exclude", raw.exclude, n, Vec::new())?;
    let raw_send = per_dest(&raw.name, "raw_send", raw.raw_send, n, false)?;
    let resume = per_dest(&raw.name, "resume", raw.resume, n, false)?;
    let auto_create = per_dest(
        &raw.name,
        "dest_auto_create",
        raw.dest_auto_create,
        n,
        false,
    )?;
    let retries = per_dest(&raw.name, "retries", raw.retries, n, DEFAULT_RETRIES)?;
    let retry_interval = per_dest(
        &raw.name,
        "retry_interval",
        raw.retry_interval,
        n,
        DEFAULT_RETRY_INTERVAL,
    )?;

    let mut dests = Vec::with_capacity(n);
    for (i, dest_name) in dest_names.iter().enumerate() {
        let mut dest_location = Location::parse(dest_name)?;
        dest_location.set_key(dest_keys[i].clone());
        dests.push(DestSpec {
            location: dest_location,
            compress: compress[i],
            exclude: excludes[i].clone(),
            raw: raw_send[i],
            resume: resume[i],
            auto_create: auto_create[i],
            retries: retries[i],
            retry_interval: retry_interval[i],
        });
    }

    Ok(PolicyEntry {
        name: raw.name,
        location,
        retention: RetentionPolicy {
            frequent: raw.frequent.unwrap_or(0),
            hourly: raw.hourly.unwrap_or(0),
            daily: raw.daily.unwrap_or(0),
            weekly: raw.weekly.unwrap_or(0),
            monthly: raw.monthly.unwrap_or(0),
            yearly: raw.yearly.unwrap_or(0),
        },
        snap: raw.snap.unwrap_or(false),
        clean: raw.clean.unwrap_or(false),
        dry_run: raw.dry_run.unwrap_or(false),
        dests,
    })
}

fn per_dest<T: Clone>(
    section: &str,
    option: &str,
    values: Option<Vec<T>>,
    n: usize,
    default: T,
) -> Result<Vec<T>, Error> {
    match values {
        None => Ok(vec![default; n]),
        Some(values) if values.len() == n => Ok(values),
        Some(values) => Err(Error::Config(format!(
            "[{section}] {option} has {} entries for {n} dest(s)",
            values.len()
        ))),
    }
}

// --- Section lookups for the walkers ---

/// All canonical section names of a parsed config.
pub fn section_names(config: &[PolicyEntry]) -> HashSet<String> {
    config.iter().map(|entry| entry.name.clone()).collect()
}

/// Whether `child_dataset` (below `entry`'s root) is claimed by a more
/// specific section: itself or one of its ancestors strictly below the
/// root has a section of its own.
pub fn covered_by_other_section(
    sections: &HashSet<String>,
    entry: &PolicyEntry,
    child_dataset: &str,
) -> bool {
    let root = entry.location.dataset();
    let mut path = child_dataset;
    loop {
        if path == root {
            return false;
        }
        if sections.contains(&entry.location.section_name(path)) {
            return true;
        }
        match path.rsplit_once('/') {
            Some((parent, _)) => path = parent,
            None => return false,
        }
    }
}

// --- Low-level parsing ---

fn strip_inline_comments(text: &str) -> String {
    text.lines()
        .map(|line| match line.find('#') {
            Some(i) => &line[..i],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

fn parse_bool_list(value: &str) -> Vec<bool> {
    split_list(value)
        .iter()
        .map(|entry| parse_bool(entry).unwrap_or(false))
        .collect()
}

fn parse_count(section: &str, option: &str, value: &str) -> Result<usize, Error> {
    value.parse::<usize>().map_err(|_| {
        Error::Config(format!(
            "[{section}] {option} must be a non-negative integer, got '{value}'"
        ))
    })
}

fn parse_int_list<T: std::str::FromStr>(
    section: &str,
    option: &str,
    value: &str,
) -> Result<Vec<T>, Error> {
    split_list(value)
        .iter()
        .map(|entry| {
            entry.parse::<T>().map_err(|_| {
                Error::Config(format!(
                    "[{section}] {option} must be a list of integers, got '{entry}'"
                ))
            })
        })
        .collect()
}

fn parse_key_path(section: &str, value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        return None;
    }
    let path = PathBuf::from(value);
    if path.is_file() {
        Some(path)
    } else {
        ui::cli::warn!("[{}] ssh key {} does not exist, ignoring...", section, value);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_section() {
        let config = parse_config(
            "[rpool/data]\nfrequent = 4\nhourly = 24\nsnap = yes\nclean = no\n",
        )
        .unwrap();
        assert_eq!(config.len(), 1);
        let entry = &config[0];
        assert_eq!(entry.name, "rpool/data");
        assert_eq!(entry.retention.frequent, 4);
        assert_eq!(entry.retention.hourly, 24);
        assert_eq!(entry.retention.daily, 0);
        assert!(entry.snap);
        assert!(!entry.clean);
        assert!(entry.dests.is_empty());
    }

    #[test]
    fn test_inline_comments_stripped() {
        let config =
            parse_config("[rpool]\nhourly = 12  # keep half a day\nsnap = yes\n").unwrap();
        assert_eq!(config[0].retention.hourly, 12);
    }

    #[test]
    fn test_dest_lists() {
        let text = "\
[rpool/data]
hourly = 24
dest = tank/backup, ssh::root@host:tank/backup
compress = none, lzop
raw_send = no, yes
resume = yes, no
dest_auto_create = yes, yes
retries = 1, 3
retry_interval = 5, 30
exclude = rpool/data/tmp, rpool/data/scratch rpool/data/*/cache
";
        let config = parse_config(text).unwrap();
        let dests = &config[0].dests;
        assert_eq!(dests.len(), 2);

        assert!(!dests[0].location.is_remote());
        assert_eq!(dests[0].compress, Compression::None);
        assert!(!dests[0].raw);
        assert!(dests[0].resume);
        assert_eq!(dests[0].retries, 1);
        assert_eq!(dests[0].exclude, vec!["rpool/data/tmp".to_string()]);

        assert!(dests[1].location.is_remote());
        assert_eq!(dests[1].compress, Compression::Lzop);
        assert!(dests[1].raw);
        assert_eq!(dests[1].retry_interval, 30);
        assert_eq!(
            dests[1].exclude,
            vec![
                "rpool/data/scratch".to_string(),
                "rpool/data/*/cache".to_string()
            ]
        );
    }

    #[test]
    fn test_dest_list_length_mismatch() {
        let text = "[rpool]\ndest = a, b\ncompress = lzop\n";
        let err = parse_config(text).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("compress"));
    }

    #[test]
    fn test_per_dest_defaults() {
        let config = parse_config("[rpool]\ndest = tank/a, tank/b\n").unwrap();
        let dests = &config[0].dests;
        assert_eq!(dests[0].compress, Compression::Lzop);
        assert!(!dests[0].resume);
        assert!(!dests[1].auto_create);
        assert_eq!(dests[1].retries, DEFAULT_RETRIES);
        assert_eq!(dests[1].retry_interval, DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    fn test_inheritance_closest_ancestor_wins() {
        let text = "\
[rpool]
frequent = 4
hourly = 24
snap = yes
clean = yes

[rpool/data]
hourly = 48

[rpool/data/scratch]
snap = no
";
        let config = parse_config(text).unwrap();
        let by_name = |name: &str| {
            config
                .iter()
                .find(|e| e.name == name)
                .unwrap_or_else(|| panic!("missing section {name}"))
        };

        let data = by_name("rpool/data");
        assert_eq!(data.retention.hourly, 48);
        assert_eq!(data.retention.frequent, 4);
        assert!(data.snap);

        let scratch = by_name("rpool/data/scratch");
        assert!(!scratch.snap);
        assert!(scratch.clean);
        // hourly comes from rpool/data, not rpool.
        assert_eq!(scratch.retention.hourly, 48);
    }

    #[test]
    fn test_inheritance_respects_component_boundaries() {
        let text = "[rpool/data]\nhourly = 24\n\n[rpool/database]\nsnap = yes\n";
        let config = parse_config(text).unwrap();
        let database = config.iter().find(|e| e.name == "rpool/database").unwrap();
        // rpool/data is not an ancestor of rpool/database.
        assert_eq!(database.retention.hourly, 0);
    }

    #[test]
    fn test_remote_sections_do_not_inherit_from_local() {
        let text = "[rpool]\nhourly = 24\n\n[ssh::root@host:rpool/data]\nsnap = yes\n";
        let config = parse_config(text).unwrap();
        let remote = config.iter().find(|e| e.location.is_remote()).unwrap();
        assert_eq!(remote.retention.hourly, 0);
        assert_eq!(remote.name, "ssh:22:root@host:rpool/data");
    }

    #[test]
    fn test_sorted_parents_first() {
        let text = "[rpool/data/scratch]\nsnap = no\n\n[rpool]\nsnap = yes\n\n[rpool/data]\nsnap = yes\n";
        let config = parse_config(text).unwrap();
        let names: Vec<&str> = config.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["rpool", "rpool/data", "rpool/data/scratch"]);
    }

    #[test]
    fn test_invalid_count_is_config_error() {
        assert!(parse_config("[rpool]\nhourly = many\n").is_err());
    }

    #[test]
    fn test_invalid_compression_is_config_error() {
        assert!(parse_config("[rpool]\ndest = tank/a\ncompress = zstd\n").is_err());
    }

    #[test]
    fn test_covered_by_other_section() {
        let config = parse_config("[rpool]\nsnap = yes\n\n[rpool/data]\nsnap = no\n").unwrap();
        let sections = section_names(&config);
        let rpool = config.iter().find(|e| e.name == "rpool").unwrap();

        assert!(covered_by_other_section(&sections, rpool, "rpool/data"));
        assert!(covered_by_other_section(&sections, rpool, "rpool/data/inner"));
        assert!(!covered_by_other_section(&sections, rpool, "rpool/home"));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = parse_config(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.len(), 1);
        assert_eq!(config[0].retention.hourly, 24);
        assert!(config[0].snap);
    }
}
