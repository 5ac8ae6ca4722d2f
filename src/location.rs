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

use std::fmt;
use std::path::PathBuf;

use crate::error::Error;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// A fully-qualified reference to a dataset, local or behind ssh.
///
/// The textual form is `ssh:PORT:USER@HOST:DATASET` (empty port means 22);
/// anything without the `ssh:` prefix is a local dataset path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local {
        dataset: String,
    },
    Remote {
        user: String,
        host: String,
        port: u16,
        key: Option<PathBuf>,
        dataset: String,
    },
}

impl Location {
    pub fn parse(value: &str) -> Result<Self, Error> {
        let Some(rest) = value.strip_prefix("ssh:") else {
            if value.is_empty() {
                return Err(Error::Config("empty dataset name".to_string()));
            }
            return Ok(Location::Local {
                dataset: value.to_string(),
            });
        };

        let (port, rest) = rest
            .split_once(':')
            .ok_or_else(|| bad_location(value, "missing port separator"))?;
        let port = if port.is_empty() {
            DEFAULT_SSH_PORT
        } else {
            port.parse::<u16>()
                .map_err(|_| bad_location(value, "invalid port"))?
        };

        let (userhost, dataset) = rest
            .split_once(':')
            .ok_or_else(|| bad_location(value, "missing dataset"))?;
        let (user, host) = userhost
            .split_once('@')
            .ok_or_else(|| bad_location(value, "missing user@host"))?;

        if user.is_empty() || host.is_empty() || dataset.is_empty() {
            return Err(bad_location(value, "empty user, host or dataset"));
        }

        Ok(Location::Remote {
            user: user.to_string(),
            host: host.to_string(),
            port,
            key: None,
            dataset: dataset.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        match self {
            Location::Local { dataset } => dataset,
            Location::Remote { dataset, .. } => dataset,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    /// Same location, different dataset path. Used to address children of a
    /// configured root on the same endpoint.
    pub fn with_dataset(&self, dataset: &str) -> Self {
        let mut other = self.clone();
        match &mut other {
            Location::Local { dataset: d } => *d = dataset.to_string(),
            Location::Remote { dataset: d, .. } => *d = dataset.to_string(),
        }
        other
    }

    pub fn set_key(&mut self, new_key: Option<PathBuf>) {
        if let Location::Remote { key, .. } = self {
            *key = new_key;
        }
    }

    /// Canonical section syntax for this location's `dataset` sibling paths,
    /// with the port always spelled out. Used to match config sections.
    pub fn section_name(&self, dataset: &str) -> String {
        match self {
            Location::Local { .. } => dataset.to_string(),
            Location::Remote {
                user, host, port, ..
            } => format!("ssh:{port}:{user}@{host}:{dataset}"),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local { dataset } => write!(f, "{dataset}"),
            Location::Remote {
                user,
                host,
                dataset,
                ..
            } => write!(f, "{user}@{host}:{dataset}"),
        }
    }
}

fn bad_location(value: &str, reason: &str) -> Error {
    Error::Config(format!("could not parse location '{value}': {reason}"))
}

/// Maps a source dataset path onto the destination tree: strips the source
/// root prefix and grafts the remainder onto the destination root.
///
/// `child` must be `source_root` itself or a descendant of it.
pub fn rebase(child: &str, source_root: &str, dest_root: &str) -> String {
    match child.strip_prefix(source_root) {
        Some("") => dest_root.to_string(),
        Some(rest) if rest.starts_with('/') => format!("{dest_root}{rest}"),
        _ => dest_root.to_string(),
    }
}

/// Whether `path` equals `ancestor` or lies beneath it, respecting dataset
/// path component boundaries.
pub fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}
