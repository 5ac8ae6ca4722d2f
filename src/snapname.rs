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

use chrono::{Datelike, NaiveDateTime, Timelike};

/// Timestamps are local civil time of the host that created the snapshot.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Time buckets of the retention policy, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    Frequent,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Granularity::Frequent,
        Granularity::Hourly,
        Granularity::Daily,
        Granularity::Weekly,
        Granularity::Monthly,
        Granularity::Yearly,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Granularity::Frequent => "frequent",
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
            Granularity::Yearly => "yearly",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "frequent" => Some(Granularity::Frequent),
            "hourly" => Some(Granularity::Hourly),
            "daily" => Some(Granularity::Daily),
            "weekly" => Some(Granularity::Weekly),
            "monthly" => Some(Granularity::Monthly),
            "yearly" => Some(Granularity::Yearly),
            _ => None,
        }
    }

    /// Whether `a` and `b` fall into the same civil-calendar window of this
    /// granularity. Weeks are ISO weeks, paired with their ISO week-year.
    pub fn same_window(self, a: NaiveDateTime, b: NaiveDateTime) -> bool {
        match self {
            Granularity::Frequent => {
                a.date() == b.date() && a.hour() == b.hour() && a.minute() == b.minute()
            }
            Granularity::Hourly => a.date() == b.date() && a.hour() == b.hour(),
            Granularity::Daily => a.date() == b.date(),
            Granularity::Weekly => a.iso_week() == b.iso_week(),
            Granularity::Monthly => a.year() == b.year() && a.month() == b.month(),
            Granularity::Yearly => a.year() == b.year(),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// A snapshot name of the form `<prefix>_YYYY-MM-DD_HH:MM:SS_<granularity>`
/// (the part after the `@`). Names that do not match this schema exactly are
/// foreign and never touched by the retention engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapName {
    pub prefix: String,
    pub timestamp: NaiveDateTime,
    pub granularity: Granularity,
}

impl SnapName {
    pub fn new(prefix: &str, timestamp: NaiveDateTime, granularity: Granularity) -> Self {
        Self {
            prefix: prefix.to_string(),
            timestamp,
            granularity,
        }
    }

    /// Strict parse. Returns `None` on any deviation from the schema,
    /// including non-canonical timestamps (e.g. unpadded fields).
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
        let (body, suffix) = rest.rsplit_once('_')?;
        let granularity = Granularity::from_suffix(suffix)?;
        let timestamp = NaiveDateTime::parse_from_str(body, TIMESTAMP_FORMAT).ok()?;
        // chrono accepts some non-canonical spellings; reject anything that
        // does not round-trip.
        if timestamp.format(TIMESTAMP_FORMAT).to_string() != body {
            return None;
        }
        Some(Self::new(prefix, timestamp, granularity))
    }

    /// Parse against several accepted prefixes, first match wins.
    pub fn parse_any(name: &str, prefixes: &[&str]) -> Option<Self> {
        prefixes.iter().find_map(|p| Self::parse(name, p))
    }
}

impl fmt::Display for SnapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.prefix,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.granularity.suffix()
        )
    }
}

/// Splits a full snapshot path `dataset@snapname` into its two halves.
pub fn split_snapshot(full: &str) -> Option<(&str, &str)> {
    full.split_once('@')
}
