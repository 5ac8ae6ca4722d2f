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

//! The retention engine. A pure computation from (snapshot names, policy,
//! clock) to the snapshots to create and destroy; applying the result is the
//! walkers' business.

use chrono::NaiveDateTime;

use crate::global::defaults::COMPAT_PREFIX;
use crate::snapname::{Granularity, SnapName};

/// Retention counts per time bucket. A zero count disables the bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub frequent: usize,
    pub hourly: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub yearly: usize,
}

impl RetentionPolicy {
    pub fn count(&self, granularity: Granularity) -> usize {
        match granularity {
            Granularity::Frequent => self.frequent,
            Granularity::Hourly => self.hourly,
            Granularity::Daily => self.daily,
            Granularity::Weekly => self.weekly,
            Granularity::Monthly => self.monthly,
            Granularity::Yearly => self.yearly,
        }
    }

    pub fn is_empty(&self) -> bool {
        Granularity::ALL.iter().all(|&g| self.count(g) == 0)
    }
}

/// What a sweep should do to one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Granularities to snapshot now, finest first.
    pub take: Vec<Granularity>,
    /// Schema snapshots to keep, oldest first.
    pub keep: Vec<String>,
    /// Schema snapshots to destroy, oldest first. Never contains foreign
    /// names.
    pub destroy: Vec<String>,
}

/// Computes the full sweep decision. Pure: two calls with equal inputs
/// return equal plans, regardless of the snapshot enumeration order.
pub fn plan(
    snapnames: &[String],
    prefix: &str,
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> RetentionPlan {
    let prefixes = [prefix, COMPAT_PREFIX];

    // Snapshots that match the naming schema; everything else is foreign and
    // left alone.
    let mut parsed: Vec<(String, SnapName)> = snapnames
        .iter()
        .filter_map(|name| SnapName::parse_any(name, &prefixes).map(|p| (name.clone(), p)))
        .collect();
    parsed.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then(a.0.cmp(&b.0)));

    let take = plan_take(&parsed, policy, now);
    let (keep, destroy) = plan_retain(&parsed, policy);

    RetentionPlan {
        take,
        keep,
        destroy,
    }
}

/// A granularity fires when no schema snapshot of that granularity falls
/// into its current window.
fn plan_take(
    parsed: &[(String, SnapName)],
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> Vec<Granularity> {
    Granularity::ALL
        .into_iter()
        .filter(|&g| policy.count(g) > 0)
        .filter(|&g| {
            let newest_of_kind = parsed
                .iter()
                .rev()
                .find(|(_, p)| p.granularity == g)
                .map(|(_, p)| p.timestamp);
            match newest_of_kind {
                Some(ts) => !g.same_window(ts, now),
                None => true,
            }
        })
        .collect()
}

/// For each enabled granularity, walk newest to oldest and keep the
/// representative of each of the first N distinct windows. A snapshot
/// survives when any bucket keeps it.
fn plan_retain(
    parsed: &[(String, SnapName)],
    policy: &RetentionPolicy,
) -> (Vec<String>, Vec<String>) {
    let mut kept = vec![false; parsed.len()];

    for g in Granularity::ALL {
        let count = policy.count(g);
        if count == 0 {
            continue;
        }

        // Walk order decides the representative: newest timestamp first,
        // and among equal timestamps the matching suffix, then the coarser
        // granularity, wins.
        let mut order: Vec<usize> = (0..parsed.len()).collect();
        order.sort_by(|&a, &b| {
            let (sa, sb) = (&parsed[a].1, &parsed[b].1);
            sb.timestamp
                .cmp(&sa.timestamp)
                .then_with(|| (sb.granularity == g).cmp(&(sa.granularity == g)))
                .then_with(|| sb.granularity.cmp(&sa.granularity))
                .then_with(|| parsed[a].0.cmp(&parsed[b].0))
        });

        let mut windows = 0usize;
        let mut last_window: Option<NaiveDateTime> = None;
        for idx in order {
            let ts = parsed[idx].1.timestamp;
            let new_window = match last_window {
                Some(seen) => !g.same_window(seen, ts),
                None => true,
            };
            if new_window {
                if windows == count {
                    break;
                }
                windows += 1;
                last_window = Some(ts);
                kept[idx] = true;
            }
        }
    }

    let mut keep = Vec::new();
    let mut destroy = Vec::new();
    for (idx, (name, _)) in parsed.iter().enumerate() {
        if kept[idx] {
            keep.push(name.clone());
        } else {
            destroy.push(name.clone());
        }
    }
    (keep, destroy)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn name(timestamp: NaiveDateTime, g: Granularity) -> String {
        SnapName::new("pyznap", timestamp, g).to_string()
    }

    fn full_policy() -> RetentionPolicy {
        RetentionPolicy {
            frequent: 4,
            hourly: 24,
            daily: 7,
            weekly: 4,
            monthly: 6,
            yearly: 1,
        }
    }

    #[test]
    fn test_fresh_dataset_takes_all_granularities() {
        let plan = plan(&[], "pyznap", &full_policy(), ts(2024, 3, 14, 12, 0, 0));
        assert_eq!(plan.take, Granularity::ALL.to_vec());
        assert!(plan.destroy.is_empty());
        assert!(plan.keep.is_empty());
    }

    #[test]
    fn test_take_respects_disabled_buckets() {
        let policy = RetentionPolicy {
            frequent: 0,
            hourly: 2,
            daily: 0,
            weekly: 0,
            monthly: 0,
            yearly: 1,
        };
        let plan = plan(&[], "pyznap", &policy, ts(2024, 3, 14, 12, 0, 0));
        assert_eq!(plan.take, vec![Granularity::Hourly, Granularity::Yearly]);
    }

    #[test]
    fn test_take_skips_covered_windows() {
        let now = ts(2024, 3, 14, 12, 30, 0);
        let snaps = vec![
            name(ts(2024, 3, 14, 12, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 14, 12, 30, 0), Granularity::Frequent),
            name(ts(2024, 1, 1, 0, 0, 0), Granularity::Yearly),
        ];
        let plan = plan(&snaps, "pyznap", &full_policy(), now);
        // Hourly and yearly are covered; frequent is covered by the snapshot
        // in this exact minute. Daily, weekly, monthly have no snapshot of
        // their own kind and fire.
        assert_eq!(
            plan.take,
            vec![Granularity::Daily, Granularity::Weekly, Granularity::Monthly]
        );
    }

    #[test]
    fn test_thinning_keeps_window_representatives() {
        // Ten frequent snapshots every 15 minutes, 12:00 through 14:15.
        let mut snaps = Vec::new();
        for quarter in 0..10 {
            let minutes = 15 * quarter;
            snaps.push(name(
                ts(2024, 3, 14, 12 + minutes / 60, minutes % 60, 0),
                Granularity::Frequent,
            ));
        }
        let policy = full_policy();
        let plan = plan(&snaps, "pyznap", &policy, ts(2024, 3, 14, 14, 16, 0));

        // Frequent keeps the newest four; hourly keeps the newest snapshot
        // of each of the hours 14, 13 and 12.
        let expected_keep: Vec<String> = vec![
            name(ts(2024, 3, 14, 12, 45, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 13, 30, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 13, 45, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 14, 0, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 14, 15, 0), Granularity::Frequent),
        ];
        let expected_destroy: Vec<String> = vec![
            name(ts(2024, 3, 14, 12, 0, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 12, 15, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 12, 30, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 13, 0, 0), Granularity::Frequent),
            name(ts(2024, 3, 14, 13, 15, 0), Granularity::Frequent),
        ];
        assert_eq!(plan.keep, expected_keep);
        assert_eq!(plan.destroy, expected_destroy);
    }

    #[test]
    fn test_foreign_snapshots_untouched() {
        let snaps = vec![
            "manual-backup".to_string(),
            "zrepl_2023-01-01_00:00:00_daily".to_string(),
            name(ts(2023, 1, 1, 0, 0, 0), Granularity::Daily),
            name(ts(2023, 6, 1, 0, 0, 0), Granularity::Daily),
        ];
        let policy = RetentionPolicy {
            daily: 1,
            ..Default::default()
        };
        let plan = plan(&snaps, "pyznap", &policy, ts(2023, 6, 2, 0, 0, 0));
        // Only the older schema snapshot is destroyed.
        assert_eq!(
            plan.destroy,
            vec![name(ts(2023, 1, 1, 0, 0, 0), Granularity::Daily)]
        );
    }

    #[test]
    fn test_sanoid_snapshots_are_thinned() {
        let snaps = vec![
            "autosnap_2023-01-01_00:00:00_daily".to_string(),
            "autosnap_2023-01-02_00:00:00_daily".to_string(),
        ];
        let policy = RetentionPolicy {
            daily: 1,
            ..Default::default()
        };
        let plan = plan(&snaps, "pyznap", &policy, ts(2023, 1, 2, 12, 0, 0));
        assert_eq!(plan.destroy, vec!["autosnap_2023-01-01_00:00:00_daily"]);
        assert_eq!(plan.keep, vec!["autosnap_2023-01-02_00:00:00_daily"]);
    }

    #[test]
    fn test_simultaneous_multi_granularity_snapshots_survive() {
        // The state right after a fresh sweep at midnight on Jan 1: six
        // snapshots sharing one timestamp. A clean must keep all of them.
        let t = ts(2024, 1, 1, 0, 0, 0);
        let snaps: Vec<String> = Granularity::ALL.iter().map(|&g| name(t, g)).collect();
        let plan = plan(&snaps, "pyznap", &full_policy(), ts(2024, 1, 1, 0, 0, 30));
        assert!(plan.destroy.is_empty());
        assert_eq!(plan.keep.len(), 6);
        assert!(plan.take.is_empty());
    }

    #[test]
    fn test_full_sweep_is_idempotent() {
        let now = ts(2024, 3, 14, 12, 0, 0);
        let policy = full_policy();

        // First sweep on an empty dataset takes six snapshots.
        let first = plan(&[], "pyznap", &policy, now);
        let snaps: Vec<String> = first.take.iter().map(|&g| name(now, g)).collect();

        // Second sweep in the same minute takes and destroys nothing.
        let second = plan(&snaps, "pyznap", &policy, ts(2024, 3, 14, 12, 0, 45));
        assert!(second.take.is_empty());
        assert!(second.destroy.is_empty());
    }

    #[test]
    fn test_purity() {
        let snaps = vec![
            name(ts(2024, 3, 14, 11, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 14, 12, 0, 0), Granularity::Hourly),
        ];
        let now = ts(2024, 3, 14, 12, 30, 0);
        let a = plan(&snaps, "pyznap", &full_policy(), now);
        let b = plan(&snaps, "pyznap", &full_policy(), now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_enumeration_order_does_not_matter() {
        let mut snaps = vec![
            name(ts(2024, 3, 14, 11, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 14, 12, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 13, 12, 0, 0), Granularity::Daily),
        ];
        let now = ts(2024, 3, 14, 12, 30, 0);
        let forward = plan(&snaps, "pyznap", &full_policy(), now);
        snaps.reverse();
        let backward = plan(&snaps, "pyznap", &full_policy(), now);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_bucket_coverage() {
        // Three hourly windows exist but the policy wants two.
        let snaps = vec![
            name(ts(2024, 3, 14, 10, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 14, 11, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 14, 12, 0, 0), Granularity::Hourly),
        ];
        let policy = RetentionPolicy {
            hourly: 2,
            ..Default::default()
        };
        let plan = plan(&snaps, "pyznap", &policy, ts(2024, 3, 14, 12, 30, 0));
        assert_eq!(plan.keep.len(), 2);
        assert_eq!(
            plan.destroy,
            vec![name(ts(2024, 3, 14, 10, 0, 0), Granularity::Hourly)]
        );
    }

    #[test]
    fn test_newest_in_window_is_representative() {
        // Two snapshots inside hour 12; the newer one represents the window.
        let snaps = vec![
            name(ts(2024, 3, 14, 12, 10, 0), Granularity::Hourly),
            name(ts(2024, 3, 14, 12, 50, 0), Granularity::Hourly),
        ];
        let policy = RetentionPolicy {
            hourly: 24,
            ..Default::default()
        };
        let plan = plan(&snaps, "pyznap", &policy, ts(2024, 3, 14, 13, 0, 0));
        assert_eq!(
            plan.keep,
            vec![name(ts(2024, 3, 14, 12, 50, 0), Granularity::Hourly)]
        );
        assert_eq!(
            plan.destroy,
            vec![name(ts(2024, 3, 14, 12, 10, 0), Granularity::Hourly)]
        );
    }

    #[test]
    fn test_monotone_creation() {
        // A snapshot just taken is always in the kept set.
        let now = ts(2024, 3, 14, 12, 0, 0);
        let policy = full_policy();
        let existing = vec![
            name(ts(2024, 3, 14, 11, 0, 0), Granularity::Hourly),
            name(ts(2024, 3, 13, 12, 0, 0), Granularity::Daily),
        ];

        let decision = plan(&existing, "pyznap", &policy, now);
        for &g in &decision.take {
            let fresh = name(now, g);
            let mut with_fresh = existing.clone();
            with_fresh.push(fresh.clone());
            let replanned = plan(&with_fresh, "pyznap", &policy, now);
            assert!(replanned.keep.contains(&fresh), "{fresh} must be kept");
        }
    }

    #[test]
    fn test_weekly_bucket_spans_year_boundary() {
        // 2024-12-30 and 2025-01-02 share ISO week 2025-W01: one window.
        let snaps = vec![
            name(ts(2024, 12, 30, 0, 0, 0), Granularity::Weekly),
            name(ts(2025, 1, 2, 0, 0, 0), Granularity::Weekly),
        ];
        let policy = RetentionPolicy {
            weekly: 1,
            ..Default::default()
        };
        let plan = plan(&snaps, "pyznap", &policy, ts(2025, 1, 2, 12, 0, 0));
        assert_eq!(
            plan.keep,
            vec![name(ts(2025, 1, 2, 0, 0, 0), Granularity::Weekly)]
        );
        assert_eq!(plan.destroy.len(), 1);
    }

    #[test]
    fn test_empty_policy_destroys_everything_schema() {
        let snaps = vec![
            name(ts(2024, 3, 14, 11, 0, 0), Granularity::Hourly),
            "keep-me-forever".to_string(),
        ];
        let plan = plan(
            &snaps,
            "pyznap",
            &RetentionPolicy::default(),
            ts(2024, 3, 14, 12, 0, 0),
        );
        assert!(plan.take.is_empty());
        assert_eq!(
            plan.destroy,
            vec![name(ts(2024, 3, 14, 11, 0, 0), Granularity::Hourly)]
        );
    }
}
