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

//! Decides, for one (source dataset, dest dataset) pair, which streams to
//! send. Pure: the driver supplies both sides' snapshot state and executes
//! the returned actions in order.

use std::collections::HashSet;

use thiserror::Error;

/// The destination dataset as observed by the driver.
#[derive(Debug, Clone, Default)]
pub struct DestState {
    pub exists: bool,
    /// Snapshot names (the part after `@`), oldest first.
    pub snapnames: Vec<String>,
    /// Token of an interrupted receive, when the dataset carries one.
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAction {
    /// Continue an interrupted receive. Always first, and the driver must
    /// re-probe the destination before acting on anything planned after it.
    Resume { token: String },
    /// Full stream of one snapshot; seeds an empty destination with the
    /// oldest history.
    Full { snapname: String },
    /// Incremental stream from `base` up to `target`, carrying every
    /// intermediate snapshot.
    Incremental { base: String, target: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("source has no snapshots")]
    NoSnapshots,
    /// The destination has snapshots, but none shared with the source.
    /// Not auto-recoverable; the destination needs manual attention.
    #[error("no common snapshot, but destination is not empty")]
    NoCommonBase,
}

/// Derives the ordered action list for one dataset pair.
///
/// `source_snapnames` must be oldest first. With a resume token and
/// `resume` enabled, the plan starts with a `Resume`; the continuation is
/// planned from the currently known destination state and the driver
/// re-plans once the resumed receive lands.
pub fn plan(
    source_snapnames: &[String],
    dest: &DestState,
    resume: bool,
) -> Result<Vec<SendAction>, PlanError> {
    if source_snapnames.is_empty() {
        return Err(PlanError::NoSnapshots);
    }
    let newest = source_snapnames
        .last()
        .expect("checked non-empty")
        .clone();
    let oldest = source_snapnames
        .first()
        .expect("checked non-empty")
        .clone();

    let dest_names: HashSet<&str> = dest.snapnames.iter().map(|s| s.as_str()).collect();
    let common_base = source_snapnames
        .iter()
        .rev()
        .find(|name| dest_names.contains(name.as_str()));

    let mut actions = Vec::new();

    if resume {
        if let Some(token) = &dest.resume_token {
            actions.push(SendAction::Resume {
                token: token.clone(),
            });
        }
    }

    match common_base {
        Some(base) => {
            if *base != newest {
                actions.push(SendAction::Incremental {
                    base: base.clone(),
                    target: newest,
                });
            }
        }
        None => {
            if dest.exists && !dest.snapnames.is_empty() {
                return Err(PlanError::NoCommonBase);
            }
            if actions.is_empty() {
                // Nothing to resume: seed the destination from scratch.
                actions.push(SendAction::Full {
                    snapname: oldest.clone(),
                });
                if oldest != newest {
                    actions.push(SendAction::Incremental {
                        base: oldest,
                        target: newest,
                    });
                }
            }
        }
    }

    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_incremental_from_common_base() {
        let source = names(&["s1", "s2", "s3"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s1"]),
            resume_token: None,
        };
        let actions = plan(&source, &dest, false).unwrap();
        assert_eq!(
            actions,
            vec![SendAction::Incremental {
                base: "s1".to_string(),
                target: "s3".to_string(),
            }]
        );
    }

    #[test]
    fn test_newest_common_snapshot_is_the_base() {
        let source = names(&["s1", "s2", "s3", "s4"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s1", "s2"]),
            resume_token: None,
        };
        let actions = plan(&source, &dest, false).unwrap();
        assert_eq!(
            actions,
            vec![SendAction::Incremental {
                base: "s2".to_string(),
                target: "s4".to_string(),
            }]
        );
    }

    #[test]
    fn test_no_common_base_is_an_error() {
        let source = names(&["s2", "s3"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s1"]),
            resume_token: None,
        };
        assert_eq!(plan(&source, &dest, false), Err(PlanError::NoCommonBase));
    }

    #[test]
    fn test_empty_dest_gets_oldest_then_incremental() {
        let source = names(&["s1", "s2", "s3"]);
        let dest = DestState::default();
        let actions = plan(&source, &dest, false).unwrap();
        assert_eq!(
            actions,
            vec![
                SendAction::Full {
                    snapname: "s1".to_string()
                },
                SendAction::Incremental {
                    base: "s1".to_string(),
                    target: "s3".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_single_snapshot_full_only() {
        let source = names(&["s1"]);
        let actions = plan(&source, &DestState::default(), false).unwrap();
        assert_eq!(
            actions,
            vec![SendAction::Full {
                snapname: "s1".to_string()
            }]
        );
    }

    #[test]
    fn test_up_to_date_plans_nothing() {
        let source = names(&["s1", "s2"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s1", "s2"]),
            resume_token: None,
        };
        assert!(plan(&source, &dest, false).unwrap().is_empty());
    }

    #[test]
    fn test_resume_token_leads_the_plan() {
        let source = names(&["s1", "s2", "s3"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s1"]),
            resume_token: Some("TOK".to_string()),
        };
        let actions = plan(&source, &dest, true).unwrap();
        assert_eq!(
            actions,
            vec![
                SendAction::Resume {
                    token: "TOK".to_string()
                },
                SendAction::Incremental {
                    base: "s1".to_string(),
                    target: "s3".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_resume_disabled_ignores_token() {
        let source = names(&["s1", "s2"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s1"]),
            resume_token: Some("TOK".to_string()),
        };
        let actions = plan(&source, &dest, false).unwrap();
        assert_eq!(
            actions,
            vec![SendAction::Incremental {
                base: "s1".to_string(),
                target: "s2".to_string(),
            }]
        );
    }

    #[test]
    fn test_no_source_snapshots() {
        assert_eq!(
            plan(&[], &DestState::default(), false),
            Err(PlanError::NoSnapshots)
        );
    }

    #[test]
    fn test_determinism() {
        let source = names(&["s1", "s2", "s3"]);
        let dest = DestState {
            exists: true,
            snapnames: names(&["s2", "s1"]),
            resume_token: None,
        };
        let a = plan(&source, &dest, false).unwrap();
        let b = plan(&source, &dest, false).unwrap();
        assert_eq!(a, b);
    }
}
