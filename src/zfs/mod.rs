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

//! Typed operations on datasets and snapshots over a local or remote host.
//! Everything shells out to the `zfs` binary and parses its `-H -p`
//! tab-delimited output; an absent property is the literal `-`.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::Regex;

use crate::error::{Error, Result, ZfsError};
use crate::global::defaults::COMMAND_TIMEOUT;
use crate::process::{self, Host, Output};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}

impl DatasetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filesystem" => Some(DatasetKind::Filesystem),
            "volume" => Some(DatasetKind::Volume),
            "snapshot" => Some(DatasetKind::Snapshot),
            "bookmark" => Some(DatasetKind::Bookmark),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetKind,
    pub resume_token: Option<String>,
}

/// A snapshot, split into its parent dataset path and the part after `@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub dataset: String,
    pub name: String,
}

impl Snapshot {
    pub fn full(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

/// Flags of one `zfs send` invocation.
#[derive(Debug, Clone, Default)]
pub struct SendSpec {
    /// Full `dataset@snap` to send. Ignored when resuming from a token.
    pub snapshot: String,
    /// Base of an incremental stream, full `dataset@snap`.
    pub base: Option<String>,
    /// `-I` (keep intermediate snapshots) instead of `-i`.
    pub intermediates: bool,
    /// `-w` raw send.
    pub raw: bool,
    /// `-t <token>`: continue an interrupted receive.
    pub resume_token: Option<String>,
}

pub fn send_argv(spec: &SendSpec) -> Vec<String> {
    let mut argv = vec!["zfs".to_string(), "send".to_string()];

    if let Some(token) = &spec.resume_token {
        argv.push("-t".to_string());
        argv.push(token.clone());
        return argv;
    }

    if spec.raw {
        argv.push("-w".to_string());
    }
    if let Some(base) = &spec.base {
        argv.push(if spec.intermediates { "-I" } else { "-i" }.to_string());
        argv.push(base.clone());
    }
    argv.push(spec.snapshot.clone());
    argv
}

fn send_dry_run_argv(spec: &SendSpec) -> Vec<String> {
    let mut argv = vec![
        "zfs".to_string(),
        "send".to_string(),
        "-nvP".to_string(),
    ];

    if spec.raw {
        argv.push("-w".to_string());
    }
    if let Some(token) = &spec.resume_token {
        argv.push("-t".to_string());
        argv.push(token.clone());
        return argv;
    }
    if let Some(base) = &spec.base {
        argv.push("-I".to_string());
        argv.push(base.clone());
    }
    argv.push(spec.snapshot.clone());
    argv
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOpts {
    /// `-F`: roll the destination back to its newest snapshot first.
    pub force: bool,
    /// `-u`: do not mount after receiving.
    pub nomount: bool,
    /// `-s`: keep a resume token on interruption.
    pub resume: bool,
}

pub fn receive_argv(dataset: &str, opts: ReceiveOpts) -> Vec<String> {
    let mut argv = vec!["zfs".to_string(), "receive".to_string()];
    if opts.force {
        argv.push("-F".to_string());
    }
    if opts.nomount {
        argv.push("-u".to_string());
    }
    if opts.resume {
        argv.push("-s".to_string());
    }
    argv.push(dataset.to_string());
    argv
}

// --- Listing ---

/// All filesystems and volumes below (and including) `root`, depth-first,
/// with their resume tokens where a partial receive exists.
pub fn list_datasets(host: &Host, root: &str) -> Result<Vec<Dataset>> {
    let argv = string_vec(&[
        "zfs",
        "list",
        "-H",
        "-p",
        "-r",
        "-t",
        "filesystem,volume",
        "-o",
        "name,type,receive_resume_token",
        root,
    ]);
    let out = zfs_check(host, &argv)?;
    Ok(parse_dataset_list(&out.stdout))
}

/// Snapshots of `dataset` only (no children), oldest first.
pub fn list_snapshots(host: &Host, dataset: &str) -> Result<Vec<Snapshot>> {
    let argv = string_vec(&[
        "zfs",
        "list",
        "-H",
        "-p",
        "-d",
        "1",
        "-t",
        "snapshot",
        "-o",
        "name",
        "-s",
        "creation",
        dataset,
    ]);
    let out = zfs_check(host, &argv)?;
    Ok(parse_snapshot_list(&out.stdout))
}

/// Looks up a single dataset; `Ok(None)` when it does not exist.
pub fn probe_dataset(host: &Host, name: &str) -> Result<Option<Dataset>> {
    let argv = string_vec(&[
        "zfs",
        "list",
        "-H",
        "-p",
        "-d",
        "0",
        "-o",
        "name,type,receive_resume_token",
        name,
    ]);
    match zfs_check(host, &argv) {
        Ok(out) => Ok(parse_dataset_list(&out.stdout).into_iter().next()),
        Err(Error::Zfs(ZfsError::DatasetNotFound(_))) => Ok(None),
        Err(e) => Err(e),
    }
}

// --- Mutation ---

pub fn create_snapshot(host: &Host, dataset: &str, snapname: &str, recursive: bool) -> Result<()> {
    let mut argv = string_vec(&["zfs", "snapshot"]);
    if recursive {
        argv.push("-r".to_string());
    }
    argv.push(format!("{dataset}@{snapname}"));
    zfs_check(host, &argv).map(|_| ())
}

pub fn destroy_snapshot(host: &Host, snapshot: &str) -> Result<()> {
    let argv = string_vec(&["zfs", "destroy", snapshot]);
    zfs_check(host, &argv).map(|_| ())
}

/// Hold tags on a snapshot.
pub fn holds(host: &Host, snapshot: &str) -> Result<Vec<String>> {
    let argv = string_vec(&["zfs", "holds", "-H", snapshot]);
    let out = zfs_check(host, &argv)?;
    Ok(out
        .stdout
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|tag| tag.trim().to_string())
        .collect())
}

/// Creates a dataset and its missing ancestors.
pub fn create_dataset(host: &Host, name: &str) -> Result<()> {
    let argv = string_vec(&["zfs", "create", "-p", name]);
    let out = run_raw(host, &argv, None)?;
    if out.success() {
        return Ok(());
    }
    // Non-root can create but not mount; the dataset exists, which is all
    // replication needs.
    if out
        .stderr
        .contains("filesystem successfully created, but it may only be mounted by root")
    {
        return Ok(());
    }
    Err(classify_stderr(&out.stderr).into())
}

// --- Probes ---

/// Whether a `zfs receive` into `dataset` is currently running on the host,
/// judged from the process table. Errors during the check count as "in
/// progress": it is never safe to start a second receive then.
pub fn receive_in_progress(host: &Host, dataset: &str) -> bool {
    let argv = string_vec(&["ps", "-Ao", "args="]);
    let out = match process::run(host, &argv, Some(COMMAND_TIMEOUT)) {
        Ok(out) if out.success() => out,
        _ => return true,
    };

    let pattern = format!(r"zfs (receive|recv).*{}", regex::escape(dataset));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(&out.stdout),
        Err(_) => true,
    }
}

static TOOL_CACHE: LazyLock<Mutex<HashMap<(String, String), bool>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Whether an executable exists on the host. Probed once per host per
/// invocation, cached afterwards.
pub fn tool_available(host: &Host, tool: &str) -> bool {
    let key = (host.cache_key(), tool.to_string());
    if let Some(&known) = TOOL_CACHE.lock().get(&key) {
        return known;
    }

    let available = match host {
        Host::Local => which::which(tool).is_ok(),
        Host::Remote(_) => {
            let argv = string_vec(&["command", "-v", tool]);
            matches!(process::run(host, &argv, Some(COMMAND_TIMEOUT)), Ok(out) if out.success())
        }
    };

    TOOL_CACHE.lock().insert(key, available);
    available
}

/// Estimated stream size via `zfs send -nvP`, for buffers and progress
/// totals only. Any failure yields 0, which disables those extras.
pub fn stream_size(host: &Host, spec: &SendSpec) -> u64 {
    let argv = send_dry_run_argv(spec);
    match run_raw(host, &argv, None) {
        Ok(out) if out.success() => parse_stream_size(&out.stdout),
        _ => 0,
    }
}

// --- Output parsing ---

fn parse_dataset_list(stdout: &str) -> Vec<Dataset> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.to_string();
            let kind = DatasetKind::parse(fields.next()?)?;
            let resume_token = match fields.next() {
                None | Some("-") | Some("") => None,
                Some(token) => Some(token.to_string()),
            };
            Some(Dataset {
                name,
                kind,
                resume_token,
            })
        })
        .collect()
}

fn parse_snapshot_list(stdout: &str) -> Vec<Snapshot> {
    stdout
        .lines()
        .filter_map(|line| {
            let full = line.split('\t').next()?.trim();
            let (dataset, name) = full.split_once('@')?;
            Some(Snapshot {
                dataset: dataset.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

fn parse_stream_size(stdout: &str) -> u64 {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty());
    last.and_then(|line| line.split_whitespace().last())
        .and_then(|field| field.parse::<u64>().ok())
        .unwrap_or(0)
}

// --- Error classification ---

static CANNOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // "cannot <action> '<target>': <reason>"
    Regex::new(r"^cannot [^:]+'([^']+)':\s*(.+)$").expect("static regex")
});

/// Maps a `zfs` stderr to the error taxonomy. Only the first line carries
/// the structured "cannot ...: reason" form; receive failures use a few
/// free-form messages matched as substrings.
pub fn classify_stderr(stderr: &str) -> ZfsError {
    let message = stderr.trim();
    let first = message.lines().next().unwrap_or_default();

    if let Some(caps) = CANNOT_RE.captures(first) {
        let target = caps[1].to_string();
        let reason = caps[2].trim();
        return match reason {
            "dataset does not exist" => ZfsError::DatasetNotFound(target),
            "dataset already exists" => ZfsError::DatasetExists(target),
            "dataset is busy" => ZfsError::Busy(target),
            "out of space" => ZfsError::OutOfSpace(target),
            _ if reason.contains("quota") => ZfsError::OutOfSpace(target),
            _ if reason.contains("has been modified") => ZfsError::StreamMismatch(target),
            _ => ZfsError::Generic(first.to_string()),
        };
    }

    if message.contains("does not match incremental source")
        || message.contains("has been modified")
        || message.contains("invalid backup stream")
        || message.contains("checksum mismatch")
    {
        return ZfsError::StreamMismatch(first.to_string());
    }
    if message.contains("destination has snapshots") {
        return ZfsError::NoCommonBase(first.to_string());
    }

    ZfsError::Generic(if first.is_empty() {
        "command failed without output".to_string()
    } else {
        first.to_string()
    })
}

// --- Plumbing ---

fn string_vec(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn run_raw(host: &Host, argv: &[String], timeout: Option<std::time::Duration>) -> Result<Output> {
    process::run(host, argv, timeout)
}

fn zfs_check(host: &Host, argv: &[String]) -> Result<Output> {
    let out = run_raw(host, argv, None)?;
    if out.success() {
        Ok(out)
    } else {
        Err(classify_stderr(&out.stderr).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_list() {
        let stdout = "rpool\tfilesystem\t-\n\
                      rpool/data\tfilesystem\t1-abcdef-123\n\
                      rpool/swap\tvolume\t-\n";
        let datasets = parse_dataset_list(stdout);
        assert_eq!(datasets.len(), 3);
        assert_eq!(datasets[0].name, "rpool");
        assert_eq!(datasets[0].kind, DatasetKind::Filesystem);
        assert_eq!(datasets[0].resume_token, None);
        assert_eq!(datasets[1].resume_token, Some("1-abcdef-123".to_string()));
        assert_eq!(datasets[2].kind, DatasetKind::Volume);
    }

    #[test]
    fn test_parse_snapshot_list() {
        let stdout = "rpool/data@pyznap_2024-03-14_11:00:00_hourly\n\
                      rpool/data@pyznap_2024-03-14_12:00:00_hourly\n";
        let snapshots = parse_snapshot_list(stdout);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].dataset, "rpool/data");
        assert_eq!(snapshots[0].name, "pyznap_2024-03-14_11:00:00_hourly");
        assert_eq!(
            snapshots[1].full(),
            "rpool/data@pyznap_2024-03-14_12:00:00_hourly"
        );
    }

    #[test]
    fn test_parse_stream_size() {
        let stdout = "incremental\tsnap1\tsnap2\t123456\nsize\t987654\n";
        assert_eq!(parse_stream_size(stdout), 987654);
        assert_eq!(parse_stream_size(""), 0);
        assert_eq!(parse_stream_size("size\tnot-a-number\n"), 0);
    }

    #[test]
    fn test_classify_cannot_messages() {
        assert_eq!(
            classify_stderr("cannot open 'tank/a': dataset does not exist"),
            ZfsError::DatasetNotFound("tank/a".to_string())
        );
        assert_eq!(
            classify_stderr("cannot create snapshot 'tank/a@s': dataset is busy"),
            ZfsError::Busy("tank/a@s".to_string())
        );
        assert_eq!(
            classify_stderr("cannot receive new filesystem stream: out of space"),
            ZfsError::Generic("cannot receive new filesystem stream: out of space".to_string())
        );
        assert_eq!(
            classify_stderr("cannot create 'tank/b': out of space"),
            ZfsError::OutOfSpace("tank/b".to_string())
        );
    }

    #[test]
    fn test_classify_receive_messages() {
        assert!(matches!(
            classify_stderr(
                "cannot receive incremental stream: most recent snapshot of tank/b \
                 does not match incremental source"
            ),
            ZfsError::StreamMismatch(_)
        ));
        assert!(matches!(
            classify_stderr("cannot receive new filesystem stream: destination has snapshots"),
            ZfsError::NoCommonBase(_)
        ));
        assert!(matches!(
            classify_stderr("something unexpected"),
            ZfsError::Generic(_)
        ));
    }

    #[test]
    fn test_classify_modified_destination() {
        assert!(matches!(
            classify_stderr(
                "cannot receive incremental stream: destination 'tank/b' has been modified since \
                 most recent snapshot"
            ),
            ZfsError::StreamMismatch(_)
        ));
    }

    #[test]
    fn test_send_argv_full() {
        let spec = SendSpec {
            snapshot: "tank/a@s3".to_string(),
            ..Default::default()
        };
        assert_eq!(send_argv(&spec), vec!["zfs", "send", "tank/a@s3"]);
    }

    #[test]
    fn test_send_argv_incremental() {
        let spec = SendSpec {
            snapshot: "tank/a@s3".to_string(),
            base: Some("tank/a@s1".to_string()),
            intermediates: true,
            ..Default::default()
        };
        assert_eq!(
            send_argv(&spec),
            vec!["zfs", "send", "-I", "tank/a@s1", "tank/a@s3"]
        );
    }

    #[test]
    fn test_send_argv_raw() {
        let spec = SendSpec {
            snapshot: "tank/a@s3".to_string(),
            base: Some("tank/a@s1".to_string()),
            raw: true,
            ..Default::default()
        };
        assert_eq!(
            send_argv(&spec),
            vec!["zfs", "send", "-w", "-i", "tank/a@s1", "tank/a@s3"]
        );
    }

    #[test]
    fn test_send_argv_resume_overrides() {
        let spec = SendSpec {
            snapshot: "tank/a@s3".to_string(),
            base: Some("tank/a@s1".to_string()),
            resume_token: Some("1-deadbeef".to_string()),
            ..Default::default()
        };
        assert_eq!(send_argv(&spec), vec!["zfs", "send", "-t", "1-deadbeef"]);
    }

    #[test]
    fn test_receive_argv() {
        let argv = receive_argv(
            "tank/backup/a",
            ReceiveOpts {
                force: true,
                nomount: true,
                resume: true,
            },
        );
        assert_eq!(
            argv,
            vec!["zfs", "receive", "-F", "-u", "-s", "tank/backup/a"]
        );
    }
}
