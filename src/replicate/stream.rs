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

//! Materializes one planned stream as an OS pipeline:
//!
//! `zfs send | mbuffer | pv | compress  =>  decompress | mbuffer | zfs receive`
//!
//! The sender side runs on the source host, the receiver side on the
//! destination host, joined on the machine running this process. With both
//! ends remote that makes two ssh connections spliced locally. mbuffer and
//! pv are accelerators: missing tools and tiny streams just drop them.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::global::defaults::{
    MBUFFER_BLOCK_SIZE, MBUFFER_MAX_LOCAL_MB, MBUFFER_MAX_REMOTE_MB, MIN_BUFFERED_STREAM,
    PV_REDIRECTED_INTERVAL, PV_WIDTH,
};
use crate::process::Host;
use crate::process::pipeline::{Pipeline, Stage};
use crate::ui;
use crate::utils::{sh_join, stdout_is_tty};
use crate::zfs::{self, ReceiveOpts, SendSpec};

/// Stream compression for ssh transfers. Disabled for raw sends and when
/// the tool is missing on either end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Lzop,
    Lz4,
    Gzip,
    Pigz,
    Bzip2,
    Xz,
}

impl Compression {
    pub fn tool(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lzop => Some("lzop"),
            Compression::Lz4 => Some("lz4"),
            Compression::Gzip => Some("gzip"),
            Compression::Pigz => Some("pigz"),
            Compression::Bzip2 => Some("bzip2"),
            Compression::Xz => Some("xz"),
        }
    }

    fn compress_argv(self) -> Option<Vec<String>> {
        let argv: &[&str] = match self {
            Compression::None => return None,
            Compression::Lzop => &["lzop"],
            Compression::Lz4 => &["lz4", "-c"],
            Compression::Gzip => &["gzip", "-3"],
            Compression::Pigz => &["pigz", "-3"],
            Compression::Bzip2 => &["bzip2", "-3"],
            Compression::Xz => &["xz", "-0"],
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    fn decompress_argv(self) -> Option<Vec<String>> {
        let argv: &[&str] = match self {
            Compression::None => return None,
            Compression::Lzop => &["lzop", "-dfc"],
            Compression::Lz4 => &["lz4", "-dc"],
            Compression::Gzip => &["gzip", "-dc"],
            Compression::Pigz => &["pigz", "-dc"],
            Compression::Bzip2 => &["bzip2", "-dc"],
            Compression::Xz => &["xz", "-dc"],
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "lzop" => Ok(Compression::Lzop),
            "lz4" => Ok(Compression::Lz4),
            "gzip" => Ok(Compression::Gzip),
            "pigz" => Ok(Compression::Pigz),
            "bzip2" => Ok(Compression::Bzip2),
            "xz" => Ok(Compression::Xz),
            other => Err(Error::Config(format!("unknown compression '{other}'"))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tool().unwrap_or("none"))
    }
}

pub struct StreamOpts {
    pub raw: bool,
    pub resume: bool,
    pub compress: Compression,
}

/// Runs one planned stream to completion. Pipeline failures whose stderr
/// matches a ZFS state error are promoted to terminal `Zfs` errors so the
/// retry logic does not hammer an unfixable destination.
pub fn run_stream(
    src_host: &Host,
    dest_host: &Host,
    dest_dataset: &str,
    spec: &SendSpec,
    opts: &StreamOpts,
    size: u64,
) -> Result<()> {
    let over_ssh = src_host.is_remote() || dest_host.is_remote();
    let buffered = size >= MIN_BUFFERED_STREAM;
    let compression = active_compression(src_host, dest_host, opts, over_ssh);

    let sender = sender_command(src_host, spec, compression, size, over_ssh, buffered);
    let receiver = receiver_command(dest_host, dest_dataset, opts, compression, size, over_ssh, buffered);

    let mut pipeline = Pipeline::new();
    pipeline.push(Stage::new("send", src_host.shell_argv(&sender)).echoed());
    pipeline.push(Stage::new("receive", dest_host.shell_argv(&receiver)));

    match pipeline.run() {
        Ok(()) => Ok(()),
        Err(Error::Pipeline { stage, stderr }) => {
            let classified = zfs::classify_stderr(&stderr);
            match classified {
                crate::error::ZfsError::Generic(_) => Err(Error::Pipeline { stage, stderr }),
                terminal => Err(terminal.into()),
            }
        }
        Err(e) => Err(e),
    }
}

/// Compression applies only across ssh and never to raw streams, and it
/// takes both ends: the compressor on the source host and its counterpart
/// on the destination host. Anything less falls back to an uncompressed
/// stream.
fn active_compression(
    src_host: &Host,
    dest_host: &Host,
    opts: &StreamOpts,
    over_ssh: bool,
) -> Option<Compression> {
    if opts.raw || !over_ssh {
        return None;
    }
    let tool = opts.compress.tool()?;
    if !zfs::tool_available(src_host, tool) || !zfs::tool_available(dest_host, tool) {
        ui::cli::verbose!("{} not available on both ends, sending uncompressed", tool);
        return None;
    }
    Some(opts.compress)
}

/// The shell command line of the sending side.
fn sender_command(
    src_host: &Host,
    spec: &SendSpec,
    compression: Option<Compression>,
    size: u64,
    over_ssh: bool,
    buffered: bool,
) -> String {
    let mut parts: Vec<String> = vec![sh_join(&zfs::send_argv(spec))];

    if buffered && zfs::tool_available(src_host, "mbuffer") {
        parts.push(sh_join(&mbuffer_argv(size, over_ssh)));
    }
    if buffered && zfs::tool_available(src_host, "pv") {
        parts.push(sh_join(&pv_argv(size)));
    }
    if let Some(argv) = compression.and_then(Compression::compress_argv) {
        parts.push(sh_join(&argv));
    }

    parts.join(" | ")
}

/// The shell command line of the receiving side.
fn receiver_command(
    dest_host: &Host,
    dest_dataset: &str,
    opts: &StreamOpts,
    compression: Option<Compression>,
    size: u64,
    over_ssh: bool,
    buffered: bool,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(argv) = compression.and_then(Compression::decompress_argv) {
        parts.push(sh_join(&argv));
    }
    if over_ssh && buffered && zfs::tool_available(dest_host, "mbuffer") {
        parts.push(sh_join(&mbuffer_argv(size, over_ssh)));
    }

    let receive = zfs::receive_argv(
        dest_dataset,
        ReceiveOpts {
            force: true,
            nomount: true,
            resume: opts.resume,
        },
    );
    parts.push(sh_join(&receive));

    parts.join(" | ")
}

fn mbuffer_argv(size: u64, over_ssh: bool) -> Vec<String> {
    let cap = if over_ssh {
        MBUFFER_MAX_REMOTE_MB
    } else {
        MBUFFER_MAX_LOCAL_MB
    };
    let megabytes = (size / (1024 * 1024)).clamp(1, cap);
    vec![
        "mbuffer".to_string(),
        "-q".to_string(),
        "-s".to_string(),
        MBUFFER_BLOCK_SIZE.to_string(),
        "-m".to_string(),
        format!("{megabytes}M"),
    ]
}

fn pv_argv(size: u64) -> Vec<String> {
    let mut argv = vec![
        "pv".to_string(),
        "-f".to_string(),
        "-w".to_string(),
        PV_WIDTH.to_string(),
        "-s".to_string(),
        size.to_string(),
    ];
    if !stdout_is_tty() {
        // Update once a minute instead of continuously redrawing.
        argv.push("-D".to_string());
        argv.push(PV_REDIRECTED_INTERVAL.to_string());
        argv.push("-i".to_string());
        argv.push(PV_REDIRECTED_INTERVAL.to_string());
    }
    argv
}
