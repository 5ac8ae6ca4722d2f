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

use std::time::Duration;

// -- Naming --
/// Prefix of snapshots managed by this tool.
pub const SNAPSHOT_PREFIX: &str = "pyznap";
/// Snapshots created by sanoid are recognized (and thinned) as well.
pub const COMPAT_PREFIX: &str = "autosnap";

// -- Config --
pub const CONFIG_DIR: &str = "/etc/pyznap";
pub const CONFIG_FILE: &str = "pyznap.conf";

// -- SSH --
pub const SSH_CONNECT_TIMEOUT: u64 = 10;
pub const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SSH_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// -- Subprocess supervision --
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL on pipeline teardown.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(10);
/// Per-stage cap on stderr captured to memory.
pub const STDERR_CAP: usize = 64 * 1024;

// -- Send pipeline --
/// Streams smaller than this skip mbuffer and pv entirely.
pub const MIN_BUFFERED_STREAM: u64 = 1024 * 1024;
pub const MBUFFER_BLOCK_SIZE: &str = "128K";
pub const MBUFFER_MAX_LOCAL_MB: u64 = 512;
pub const MBUFFER_MAX_REMOTE_MB: u64 = 256;
pub const PV_WIDTH: u32 = 100;
/// pv update interval when stdout is not a terminal (seconds).
pub const PV_REDIRECTED_INTERVAL: u32 = 60;

// -- Retries --
pub const DEFAULT_RETRIES: u32 = 0;
pub const DEFAULT_RETRY_INTERVAL: u64 = 10;

pub const DEFAULT_VERBOSITY: u32 = 1;
