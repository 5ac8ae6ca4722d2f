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

use thiserror::Error;

/// Errors of `zfs` invocations, classified from stderr.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ZfsError {
    #[error("dataset does not exist: {0}")]
    DatasetNotFound(String),

    #[error("dataset already exists: {0}")]
    DatasetExists(String),

    #[error("dataset is busy: {0}")]
    Busy(String),

    #[error("no common snapshot between source and destination: {0}")]
    NoCommonBase(String),

    #[error("a receive is already in progress on {0}")]
    ReceiveInProgress(String),

    #[error("stream does not match destination state: {0}")]
    StreamMismatch(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("zfs command failed: {0}")]
    Generic(String),
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("cannot reach host: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("command timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Zfs(#[from] ZfsError),

    #[error("pipeline stage '{stage}' failed: {stderr}")]
    Pipeline { stage: String, stderr: String },

    #[error("interrupted")]
    Cancelled,

    #[error("required tool not found: {0}")]
    ToolMissing(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry with backoff can reasonably succeed. ZFS state errors
    /// are terminal; transport failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::Remote(_) | Error::Timeout(_) | Error::Pipeline { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Unreachable("host down".into()).is_transient());
        assert!(
            Error::Pipeline {
                stage: "receive".into(),
                stderr: "ssh: broken pipe".into(),
            }
            .is_transient()
        );
        assert!(!Error::Zfs(ZfsError::NoCommonBase("tank".into())).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Config("bad option".into()).is_transient());
    }
}
