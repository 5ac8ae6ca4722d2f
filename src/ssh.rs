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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;

use crate::error::{Error, Result};
use crate::global::defaults::{SSH_CLOSE_TIMEOUT, SSH_CONNECT_TIMEOUT, SSH_PROBE_TIMEOUT};
use crate::process::{self, Host};
use crate::utils::sh_join;

/// An established ssh endpoint. Connections are multiplexed over a
/// ControlMaster socket so the many short zfs invocations of one run reuse a
/// single TCP/auth handshake.
pub struct SshSession {
    user: String,
    host: String,
    port: u16,
    base: Vec<String>,
}

impl SshSession {
    /// Builds the command prefix and probes the endpoint with a trivial
    /// remote command. Probe failures classify into `Unreachable` (cannot
    /// connect), `AuthFailed` (client rejected) and `Remote` (command
    /// failed on the other side).
    pub fn connect(user: &str, host: &str, port: u16, key: Option<&Path>) -> Result<Arc<Self>> {
        let key = match key {
            Some(key) => key.to_path_buf(),
            None => default_key()?,
        };
        if !key.is_file() {
            return Err(Error::Config(format!(
                "{} is not a valid ssh key file",
                key.display()
            )));
        }

        let socket = format!(
            "/tmp/pyznap_{}@{}:{}_{}",
            user,
            host,
            port,
            Local::now().format("%Y-%m-%d_%H:%M:%S")
        );

        let base = vec![
            "ssh".to_string(),
            "-i".to_string(),
            key.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={SSH_CONNECT_TIMEOUT}"),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            "ControlPersist=1m".to_string(),
            "-o".to_string(),
            format!("ControlPath={socket}"),
            "-p".to_string(),
            port.to_string(),
            format!("{user}@{host}"),
        ];

        let session = Arc::new(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            base,
        });

        session.probe()?;
        Ok(session)
    }

    fn probe(&self) -> Result<()> {
        let mut argv = self.base.clone();
        argv.push("--".to_string());
        argv.push("true".to_string());

        let out = match process::run(&Host::Local, &argv, Some(SSH_PROBE_TIMEOUT)) {
            Ok(out) => out,
            Err(Error::Timeout(_)) => {
                return Err(Error::Unreachable(format!(
                    "{}: connection timed out",
                    self.logname()
                )));
            }
            Err(e) => return Err(e),
        };

        if out.success() {
            return Ok(());
        }
        Err(classify_connect_failure(&self.logname(), &out.stderr))
    }

    /// The ssh invocation for a single remote command. Every word is shell
    /// quoted: the remote side runs through the login shell, and dataset
    /// names may contain spaces or quotes.
    pub fn remote_argv(&self, argv: &[String]) -> Vec<String> {
        self.shell_argv(&sh_join(argv))
    }

    /// The ssh invocation for a prepared remote shell command line.
    pub fn shell_argv(&self, command: &str) -> Vec<String> {
        let mut full = self.base.clone();
        full.push("--".to_string());
        full.push(command.to_string());
        full
    }

    pub fn logname(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Host identity for caches; same user+host+port reaches the same ZFS.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Tears down the multiplexed connection (removes the control socket).
    pub fn close(&self) {
        let mut argv = self.base.clone();
        argv.push("-O".to_string());
        argv.push("exit".to_string());
        let _ = process::run(&Host::Local, &argv, Some(SSH_CLOSE_TIMEOUT));
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn default_key() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| Error::Config("HOME is not set, cannot locate ssh key".to_string()))?;
    Ok(PathBuf::from(home).join(".ssh").join("id_rsa"))
}

fn classify_connect_failure(logname: &str, stderr: &str) -> Error {
    let message = stderr.trim();

    if message.contains("Permission denied")
        || message.contains("Host key verification failed")
        || message.contains("No supported authentication")
    {
        return Error::AuthFailed(format!("{logname}: {message}"));
    }

    if message.starts_with("ssh:")
        || message.contains("Connection refused")
        || message.contains("Connection timed out")
        || message.contains("Could not resolve hostname")
        || message.contains("Network is unreachable")
        || message.contains("Connection closed by")
    {
        return Error::Unreachable(format!("{logname}: {message}"));
    }

    Error::Remote(format!("{logname}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_failure() {
        let err = classify_connect_failure(
            "root@host",
            "root@host: Permission denied (publickey,password).",
        );
        assert!(matches!(err, Error::AuthFailed(_)));
    }

    #[test]
    fn test_classify_unreachable() {
        let err = classify_connect_failure(
            "root@host",
            "ssh: connect to host host port 22: Connection refused",
        );
        assert!(matches!(err, Error::Unreachable(_)));

        let err = classify_connect_failure(
            "root@host",
            "ssh: Could not resolve hostname host: Name or service not known",
        );
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[test]
    fn test_classify_remote_error() {
        let err = classify_connect_failure("root@host", "zsh: command not found: true");
        assert!(matches!(err, Error::Remote(_)));
    }
}
