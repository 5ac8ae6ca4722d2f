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

pub mod pipeline;

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ssh::SshSession;
use crate::ui;

/// Where a command runs. The runner spawns locally either way; remote
/// commands are wrapped into the session's ssh prefix.
#[derive(Clone)]
pub enum Host {
    Local,
    Remote(Arc<SshSession>),
}

impl Host {
    /// The argv actually handed to the OS for a command addressed to this
    /// host.
    pub fn argv(&self, argv: &[String]) -> Vec<String> {
        match self {
            Host::Local => argv.to_vec(),
            Host::Remote(ssh) => ssh.remote_argv(argv),
        }
    }

    /// The argv for a full shell command line (stages joined with `|`).
    pub fn shell_argv(&self, command: &str) -> Vec<String> {
        match self {
            Host::Local => vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            Host::Remote(ssh) => ssh.shell_argv(command),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Host::Remote(_))
    }

    pub fn label(&self) -> String {
        match self {
            Host::Local => "localhost".to_string(),
            Host::Remote(ssh) => ssh.logname(),
        }
    }

    /// Key for per-host caches (tool availability).
    pub fn cache_key(&self) -> String {
        match self {
            Host::Local => "local".to_string(),
            Host::Remote(ssh) => ssh.endpoint(),
        }
    }
}

/// `user@host:name` for remote targets, bare `name` locally.
pub fn pretty_target(host: &Host, name: &str) -> String {
    match host {
        Host::Local => name.to_string(),
        Host::Remote(ssh) => format!("{}:{}", ssh.logname(), name),
    }
}

#[derive(Debug)]
pub struct Output {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a command on `host`, captures stdout/stderr, and waits for it to
/// finish. A command exceeding `timeout` is killed and reported as such.
/// Nonzero exits are not an error here; callers classify them.
pub fn run(host: &Host, argv: &[String], timeout: Option<Duration>) -> Result<Output> {
    let final_argv = host.argv(argv);
    ui::cli::verbose!("cmd=\"{}\"", final_argv.join(" "));

    let mut command = Command::new(&final_argv[0]);
    command
        .args(&final_argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| spawn_error(&final_argv[0], e))?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let out_reader = std::thread::spawn(move || read_all(stdout));
    let err_reader = std::thread::spawn(move || read_all(stderr));

    let status = wait_deadline(&mut child, timeout);

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();

    match status {
        Some(status) => Ok(Output {
            status,
            stdout,
            stderr,
        }),
        None => Err(Error::Timeout(format!(
            "'{}' did not finish within {:?}",
            final_argv.join(" "),
            timeout.unwrap_or_default()
        ))),
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ToolMissing(program.to_string())
    } else {
        Error::Pipeline {
            stage: program.to_string(),
            stderr: e.to_string(),
        }
    }
}

fn read_all(mut stream: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Waits for the child, killing it when the deadline passes. Returns the
/// exit code, or `None` on timeout.
fn wait_deadline(child: &mut Child, timeout: Option<Duration>) -> Option<i32> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.code().unwrap_or(-1)),
            Ok(None) => {}
            Err(_) => return Some(-1),
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                send_signal(child, libc::SIGKILL);
                let _ = child.wait();
                return None;
            }
        }

        std::thread::sleep(Duration::from_millis(25));
    }
}

pub(crate) fn send_signal(child: &Child, signal: i32) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_output() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf hello; printf world >&2".to_string(),
        ];
        let out = run(&Host::Local, &argv, None).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "world");
    }

    #[test]
    fn test_run_nonzero_is_not_err() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let out = run(&Host::Local, &argv, None).unwrap();
        assert_eq!(out.status, 3);
    }

    #[test]
    fn test_run_timeout_kills() {
        let argv = vec!["sleep".to_string(), "10".to_string()];
        let started = Instant::now();
        let err = run(&Host::Local, &argv, Some(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_tool() {
        let argv = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let err = run(&Host::Local, &argv, None).unwrap_err();
        assert!(matches!(err, Error::ToolMissing(_)));
    }
}
