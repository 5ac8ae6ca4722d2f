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

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::global;
use crate::global::defaults::{STDERR_CAP, TEARDOWN_GRACE};
use crate::process::send_signal;
use crate::ui;

/// One process of a pipeline. `argv` is the final, host-wrapped command.
pub struct Stage {
    pub label: String,
    pub argv: Vec<String>,
    /// Forward this stage's stderr to the user while it runs (pv progress).
    pub echo: bool,
}

impl Stage {
    pub fn new(label: &str, argv: Vec<String>) -> Self {
        Self {
            label: label.to_string(),
            argv,
            echo: false,
        }
    }

    pub fn echoed(mut self) -> Self {
        self.echo = true;
        self
    }
}

struct StageExit {
    code: Option<i32>,
    signal: Option<i32>,
}

/// A left-to-right chain of processes, stdout of each feeding stdin of the
/// next. Success means every stage exited 0; otherwise the first failing
/// stage's stderr is the canonical error.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Spawns all stages, supervises them to completion and tears the chain
    /// down on interrupt. Interrupt teardown reports `Cancelled` and never
    /// masks a stage that had already failed on its own.
    pub fn run(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Ok(());
        }
        ui::cli::verbose!(
            "pipeline=\"{}\"",
            self.stages
                .iter()
                .map(|s| s.argv.join(" "))
                .collect::<Vec<_>>()
                .join(" => ")
        );

        let mut children: Vec<Child> = Vec::new();
        let mut readers = Vec::new();
        let mut prev_stdout: Option<ChildStdout> = None;
        let last = self.stages.len() - 1;

        for (i, stage) in self.stages.iter().enumerate() {
            let mut command = Command::new(&stage.argv[0]);
            command.args(&stage.argv[1..]);

            match prev_stdout.take() {
                Some(out) => command.stdin(Stdio::from(out)),
                None => command.stdin(Stdio::null()),
            };
            command.stdout(if i == last {
                Stdio::null()
            } else {
                Stdio::piped()
            });
            command.stderr(Stdio::piped());

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    // Anything already running is useless now.
                    teardown(&mut children);
                    return Err(spawn_error(stage, e));
                }
            };

            if i != last {
                prev_stdout = Some(child.stdout.take().expect("stdout is piped"));
            }
            let stderr = child.stderr.take().expect("stderr is piped");
            let echo = stage.echo;
            readers.push(std::thread::spawn(move || drain_stderr(stderr, echo)));

            children.push(child);
        }

        let (exits, cancelled) = supervise(&mut children);

        let mut captured = Vec::new();
        for reader in readers {
            captured.push(reader.join().unwrap_or_default());
        }

        // The first stage that failed under its own power wins; teardown
        // signals must not shadow it.
        for (i, exit) in exits.iter().enumerate() {
            if let Some(code) = exit.code {
                if code != 0 {
                    return Err(Error::Pipeline {
                        stage: self.stages[i].label.clone(),
                        stderr: stderr_tail(&captured[i]),
                    });
                }
            }
        }

        if cancelled {
            return Err(Error::Cancelled);
        }

        for (i, exit) in exits.iter().enumerate() {
            if let Some(signal) = exit.signal {
                return Err(Error::Pipeline {
                    stage: self.stages[i].label.clone(),
                    stderr: format!(
                        "terminated by signal {signal}: {}",
                        stderr_tail(&captured[i])
                    ),
                });
            }
        }

        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_error(stage: &Stage, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ToolMissing(stage.argv[0].clone())
    } else {
        Error::Pipeline {
            stage: stage.label.clone(),
            stderr: e.to_string(),
        }
    }
}

/// Polls every child until all have exited. On interrupt, or once any stage
/// has failed, sends SIGTERM to the survivors, waits out the grace period
/// and escalates to SIGKILL. Returns the per-stage exits and whether the
/// teardown happened because of an interrupt.
fn supervise(children: &mut [Child]) -> (Vec<StageExit>, bool) {
    let mut exits: Vec<Option<StageExit>> = children.iter().map(|_| None).collect();
    let mut term_sent_at: Option<Instant> = None;
    let mut kill_sent = false;
    let mut interrupt_teardown = false;

    loop {
        let mut running = false;
        for (i, child) in children.iter_mut().enumerate() {
            if exits[i].is_some() {
                continue;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    exits[i] = Some(StageExit {
                        code: status.code(),
                        signal: status.signal(),
                    });
                }
                Ok(None) => running = true,
                Err(_) => {
                    exits[i] = Some(StageExit {
                        code: Some(-1),
                        signal: None,
                    });
                }
            }
        }

        if !running {
            break;
        }

        if term_sent_at.is_none() {
            let failed = exits
                .iter()
                .flatten()
                .any(|e| !matches!(e.code, Some(0)));
            if global::interrupted() || failed {
                interrupt_teardown = global::interrupted();
                for (i, child) in children.iter().enumerate() {
                    if exits[i].is_none() {
                        send_signal(child, libc::SIGTERM);
                    }
                }
                term_sent_at = Some(Instant::now());
            }
        }

        if let Some(at) = term_sent_at {
            if !kill_sent && at.elapsed() > TEARDOWN_GRACE {
                for (i, child) in children.iter().enumerate() {
                    if exits[i].is_none() {
                        send_signal(child, libc::SIGKILL);
                    }
                }
                kill_sent = true;
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    let exits = exits
        .into_iter()
        .map(|e| {
            e.unwrap_or(StageExit {
                code: Some(-1),
                signal: None,
            })
        })
        .collect();
    (exits, interrupt_teardown)
}

/// Hard teardown used when a later stage failed to spawn.
fn teardown(children: &mut Vec<Child>) {
    for child in children.iter() {
        send_signal(child, libc::SIGKILL);
    }
    for child in children.iter_mut() {
        let _ = child.wait();
    }
}

/// Reads a stage's stderr to completion, keeping at most the trailing
/// `STDERR_CAP` bytes. With `echo` the bytes are forwarded to our stderr as
/// they arrive, which is how pv progress reaches the terminal.
fn drain_stderr(mut stream: impl Read, echo: bool) -> String {
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if echo {
                    let mut err = std::io::stderr();
                    let _ = err.write_all(&chunk[..n]);
                    let _ = err.flush();
                }
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > STDERR_CAP {
                    let cut = kept.len() - STDERR_CAP;
                    kept.drain(..cut);
                }
            }
            Err(_) => break,
        }
    }

    String::from_utf8_lossy(&kept).into_owned()
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    // pv writes carriage-return separated progress; keep only real content.
    let last_lines: Vec<&str> = trimmed
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    last_lines.join(" - ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(label: &str, script: &str) -> Stage {
        Stage::new(
            label,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn test_success_chain() {
        let mut pipeline = Pipeline::new();
        pipeline.push(sh("produce", "printf 'a\\nb\\nc\\n'"));
        pipeline.push(sh("consume", "cat > /dev/null"));
        assert!(pipeline.run().is_ok());
    }

    #[test]
    fn test_first_failure_is_canonical() {
        let mut pipeline = Pipeline::new();
        pipeline.push(sh("produce", "echo upstream-broke >&2; exit 3"));
        pipeline.push(sh("consume", "cat > /dev/null; exit 5"));
        let err = pipeline.run().unwrap_err();
        match err {
            Error::Pipeline { stage, stderr } => {
                assert_eq!(stage, "produce");
                assert!(stderr.contains("upstream-broke"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_downstream_failure_reported() {
        let mut pipeline = Pipeline::new();
        pipeline.push(sh("produce", "printf data"));
        pipeline.push(sh("consume", "echo no-space-left >&2; exit 1"));
        let err = pipeline.run().unwrap_err();
        match err {
            Error::Pipeline { stage, stderr } => {
                assert_eq!(stage, "consume");
                assert!(stderr.contains("no-space-left"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_stage_binary() {
        let mut pipeline = Pipeline::new();
        pipeline.push(sh("produce", "printf data"));
        pipeline.push(Stage::new(
            "consume",
            vec!["definitely-not-a-real-binary-xyz".to_string()],
        ));
        let err = pipeline.run().unwrap_err();
        assert!(matches!(err, Error::ToolMissing(_)));
    }
}
