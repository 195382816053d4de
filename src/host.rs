//! Synchronous host command execution.
//!
//! Everything the tool does to the host goes through these helpers: a plain
//! "run and fail on non-zero exit" call, an elevated variant, a streaming
//! variant that yields stdout lines as they are produced, and probes for
//! tool availability. There is no retry logic here; callers decide what a
//! failure means.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Lines};
use std::process::{Child, ChildStdout, Command, Stdio};

use log::trace;

use crate::error::{Error, Result};

fn command_failed(tool: &str, detail: impl Into<String>) -> Error {
    Error::CommandFailed {
        tool: tool.to_string(),
        detail: detail.into(),
    }
}

/// Run a command to completion with captured output.
///
/// On non-zero exit the tool's own stderr text is surfaced in the error.
pub fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<()> {
    trace!("run: {} {:?}", program, args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()).collect::<Vec<_>>());
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| command_failed(program, e.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        Err(command_failed(program, format!("exited with {}", output.status)))
    } else {
        Err(command_failed(program, stderr))
    }
}

/// Run a command with elevated privilege (via sudo).
pub fn run_as_super<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<()> {
    let mut argv: Vec<&OsStr> = vec![program.as_ref()];
    argv.extend(args.iter().map(|a| a.as_ref()));
    run("sudo", &argv)
}

/// Run a command to completion and return its stdout.
pub fn output<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| command_failed(program, e.to_string()))?;
    if !output.status.success() {
        return Err(command_failed(program, format!("exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether a command runs and exits zero. Used for existence-style checks
/// (`iptables -C`, interface probes) where a failure is an answer, not an
/// error.
pub fn succeeds<S: AsRef<OsStr>>(program: &str, args: &[S]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether a tool is installed, probed by running it with a do-nothing
/// argument. A spawn failure means "not installed"; the exit status is
/// irrelevant.
pub fn tool_exists(tool: &str, probe_arg: &str) -> bool {
    Command::new(tool)
        .arg(probe_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Run a long-lived child with inherited stdio and wait for it to finish.
/// Used to supervise the hypervisor and the TPM emulator.
pub fn run_attached<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<()> {
    trace!("run_attached: {}", program);
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| command_failed(program, e.to_string()))?;
    if !status.success() {
        return Err(command_failed(program, format!("exited with {}", status)));
    }
    Ok(())
}

/// Elevated variant of [`run_attached`].
pub fn run_attached_as_super<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<()> {
    let mut argv: Vec<&OsStr> = vec![program.as_ref()];
    argv.extend(args.iter().map(|a| a.as_ref()));
    run_attached("sudo", &argv)
}

/// Spawn a command and stream its stdout line by line.
///
/// The returned iterator is finite: once stdout is exhausted the child is
/// reaped and a non-zero exit status is surfaced as a final `Err` item.
/// Each call spawns a fresh process, so the sequence is restartable.
pub fn stream<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<CommandLines> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| command_failed(program, e.to_string()))?;
    // stdout is always present with Stdio::piped
    let stdout = child.stdout.take().ok_or_else(|| command_failed(program, "no stdout pipe"))?;
    Ok(CommandLines {
        tool: program.to_string(),
        child,
        lines: BufReader::new(stdout).lines(),
        done: false,
    })
}

/// Stream the output of a shell pipeline.
pub fn stream_shell(script: &str) -> Result<CommandLines> {
    stream("sh", &["-c", script])
}

pub struct CommandLines {
    tool: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    done: bool,
}

impl Iterator for CommandLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }
        match self.lines.next() {
            Some(Ok(line)) => Some(Ok(line.trim_end().to_string())),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e.into()))
            }
            None => {
                self.done = true;
                match self.child.wait() {
                    Ok(status) if status.success() => None,
                    Ok(status) => {
                        Some(Err(command_failed(&self.tool, format!("exited with {}", status))))
                    }
                    Err(e) => Some(Err(e.into())),
                }
            }
        }
    }
}
