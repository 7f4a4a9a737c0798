// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process invocation.
//!
//! Every tool provkit leans on (lsblk, blkid, mkfs, mount, database dump
//! clients) is executed through an argument vector. Nothing is ever passed
//! through a shell, so values supplied by the operator cannot be reinterpreted
//! as shell syntax.

use std::{
    ffi::OsStr,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};
use tracing::debug;

/// Run external command and capture its standard output.
///
/// Standard error is only reported when the command fails.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be executed.
/// - Return [`SyscallError::Failed`] if command exits unsuccessfully.
pub fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    run_checked(Command::new(cmd).args(args))
}

/// Run external command and hand back its exit status along with output.
///
/// Useful for tools like blkid that signal "nothing found" through a non-zero
/// exit status rather than an error.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be executed.
pub fn syscall_output(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<CapturedOutput> {
    run_captured(Command::new(cmd).args(args))
}

/// Run prepared command and capture its standard output.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be executed.
/// - Return [`SyscallError::Failed`] if command exits unsuccessfully.
pub fn run_checked(command: &mut Command) -> Result<String> {
    let output = run_captured(command)?;
    if !output.status.success() {
        return Err(SyscallError::Failed {
            program: program_name(command),
            code: output.status.code(),
            stderr: output.stderr,
        });
    }

    Ok(output.stdout)
}

/// Run prepared command and capture everything it produced.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be executed.
pub fn run_captured(command: &mut Command) -> Result<CapturedOutput> {
    let program = program_name(command);
    debug!("run {program}");
    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|err| SyscallError::Spawn {
            source: err,
            program,
        })?;

    Ok(CapturedOutput {
        status: output.status,
        stdout: chomp(String::from_utf8_lossy(output.stdout.as_slice()).into_owned()),
        stderr: chomp(String::from_utf8_lossy(output.stderr.as_slice()).into_owned()),
    })
}

/// Run prepared command with standard output and error redirected to files.
///
/// Both files are created, or truncated if they already exist.
///
/// # Errors
///
/// - Return [`SyscallError::Redirect`] if either file cannot be created.
/// - Return [`SyscallError::Spawn`] if command cannot be executed.
pub fn run_redirected(
    command: &mut Command,
    stdout: impl AsRef<Path>,
    stderr: impl AsRef<Path>,
) -> Result<ExitStatus> {
    let program = program_name(command);
    let open = |path: &Path| {
        File::create(path).map_err(|err| SyscallError::Redirect {
            source: err,
            path: path.to_path_buf(),
        })
    };
    let out = open(stdout.as_ref())?;
    let err = open(stderr.as_ref())?;

    debug!("run {program} > {:?} 2> {:?}", stdout.as_ref(), stderr.as_ref());
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .status()
        .map_err(|err| SyscallError::Spawn {
            source: err,
            program,
        })
}

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Exit status of command.
    pub status: ExitStatus,

    /// Standard output without trailing newline.
    pub stdout: String,

    /// Standard error without trailing newline.
    pub stderr: String,
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

fn chomp(message: String) -> String {
    // INVARIANT: Chomp trailing newlines.
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

/// External process error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Command could not be executed at all.
    #[error("failed to execute {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Command ran, but exited unsuccessfully.
    #[error("command {program:?} failed with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Output redirection file could not be created.
    #[error("failed to create output file at {:?}", path.display())]
    Redirect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = SyscallError> = std::result::Result<T, E>;
