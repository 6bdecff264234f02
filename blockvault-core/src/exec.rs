//! Typed external tool invocation.
//!
//! Every external program blockvault relies on (partclone, sfdisk, wipefs,
//! udevadm, ...) is described by a [`ToolCommand`] and executed through
//! [`crate::platform::Host::run`]. Execution is synchronous; stdout and
//! stderr are fully captured before the next step proceeds. Bulk image data
//! never goes through these buffers: tools that produce images write them to
//! files themselves.
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// How many bytes of stderr are kept in a [`ToolError`].
const STDERR_TAIL: usize = 2048;

/// A single invocation of an external program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Feed this file to the program's standard input.
    pub stdin_file: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &std::path::Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Runs the command on the local system, capturing its output.
    pub fn run_local(&self) -> Result<ToolOutput, ToolError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        match &self.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|e| self.spawn_error(e))?;
                command.stdin(file);
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        let output = command.output().map_err(|e| self.spawn_error(e))?;
        let result = ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if output.status.success() {
            Ok(result)
        } else {
            Err(self.failed(output.status.code(), &result.stderr))
        }
    }

    /// Builds the error for a non-zero exit.
    pub fn failed(&self, code: Option<i32>, stderr: &str) -> ToolError {
        ToolError {
            command: self.to_string(),
            kind: ToolErrorKind::Exit(code),
            stderr: tail(stderr),
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> ToolError {
        let kind = if e.kind() == std::io::ErrorKind::NotFound {
            ToolErrorKind::NotFound
        } else {
            ToolErrorKind::Spawn(e.to_string())
        };
        ToolError {
            command: self.to_string(),
            kind,
            stderr: String::new(),
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        if let Some(path) = &self.stdin_file {
            write!(f, " < {}", path.display())?;
        }
        Ok(())
    }
}

/// Captured output of a successful invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// The program is not installed.
    NotFound,
    /// The program could not be started for another reason.
    Spawn(String),
    /// The program ran and exited unsuccessfully (`None` if killed by a signal).
    Exit(Option<i32>),
}

/// A failed tool invocation, with enough context to tell which command failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolError {
    pub command: String,
    pub kind: ToolErrorKind,
    pub stderr: String,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` ", self.command)?;
        match &self.kind {
            ToolErrorKind::NotFound => write!(f, "not found")?,
            ToolErrorKind::Spawn(e) => write!(f, "could not be started ({e})")?,
            ToolErrorKind::Exit(Some(code)) => write!(f, "exited with status {code}")?,
            ToolErrorKind::Exit(None) => write!(f, "was terminated by a signal")?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolError {}

fn tail(s: &str) -> String {
    if s.len() <= STDERR_TAIL {
        return s.to_string();
    }
    let mut start = s.len() - STDERR_TAIL;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_args_and_redirect() {
        let cmd = ToolCommand::new("sfdisk")
            .arg("/dev/sdb")
            .stdin_file("/backups/partition_table.sfdisk");
        assert_eq!(
            cmd.to_string(),
            "sfdisk /dev/sdb < /backups/partition_table.sfdisk"
        );
    }

    #[test]
    fn failure_message_names_command_and_stderr() {
        let cmd = ToolCommand::new("partclone.extfs").arg("-c");
        let err = cmd.failed(Some(1), "bad superblock\n");
        assert_eq!(
            err.to_string(),
            "`partclone.extfs -c` exited with status 1: bad superblock"
        );
    }

    #[test]
    fn stderr_is_truncated_to_tail() {
        let long = "x".repeat(STDERR_TAIL + 100) + "END";
        let err = ToolCommand::new("dd").failed(Some(1), &long);
        assert_eq!(err.stderr.len(), STDERR_TAIL);
        assert!(err.stderr.ends_with("END"));
    }

    #[test]
    fn missing_program_is_not_found() {
        let err = ToolCommand::new("blockvault-definitely-not-a-real-tool")
            .run_local()
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);
    }
}
