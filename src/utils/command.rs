use crate::error::{ErrorKind, RuntimeError, RuntimeResult};
use std::process::Command;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Thin wrapper around external tool invocation (mkfs, rbd, lvm). Failure
/// output is preserved verbatim so callers can wrap it into their errors.
pub struct CommandExecutor;

#[allow(dead_code)]
impl CommandExecutor {
    /// Run a program with an argv, no shell involved.
    pub fn run(program: &str, args: &[&str]) -> RuntimeResult<CommandResult> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            RuntimeError::new(
                ErrorKind::Unknown,
                format!("exec({} {}): {}", program, args.join(" "), e),
            )
        })?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Run and require success; the tool's stderr is wrapped verbatim.
    pub fn run_checked(program: &str, args: &[&str]) -> RuntimeResult<CommandResult> {
        let result = Self::run(program, args)?;
        if !result.success {
            return Err(RuntimeError::new(
                ErrorKind::Unknown,
                format!(
                    "{}({}) exited {}: {}",
                    program,
                    args.join(" "),
                    result.exit_code.unwrap_or(-1),
                    result.stderr.trim()
                ),
            ));
        }
        Ok(result)
    }

    pub fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_output() {
        let result = CommandExecutor::run("echo", &["hello"]).unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn run_checked_wraps_failure_verbatim() {
        let err = CommandExecutor::run_checked("false", &[]).unwrap_err();
        assert!(err.message.contains("false"));
        assert!(err.message.contains("exited 1"));
    }

    #[test]
    fn missing_program_is_an_error() {
        assert!(CommandExecutor::run("/nonexistent/warren-tool", &[]).is_err());
    }
}
