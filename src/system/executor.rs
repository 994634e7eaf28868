// src/system/executor.rs

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, std::io::Error),
    #[error("Command '{0}' exited with a non-zero error code.")]
    NonZeroExitStatus(String),
}

/// Executes a single command line to completion, inheriting stdio.
///
/// A leading `-` marks the line as ignore-errors: a non-zero exit status is
/// tolerated. An empty line is a success, not an error.
pub fn execute_line(
    command_line: &str,
    cwd: &Path,
    env_vars: &HashMap<String, String>,
) -> Result<(), ExecutionError> {
    let trimmed = command_line.trim();
    if trimmed.is_empty() {
        return Ok(());
    }

    let (final_line, ignore_errors) = match trimmed.strip_prefix('-') {
        Some(rest) => (rest.trim(), true),
        None => (trimmed, false),
    };
    if final_line.is_empty() {
        return Ok(());
    }

    let parts = shlex::split(final_line)
        .ok_or_else(|| ExecutionError::CommandParse(final_line.to_string()))?;
    let Some((program, args)) = parts.split_first() else {
        return Ok(());
    };

    let clean_cwd = dunce::simplified(cwd);
    let mut command = StdCommand::new(program);
    command
        .args(args)
        .current_dir(clean_cwd)
        .envs(env_vars)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // Fallback for Windows shell built-ins like `echo`: retry through cmd /C.
    let status = match command.status() {
        Ok(status) => status,
        Err(e) if e.kind() == ErrorKind::NotFound && cfg!(target_os = "windows") => {
            log::debug!("Command '{program}' not found. Retrying with cmd /C.");
            StdCommand::new("cmd")
                .arg("/C")
                .arg(final_line)
                .current_dir(clean_cwd)
                .envs(env_vars)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|e| ExecutionError::CommandFailed(final_line.to_string(), e))?
        }
        Err(e) => {
            return Err(ExecutionError::CommandFailed(final_line.to_string(), e));
        }
    };

    if !status.success() && !ignore_errors {
        return Err(ExecutionError::NonZeroExitStatus(final_line.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn empty_line_is_a_success() {
        let cwd = env::temp_dir();
        assert!(execute_line("   ", &cwd, &HashMap::new()).is_ok());
    }

    #[test]
    fn unparseable_line_is_rejected() {
        let cwd = env::temp_dir();
        let err = execute_line("echo \"unterminated", &cwd, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ExecutionError::CommandParse(_)));
    }

    #[cfg(unix)]
    #[test]
    fn ignore_errors_prefix_tolerates_failure() {
        let cwd = env::temp_dir();
        assert!(execute_line("- false", &cwd, &HashMap::new()).is_ok());
        assert!(matches!(
            execute_line("false", &cwd, &HashMap::new()),
            Err(ExecutionError::NonZeroExitStatus(_))
        ));
    }
}
