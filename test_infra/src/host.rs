// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::{Command, ExitStatus};

use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to spawn '{0}'")]
    Spawn(String, #[source] std::io::Error),
}

/// Exit status and combined stdout/stderr of a host command.
#[derive(Debug, Clone)]
pub struct HostOutput {
    pub status: ExitStatus,
    pub output: String,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs commands on the host side of the test.
pub trait HostRunner {
    fn run(&self, command: &str) -> Result<HostOutput, HostError>;
}

/// Runs each command through `bash -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl HostRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<HostOutput, HostError> {
        exec_host_command_output(command)
    }
}

pub fn exec_host_command_output(command: &str) -> Result<HostOutput, HostError> {
    debug!("Running host command: {command}");
    let output = Command::new("bash")
        .args(["-c", command])
        .output()
        .map_err(|e| HostError::Spawn(command.to_owned(), e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        warn!(
            "\n\n==== Start 'exec_host_command' failed ({command}) ==== \
            \n\n---stdout---\n{stdout}\n---stderr---{stderr} \
            \n\n==== End 'exec_host_command' failed ====",
        );
    }

    Ok(HostOutput {
        status: output.status,
        output: format!("{stdout}{stderr}"),
    })
}

pub fn exec_host_command_status(command: &str) -> Result<ExitStatus, HostError> {
    exec_host_command_output(command).map(|o| o.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_host_command() {
        let out = ShellRunner.run("echo hello; echo oops >&2").unwrap();
        assert!(out.success());
        assert_eq!(out.output, "hello\noops\n");

        let out = ShellRunner.run("exit 3").unwrap();
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));

        assert!(!exec_host_command_status("false").unwrap().success());
    }
}
