// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Read;
use std::net::TcpStream;
use std::{thread, time::Duration};

use log::{debug, error};
use ssh2::Session;
use thiserror::Error;

use crate::console::{CommandHistory, CommandResult, Console, ConsoleError, HistoryEntry};

pub const DEFAULT_SSH_RETRIES: u8 = 6;
pub const DEFAULT_SSH_TIMEOUT: u8 = 10;

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("ssh connection failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh session creation failed")]
    Session(#[source] ssh2::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh server did not accept the credentials")]
    NotAuthenticated,
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("ssh command failed")]
    Command(#[source] ssh2::Error),
    #[error("reading ssh command output failed")]
    Output(#[source] std::io::Error),
    #[error("retrieving exit status from ssh command failed")]
    ExitStatus(#[source] ssh2::Error),
}

#[derive(Debug, Clone)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl Default for PasswordAuth {
    fn default() -> Self {
        PasswordAuth {
            username: String::from("root"),
            password: String::new(),
        }
    }
}

/// Where and how to reach the guest over SSH.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub ip: String,
    pub auth: PasswordAuth,
    pub retries: u8,
    pub timeout: u8,
}

impl SshTarget {
    pub fn new(ip: &str, auth: PasswordAuth) -> Self {
        SshTarget {
            ip: ip.to_owned(),
            auth,
            retries: DEFAULT_SSH_RETRIES,
            timeout: DEFAULT_SSH_TIMEOUT,
        }
    }
}

/// Run `command` on `ip`. Connection level failures are retried with a
/// linear backoff; the command itself runs once and its exit status is part
/// of the result.
pub fn ssh_command_ip_with_auth(
    command: &str,
    auth: &PasswordAuth,
    ip: &str,
    retries: u8,
    timeout: u8,
) -> Result<CommandResult, SshCommandError> {
    let mut counter = 0;
    loop {
        let closure = || -> Result<CommandResult, SshCommandError> {
            let tcp =
                TcpStream::connect(format!("{ip}:22")).map_err(SshCommandError::Connection)?;
            let mut sess = Session::new().map_err(SshCommandError::Session)?;
            sess.set_tcp_stream(tcp);
            sess.handshake().map_err(SshCommandError::Handshake)?;

            sess.userauth_password(&auth.username, &auth.password)
                .map_err(SshCommandError::Authentication)?;
            if !sess.authenticated() {
                return Err(SshCommandError::NotAuthenticated);
            }

            let mut channel = sess
                .channel_session()
                .map_err(SshCommandError::ChannelSession)?;
            channel
                .exec(&format!("{{ {command} ; }} 2>&1"))
                .map_err(SshCommandError::Command)?;

            let mut output = String::new();
            channel
                .read_to_string(&mut output)
                .map_err(SshCommandError::Output)?;

            // Intentionally ignore these results here as their failure
            // does not precipitate a repeat
            let _ = channel.close();
            let _ = channel.wait_close();

            let return_code = channel.exit_status().map_err(SshCommandError::ExitStatus)?;
            if output.ends_with('\n') {
                output.pop();
            }

            Ok(CommandResult {
                output,
                return_code,
            })
        };

        match closure() {
            Ok(r) => return Ok(r),
            Err(e) => {
                counter += 1;
                if counter >= retries {
                    error!(
                        "\n\n==== Start ssh command output (FAILED) ====\n\n\
                         command=\"{command}\"\n\
                         auth=\"{auth:#?}\"\n\
                         ip=\"{ip}\"\n\
                         error=\"{e:?}\"\n\
                         \n==== End ssh command outout ====\n\n"
                    );

                    return Err(e);
                }
            }
        };
        thread::sleep(Duration::new((timeout as u64) * (counter as u64), 0));
    }
}

/// Console backed by one SSH session per command.
pub struct SshConsole {
    target: SshTarget,
    history: CommandHistory,
    closed: bool,
}

impl SshConsole {
    pub fn new(target: SshTarget) -> Self {
        SshConsole {
            target,
            history: CommandHistory::default(),
            closed: false,
        }
    }
}

impl Console for SshConsole {
    fn run_cmd(&mut self, command: &str) -> Result<CommandResult, ConsoleError> {
        if self.closed {
            return Err(ConsoleError::Closed);
        }

        debug!("ssh {}> {command}", self.target.ip);
        let res = ssh_command_ip_with_auth(
            command,
            &self.target.auth,
            &self.target.ip,
            self.target.retries,
            self.target.timeout,
        );
        self.history.record(command, res.as_ref().ok());
        Ok(res?)
    }

    fn history(&self) -> &[HistoryEntry] {
        self.history.entries()
    }

    fn close(&mut self) -> Result<(), ConsoleError> {
        self.closed = true;
        Ok(())
    }
}
