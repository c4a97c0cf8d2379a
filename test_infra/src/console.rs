// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Interactive access to a shell running inside the guest.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::process::Child;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::process::kill_child;
use crate::ssh::SshCommandError;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

// Markers are printed by the guest shell from two halves so that the tty echo
// of the typed command line never contains the joined marker.
const MARKER_HEAD: &str = "@@BLKHP";

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("failed to set up console polling")]
    Epoll(#[source] io::Error),
    #[error("failed to write to the console")]
    Write(#[source] io::Error),
    #[error("failed to read from the console")]
    Read(#[source] io::Error),
    #[error("timed out after {0:?} waiting for the result of '{1}'")]
    Timeout(Duration, String),
    #[error("console closed by the remote end")]
    Closed,
    #[error("malformed return code in console output: {0}")]
    MalformedReturnCode(String),
    #[error("guest shell did not answer within {0:?}")]
    NotReady(Duration),
    #[error("ssh command failed")]
    Ssh(#[from] SshCommandError),
}

/// Output and return code of one guest command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
    pub return_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub command: String,
    /// `None` when the console failed before a result came back.
    pub result: Option<CommandResult>,
}

#[derive(Debug, Default)]
pub struct CommandHistory {
    entries: Vec<HistoryEntry>,
}

impl CommandHistory {
    pub fn record(&mut self, command: &str, result: Option<&CommandResult>) {
        self.entries.push(HistoryEntry {
            command: command.to_owned(),
            result: result.cloned(),
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }
}

/// Render a history for failure reports.
pub fn format_history(entries: &[HistoryEntry]) -> String {
    let mut s = String::new();
    for e in entries {
        s.push_str(&format!("$ {}\n", e.command));
        match &e.result {
            Some(r) => {
                if !r.output.is_empty() {
                    s.push_str(&r.output);
                    s.push('\n');
                }
                s.push_str(&format!("[rc={}]\n", r.return_code));
            }
            None => s.push_str("[no result]\n"),
        }
    }
    s
}

pub trait Console {
    /// Run `command` through the guest shell. A nonzero return code is not an
    /// error, it is reported in the result.
    fn run_cmd(&mut self, command: &str) -> Result<CommandResult, ConsoleError>;

    fn history(&self) -> &[HistoryEntry];

    fn close(&mut self) -> Result<(), ConsoleError>;
}

pub trait ConsoleReader: Read + AsRawFd {}
impl<T: Read + AsRawFd> ConsoleReader for T {}

/// Console over a raw byte stream attached to a guest shell, such as the
/// stdio of `xl console` or a serial port exposed on a Unix socket.
pub struct SerialConsole {
    reader: Box<dyn ConsoleReader>,
    writer: Box<dyn Write>,
    transport: Option<Child>,
    epoll_file: File,
    pending: Vec<u8>,
    sequence: u32,
    timeout: Duration,
    history: CommandHistory,
    closed: bool,
}

impl SerialConsole {
    pub fn new(
        reader: Box<dyn ConsoleReader>,
        writer: Box<dyn Write>,
    ) -> Result<Self, ConsoleError> {
        let epoll_fd = epoll::create(true).map_err(ConsoleError::Epoll)?;
        // SAFETY: epoll_fd was just created and is owned by nothing else.
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };
        epoll::ctl(
            epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            reader.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, 0),
        )
        .map_err(ConsoleError::Epoll)?;

        Ok(SerialConsole {
            reader,
            writer,
            transport: None,
            epoll_file,
            pending: Vec::new(),
            sequence: 0,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            history: CommandHistory::default(),
            closed: false,
        })
    }

    pub fn from_stream(stream: UnixStream) -> Result<Self, ConsoleError> {
        let writer = stream.try_clone().map_err(ConsoleError::Write)?;
        Self::new(Box::new(stream), Box::new(writer))
    }

    /// Use the stdio of `child` as transport. The child is terminated when
    /// the console is closed.
    pub fn from_child(mut child: Child) -> Result<Self, ConsoleError> {
        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(ConsoleError::Closed);
        };
        let mut console = Self::new(Box::new(stdout), Box::new(stdin))?;
        console.transport = Some(child);
        Ok(console)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Keep probing the shell until it answers or `timeout` expires.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), ConsoleError> {
        let deadline = Instant::now() + timeout;
        let probe_timeout = Duration::from_secs(2).min(timeout);
        loop {
            match self.exchange("true", probe_timeout) {
                Ok(r) if r.success() => {
                    info!("Guest shell is ready");
                    return Ok(());
                }
                Ok(_) | Err(ConsoleError::Timeout(..)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(ConsoleError::NotReady(timeout));
            }
        }
    }

    /// Keep kernel messages off the console so they do not interleave with
    /// command output.
    pub fn quiet_kernel(&mut self) -> Result<(), ConsoleError> {
        let r = self.run_cmd("dmesg -n 1")?;
        if !r.success() {
            warn!("Could not lower the guest console log level: {}", r.output);
        }
        Ok(())
    }

    fn framed(sequence: u32, command: &str) -> String {
        let command = command.trim().trim_end_matches(';');
        format!(
            "printf '\\n%s%s\\n' '{MARKER_HEAD}' 'B{sequence}@@'; {{ {command} ; }} 2>&1; \
             printf '\\n%s%s %d\\n' '{MARKER_HEAD}' 'E{sequence}@@' \"$?\"\n"
        )
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool, ConsoleError> {
        let mut events = [epoll::Event::new(epoll::Events::empty(), 0); 1];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            match epoll::wait(self.epoll_file.as_raw_fd(), timeout_ms, &mut events[..]) {
                Ok(n) => return Ok(n > 0),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(ConsoleError::Read(e)),
            }
        }
    }

    fn read_line(
        &mut self,
        deadline: Instant,
        timeout: Duration,
        command: &str,
    ) -> Result<String, ConsoleError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..pos]);
                return Ok(line.replace('\r', ""));
            }

            let now = Instant::now();
            if now >= deadline || !self.wait_readable(deadline - now)? {
                return Err(ConsoleError::Timeout(timeout, command.to_owned()));
            }

            let count = match self.reader.read(&mut buf) {
                Ok(0) => return Err(ConsoleError::Closed),
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConsoleError::Read(e)),
            };
            self.pending.extend_from_slice(&buf[..count]);
        }
    }

    fn exchange(&mut self, command: &str, timeout: Duration) -> Result<CommandResult, ConsoleError> {
        if self.closed {
            return Err(ConsoleError::Closed);
        }

        self.sequence += 1;
        let begin = format!("{MARKER_HEAD}B{}@@", self.sequence);
        let end = format!("{MARKER_HEAD}E{}@@ ", self.sequence);

        self.writer
            .write_all(Self::framed(self.sequence, command).as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(ConsoleError::Write)?;

        let deadline = Instant::now() + timeout;
        while !self
            .read_line(deadline, timeout, command)?
            .contains(&begin)
        {}

        let mut lines = Vec::new();
        loop {
            let line = self.read_line(deadline, timeout, command)?;
            if let Some(pos) = line.find(&end) {
                let code = line[pos + end.len()..].trim();
                let return_code = code
                    .parse()
                    .map_err(|_| ConsoleError::MalformedReturnCode(line.clone()))?;
                let mut output = lines.join("\n");
                if output.ends_with('\n') {
                    output.pop();
                }
                return Ok(CommandResult {
                    output,
                    return_code,
                });
            }
            lines.push(line);
        }
    }
}

impl Console for SerialConsole {
    fn run_cmd(&mut self, command: &str) -> Result<CommandResult, ConsoleError> {
        debug!("console> {command}");
        let res = self.exchange(command, self.timeout);
        self.history.record(command, res.as_ref().ok());
        let res = res?;
        debug!("console< [rc={}] {}", res.return_code, res.output);
        Ok(res)
    }

    fn history(&self) -> &[HistoryEntry] {
        self.history.entries()
    }

    fn close(&mut self) -> Result<(), ConsoleError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut child) = self.transport.take() {
            kill_child(&mut child);
        }
        Ok(())
    }
}

impl Drop for SerialConsole {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
