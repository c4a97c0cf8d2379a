// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Domain lifecycle and block hot-plug, independent of the toolstack.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::str::FromStr;
use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::block::BlockResource;
use crate::console::{Console, ConsoleError, SerialConsole, DEFAULT_COMMAND_TIMEOUT};
use crate::ssh::{SshConsole, SshTarget};

pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MEMORY_MIB: u64 = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VirtMode {
    /// Paravirtualized guest.
    #[default]
    Pv,
    /// Fully virtualized guest.
    Hvm,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid virtualization mode '{0}', expected 'pv' or 'hvm'")]
pub struct VirtModeParseError(String);

impl FromStr for VirtMode {
    type Err = VirtModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pv" => Ok(VirtMode::Pv),
            "hvm" => Ok(VirtMode::Hvm),
            _ => Err(VirtModeParseError(s.to_owned())),
        }
    }
}

impl fmt::Display for VirtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtMode::Pv => write!(f, "pv"),
            VirtMode::Hvm => write!(f, "hvm"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: String,
    pub kernel: PathBuf,
    pub initramfs: Option<PathBuf>,
    pub cmdline: Option<String>,
    pub memory_mib: u64,
    pub vcpus: u8,
    pub mode: VirtMode,
    /// Toolstack specific network definition, passed through untouched.
    pub net: Option<String>,
    /// Reach the guest shell over SSH instead of the serial console.
    pub ssh: Option<SshTarget>,
    pub boot_timeout: Duration,
    pub command_timeout: Duration,
}

impl DomainConfig {
    pub fn new(name: &str, kernel: PathBuf) -> Self {
        DomainConfig {
            name: name.to_owned(),
            kernel,
            initramfs: None,
            cmdline: None,
            memory_mib: DEFAULT_MEMORY_MIB,
            vcpus: 1,
            mode: VirtMode::default(),
            net: None,
            ssh: None,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("failed to prepare domain files")]
    Prepare(#[source] std::io::Error),
    #[error("failed to spawn '{0}'")]
    Spawn(String, #[source] std::io::Error),
    #[error("'{command}' exited with {status}: {output}")]
    ToolstackCommand {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error("console failure")]
    Console(#[from] ConsoleError),
    #[error("failed to serialize the API request body")]
    Serialize(#[source] serde_json::Error),
    #[error("API request '{0}' failed")]
    Api(String, #[source] api_client::Error),
    #[error("failed to connect to '{0}'")]
    Connect(PathBuf, #[source] std::io::Error),
    #[error("VMM did not answer on its API socket within {0:?}")]
    VmmStartTimeout(Duration),
    #[error("VMM exited unexpectedly: {0}")]
    VmmExited(ExitStatus),
    #[error("domain '{0}' is not running")]
    NotRunning(String),
}

/// A running (or about to run) virtual machine.
pub trait Domain {
    fn name(&self) -> &str;

    /// Launch the domain and return its console once the guest shell
    /// answers.
    fn start(&mut self) -> Result<Box<dyn Console>, DomainError>;

    /// Attach `resource` to the guest as `device`.
    fn block_attach(&mut self, resource: &BlockResource, device: &str) -> Result<(), DomainError>;

    fn block_detach(&mut self, device: &str) -> Result<(), DomainError>;

    fn stop(&mut self) -> Result<(), DomainError>;
}

/// Host side management interface of the platform under test.
pub trait Toolstack {
    fn name(&self) -> &'static str;

    fn supports_block_hotplug(&self, mode: VirtMode) -> bool;

    fn create_domain(&self, config: &DomainConfig) -> Result<Box<dyn Domain>, DomainError>;
}

/// Wait for the guest shell behind `serial`, or for SSH when the domain is
/// configured for it.
pub(crate) fn guest_console(
    config: &DomainConfig,
    serial: impl FnOnce() -> Result<SerialConsole, DomainError>,
) -> Result<Box<dyn Console>, DomainError> {
    if let Some(target) = &config.ssh {
        info!("Using SSH console to {}", target.ip);
        let mut console = SshConsole::new(target.clone());
        // The retries of the SSH helper cover the boot time.
        console.run_cmd("true")?;
        return Ok(Box::new(console));
    }

    let mut console = serial()?.with_timeout(config.command_timeout);
    info!(
        "Waiting up to {:?} for the guest shell of '{}'",
        config.boot_timeout, config.name
    );
    console.wait_ready(config.boot_timeout)?;
    console.quiet_kernel()?;
    Ok(Box::new(console))
}
