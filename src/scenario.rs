// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Repeated attach/detach of a ramdisk backed block device, checking the
//! guest partition table and the filesystem content on every cycle.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use test_infra::console::format_history;
use test_infra::partitions::{self, PROC_PARTITIONS_CMD};
use test_infra::{
    BlockResource, CommandResult, Console, ConsoleError, Domain, DomainConfig, DomainError,
    HostError, HostRunner, Toolstack,
};
use thiserror::Error;

use crate::report::Verdict;

pub const DEFAULT_RAMDISK: &str = "/dev/ram1";
pub const DEFAULT_DEVICE: &str = "xvda1";
pub const DEFAULT_CYCLES: u32 = 10;
/// The device gets mounted on a directory named after it under here.
pub const DEFAULT_MOUNT_POINT: &str = "/mnt";
pub const DEFAULT_MARKER_FILE: &str = "myfile";
pub const DEFAULT_MKFS: &str = "mke2fs -q -F";
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("failed to create the test domain")]
    DomainCreate(#[source] DomainError),
    #[error("failed to start the test domain")]
    DomainStart(#[source] DomainError),
    #[error("host command failed")]
    Host(#[from] HostError),
    #[error("'{command}' exited with {status}: {output}")]
    Mkfs {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error("console failure running '{command}'")]
    Console {
        command: String,
        #[source]
        source: ConsoleError,
    },
    #[error("'{command}' returned {return_code}: {output}")]
    GuestCommand {
        command: String,
        return_code: i32,
        output: String,
    },
    #[error("cycle {cycle}: failed to attach block device")]
    Attach {
        cycle: u32,
        #[source]
        source: DomainError,
    },
    #[error("cycle {cycle}: failed to detach block device")]
    Detach {
        cycle: u32,
        #[source]
        source: DomainError,
    },
    #[error("cycle {cycle}: {device} missing from /proc/partitions after attach:\n{listing}")]
    DeviceMissing {
        cycle: u32,
        device: String,
        listing: String,
    },
    #[error("cycle {cycle}: {device} still in /proc/partitions after detach:\n{listing}")]
    DeviceStillPresent {
        cycle: u32,
        device: String,
        listing: String,
    },
    #[error("cycle {cycle}: file created was lost, expected '{expected}': {output}")]
    MarkerLost {
        cycle: u32,
        expected: String,
        output: String,
    },
    #[error("cycle {cycle}: file was not updated, expected '{expected}', found '{found}'")]
    MarkerMismatch {
        cycle: u32,
        expected: String,
        found: String,
    },
    #[error("failed to close the console")]
    ConsoleClose(#[source] ConsoleError),
    #[error("failed to stop the test domain")]
    DomainStop(#[source] DomainError),
}

/// What gets plugged where, and how often.
#[derive(Debug, Clone)]
pub struct HotplugScenario {
    /// Host ramdisk that gets the filesystem.
    pub ramdisk: PathBuf,
    /// Resource handed to the toolstack, normally backed by `ramdisk`.
    pub resource: BlockResource,
    /// Device name as seen by the guest.
    pub device: String,
    pub cycles: u32,
    pub mount_point: PathBuf,
    pub marker_file: String,
    /// Host command making a filesystem, the ramdisk path is appended.
    pub mkfs: String,
    pub settle_timeout: Duration,
    pub settle_interval: Duration,
}

impl Default for HotplugScenario {
    fn default() -> Self {
        let ramdisk = PathBuf::from(DEFAULT_RAMDISK);
        HotplugScenario {
            resource: BlockResource::Phy(ramdisk.clone()),
            ramdisk,
            device: DEFAULT_DEVICE.to_owned(),
            cycles: DEFAULT_CYCLES,
            mount_point: Path::new(DEFAULT_MOUNT_POINT).join(DEFAULT_DEVICE),
            marker_file: DEFAULT_MARKER_FILE.to_owned(),
            mkfs: DEFAULT_MKFS.to_owned(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            settle_interval: SETTLE_INTERVAL,
        }
    }
}

impl HotplugScenario {
    fn marker_path(&self) -> PathBuf {
        self.mount_point.join(&self.marker_file)
    }
}

/// Run `command` in the guest, a nonzero return code fails the test.
fn guest_command(
    console: &mut dyn Console,
    command: &str,
) -> Result<CommandResult, ScenarioError> {
    let result = console
        .run_cmd(command)
        .map_err(|source| ScenarioError::Console {
            command: command.to_owned(),
            source,
        })?;
    if !result.success() {
        return Err(ScenarioError::GuestCommand {
            command: command.to_owned(),
            return_code: result.return_code,
            output: result.output,
        });
    }
    Ok(result)
}

/// Poll the guest partition table until `device` is listed (or gone, when
/// `present` is false). Hot-plug completes asynchronously in the guest.
fn wait_partition(
    console: &mut dyn Console,
    scenario: &HotplugScenario,
    cycle: u32,
    present: bool,
) -> Result<(), ScenarioError> {
    let deadline = Instant::now() + scenario.settle_timeout;
    loop {
        let listing = guest_command(console, PROC_PARTITIONS_CMD)?.output;
        if partitions::contains(&listing, &scenario.device) == present {
            return Ok(());
        }

        if Instant::now() >= deadline {
            let device = scenario.device.clone();
            return Err(if present {
                ScenarioError::DeviceMissing {
                    cycle,
                    device,
                    listing,
                }
            } else {
                ScenarioError::DeviceStillPresent {
                    cycle,
                    device,
                    listing,
                }
            });
        }
        thread::sleep(scenario.settle_interval);
    }
}

fn format_ramdisk(host: &dyn HostRunner, scenario: &HotplugScenario) -> Result<(), ScenarioError> {
    let command = format!("{} {}", scenario.mkfs, scenario.ramdisk.display());
    info!("Creating filesystem: {command}");
    let out = host.run(&command)?;
    if !out.success() {
        return Err(ScenarioError::Mkfs {
            command,
            status: out.status,
            output: out.output.trim().to_owned(),
        });
    }
    Ok(())
}

fn run_cycle(
    domain: &mut dyn Domain,
    console: &mut dyn Console,
    scenario: &HotplugScenario,
    cycle: u32,
) -> Result<(), ScenarioError> {
    let device = scenario.device.as_str();
    let mount_point = scenario.mount_point.display();
    let marker = scenario.marker_path();
    let marker = marker.display();

    domain
        .block_attach(&scenario.resource, device)
        .map_err(|source| ScenarioError::Attach { cycle, source })?;
    wait_partition(console, scenario, cycle, true)?;

    guest_command(
        console,
        &format!("mkdir -p {mount_point} && mount /dev/{device} {mount_point}"),
    )?;

    if cycle > 0 {
        let expected = (cycle - 1).to_string();
        let r = console
            .run_cmd(&format!("cat {marker}"))
            .map_err(|source| ScenarioError::Console {
                command: format!("cat {marker}"),
                source,
            })?;
        if !r.success() {
            return Err(ScenarioError::MarkerLost {
                cycle,
                expected,
                output: r.output,
            });
        }
        if r.output.trim() != expected {
            return Err(ScenarioError::MarkerMismatch {
                cycle,
                expected,
                found: r.output.trim().to_owned(),
            });
        }
    }

    guest_command(console, &format!("echo {cycle} > {marker}"))?;
    let r = guest_command(console, &format!("cat {marker}"))?;
    debug!("{marker} now holds '{}'", r.output.trim());
    guest_command(console, &format!("umount {mount_point}"))?;

    domain
        .block_detach(device)
        .map_err(|source| ScenarioError::Detach { cycle, source })?;
    wait_partition(console, scenario, cycle, false)
}

fn exercise(
    domain: &mut dyn Domain,
    console: &mut dyn Console,
    host: &dyn HostRunner,
    scenario: &HotplugScenario,
) -> Result<(), ScenarioError> {
    guest_command(console, "ls")?;
    format_ramdisk(host, scenario)?;

    for cycle in 0..scenario.cycles {
        info!(
            "Cycle {}/{}: {} as {}",
            cycle + 1,
            scenario.cycles,
            scenario.resource,
            scenario.device
        );
        run_cycle(domain, console, scenario, cycle)?;
    }
    Ok(())
}

/// Run the whole test against a domain built from `domain_config`.
pub fn run(
    toolstack: &dyn Toolstack,
    host: &dyn HostRunner,
    domain_config: &DomainConfig,
    scenario: &HotplugScenario,
) -> Result<Verdict, ScenarioError> {
    if !toolstack.supports_block_hotplug(domain_config.mode) {
        let reason = format!(
            "block hot-plug is not supported for {} domains on {}",
            domain_config.mode,
            toolstack.name()
        );
        info!("Skipping: {reason}");
        return Ok(Verdict::Skipped(reason));
    }

    let mut domain = toolstack
        .create_domain(domain_config)
        .map_err(ScenarioError::DomainCreate)?;
    info!("Starting domain '{}' with {}", domain.name(), toolstack.name());
    let mut console = domain.start().map_err(ScenarioError::DomainStart)?;

    if let Err(e) = exercise(domain.as_mut(), console.as_mut(), host, scenario) {
        error!("Test failed: {e}");
        error!(
            "\n\n==== Start console history ====\n\n{}\n==== End console history ====\n",
            format_history(console.history())
        );
        return Err(e);
    }

    console.close().map_err(ScenarioError::ConsoleClose)?;
    domain.stop().map_err(ScenarioError::DomainStop)?;
    info!(
        "{} attach/detach cycles of {} completed",
        scenario.cycles, scenario.device
    );
    Ok(Verdict::Passed)
}
