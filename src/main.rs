// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
mod test_util;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use blk_hotplug::cli_print_error_chain;
use blk_hotplug::config::{RunConfig, RunParams, DEFAULT_TOOLSTACK};
use blk_hotplug::report::{failure_exit_code, failure_summary, Verdict};
use blk_hotplug::scenario::{
    self, DEFAULT_CYCLES, DEFAULT_DEVICE, DEFAULT_MARKER_FILE, DEFAULT_MKFS, DEFAULT_RAMDISK,
};
use clap::{ArgAction, Parser};
use log::{info, LevelFilter};
use test_infra::cloud_hypervisor::DEFAULT_CH_BINARY;
use test_infra::ShellRunner;

/// Hot-plug a block device into a running domain, over and over, and check
/// the guest sees it come and go with its content intact.
#[derive(Debug, Parser)]
#[command(name = "blk-hotplug", version, author)]
struct Cli {
    /// Seconds to wait for the guest shell after the domain is started
    #[arg(long, default_value_t = 120)]
    boot_timeout: u64,

    /// Seconds to wait for a single guest command
    #[arg(long, default_value_t = 60)]
    command_timeout: u64,

    /// Number of attach/detach cycles
    #[arg(long, default_value_t = DEFAULT_CYCLES)]
    cycles: u32,

    /// Device name of the attached disk inside the guest
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Domain parameters "name=<name>,kernel=<path>,initramfs=<path>,
    /// cmdline=<cmdline>,memory=<size>,vcpus=<count>,mode=pv|hvm"
    #[arg(long)]
    domain: Option<String>,

    /// Cloud Hypervisor binary
    #[arg(long, env = "CH_BINARY", default_value = DEFAULT_CH_BINARY)]
    hypervisor_binary: PathBuf,

    /// Name of the file written on the attached disk, right under the mount point
    #[arg(long, default_value = DEFAULT_MARKER_FILE)]
    marker_file: String,

    /// Host command creating the filesystem, the ramdisk path is appended
    #[arg(long, default_value = DEFAULT_MKFS)]
    mkfs: String,

    /// Guest directory the attached disk gets mounted on [default: /mnt/<device>]
    #[arg(long)]
    mount_point: Option<PathBuf>,

    /// Toolstack specific network definition
    #[arg(long)]
    net: Option<String>,

    /// Host ramdisk backing the attached disk
    #[arg(long, default_value = DEFAULT_RAMDISK)]
    ramdisk: PathBuf,

    /// Block resource to attach "phy:<device>" or "file:<path>" [default: phy:<ramdisk>]
    #[arg(long)]
    resource: Option<String>,

    /// Seconds to wait for the guest partition table to reflect a hot-plug
    #[arg(long, default_value_t = 10)]
    settle_timeout: u64,

    /// Reach the guest over SSH "ip=<ip>,user=<user>,password=<password>"
    #[arg(long)]
    ssh: Option<String>,

    /// Toolstack under test: xl or cloud-hypervisor
    #[arg(long, default_value = DEFAULT_TOOLSTACK)]
    toolstack: String,

    /// Increase logging verbosity, repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_params(self) -> RunParams {
        RunParams {
            toolstack: self.toolstack,
            domain: self.domain,
            net: self.net,
            ssh: self.ssh,
            ramdisk: self.ramdisk,
            resource: self.resource,
            device: self.device,
            cycles: self.cycles,
            mount_point: self.mount_point,
            marker_file: self.marker_file,
            mkfs: self.mkfs,
            boot_timeout: self.boot_timeout,
            settle_timeout: self.settle_timeout,
            command_timeout: self.command_timeout,
            hypervisor_binary: self.hypervisor_binary,
            default_kernel: dirs::home_dir().map(|home| home.join("workloads").join("vmlinux")),
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<Verdict> {
    let config = RunConfig::parse(cli.into_params()).context("invalid configuration")?;
    let toolstack = config.toolstack();
    info!(
        "Testing block hot-plug of {} as {} on {} ({} domain)",
        config.scenario.resource,
        config.scenario.device,
        toolstack.name(),
        config.domain.mode
    );

    scenario::run(
        toolstack.as_ref(),
        &ShellRunner,
        &config.domain,
        &config.scenario,
    )
    .context("block hot-plug test failed")
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(verdict) => {
            println!("{verdict}");
            verdict.exit_code()
        }
        Err(e) => {
            println!("{}", failure_summary(e.as_ref()));
            cli_print_error_chain(e.as_ref(), "blk-hotplug");
            failure_exit_code()
        }
    }
}
