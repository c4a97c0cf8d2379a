// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//
#![cfg(devcli_testenv)]

// These tests boot real guests. The guest image is expected to be an
// initramfs whose init mounts /proc and leaves a root shell on the serial
// console.

use std::path::PathBuf;
use std::time::Duration;

use blk_hotplug::report::Verdict;
use blk_hotplug::scenario::{self, HotplugScenario};
use test_infra::host::exec_host_command_status;
use test_infra::*;
use vmm_sys_util::tempdir::TempDir;

const KERNEL_NAME: &str = "vmlinux";
const INITRAMFS_NAME: &str = "hotplug-initramfs.img";
const DISK_SIZE: &str = "64M";

fn workload_path(name: &str) -> PathBuf {
    let mut path = dirs::home_dir().unwrap();
    path.push("workloads");
    path.push(name);
    path
}

fn domain_config(name: &str, console: &str) -> DomainConfig {
    let mut config = DomainConfig::new(name, workload_path(KERNEL_NAME));
    config.initramfs = Some(workload_path(INITRAMFS_NAME));
    config.cmdline = Some(format!("console={console} quiet"));
    config.boot_timeout = Duration::from_secs(60);
    config
}

fn file_backed_scenario(tmp_dir: &TempDir, device: &str, cycles: u32) -> HotplugScenario {
    let image = tmp_dir.as_path().join("disk.raw");
    assert!(
        exec_host_command_status(&format!("truncate -s {DISK_SIZE} {}", image.display()))
            .unwrap()
            .success()
    );

    HotplugScenario {
        resource: BlockResource::File(image.clone()),
        ramdisk: image,
        device: device.to_owned(),
        cycles,
        ..Default::default()
    }
}

#[test]
fn test_block_hotplug_cloud_hypervisor() {
    let tmp_dir = TempDir::new_with_prefix("/tmp/ch").unwrap();
    let binary = std::env::var("CH_BINARY").unwrap_or_else(|_| "cloud-hypervisor".to_owned());
    let scenario = file_backed_scenario(&tmp_dir, "vdb", 10);

    let r = scenario::run(
        &CloudHypervisor::new(binary),
        &ShellRunner,
        &domain_config("ch-hotplug", "ttyS0"),
        &scenario,
    );
    assert_eq!(r.unwrap(), Verdict::Passed);
}

#[test]
fn test_block_hotplug_cloud_hypervisor_wrong_device() {
    let tmp_dir = TempDir::new_with_prefix("/tmp/ch").unwrap();
    let binary = std::env::var("CH_BINARY").unwrap_or_else(|_| "cloud-hypervisor".to_owned());
    let mut scenario = file_backed_scenario(&tmp_dir, "vdz", 1);
    scenario.settle_timeout = Duration::from_secs(3);

    let r = scenario::run(
        &CloudHypervisor::new(binary),
        &ShellRunner,
        &domain_config("ch-hotplug-wrong", "ttyS0"),
        &scenario,
    );
    assert!(matches!(
        r,
        Err(scenario::ScenarioError::DeviceMissing { cycle: 0, .. })
    ));
}

#[test]
fn test_block_hotplug_xl_pv() {
    // /dev/ram1 comes from the brd module.
    assert!(exec_host_command_status("modprobe brd rd_nr=2 rd_size=65536")
        .unwrap()
        .success());

    let r = scenario::run(
        &Xl,
        &ShellRunner,
        &domain_config("xl-hotplug", "hvc0"),
        &HotplugScenario::default(),
    );
    assert_eq!(r.unwrap(), Verdict::Passed);
}

#[test]
fn test_block_hotplug_xl_file_backed() {
    let tmp_dir = TempDir::new_with_prefix("/tmp/xl").unwrap();
    let scenario = file_backed_scenario(&tmp_dir, "xvdb", 3);

    let r = scenario::run(
        &Xl,
        &ShellRunner,
        &domain_config("xl-hotplug-file", "hvc0"),
        &scenario,
    );
    assert_eq!(r.unwrap(), Verdict::Passed);
}
