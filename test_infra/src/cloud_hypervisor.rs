// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Cloud Hypervisor backend, managed through its HTTP API socket.

use std::fs::File;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use api_client::simple_api_command;
use log::{debug, info, warn};
use serde::Deserialize;
use vmm_sys_util::tempdir::TempDir;
use wait_timeout::ChildExt;

use crate::block::BlockResource;
use crate::console::{Console, SerialConsole};
use crate::domain::{guest_console, Domain, DomainConfig, DomainError, Toolstack, VirtMode};
use crate::process::kill_child;

pub const DEFAULT_CH_BINARY: &str = "cloud-hypervisor";
pub const VMM_START_TIMEOUT: Duration = Duration::from_secs(10);
const VMM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const API_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Answer of `vm.add-disk`.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub id: String,
    pub bdf: String,
}

#[derive(Debug)]
pub struct CloudHypervisor {
    binary: PathBuf,
}

impl CloudHypervisor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        CloudHypervisor {
            binary: binary.into(),
        }
    }
}

impl Default for CloudHypervisor {
    fn default() -> Self {
        Self::new(DEFAULT_CH_BINARY)
    }
}

/// Command line for a VMM serving its API on `api_socket` and exposing the
/// guest serial port on `serial_socket`.
pub fn vmm_args(config: &DomainConfig, api_socket: &Path, serial_socket: &Path) -> Vec<String> {
    let mut args = vec![
        "--api-socket".to_owned(),
        format!("path={}", api_socket.display()),
        "--kernel".to_owned(),
        config.kernel.display().to_string(),
    ];

    if let Some(initramfs) = &config.initramfs {
        args.push("--initramfs".to_owned());
        args.push(initramfs.display().to_string());
    }

    args.push("--cmdline".to_owned());
    args.push(
        config
            .cmdline
            .clone()
            .unwrap_or_else(|| "console=ttyS0".to_owned()),
    );
    args.push("--cpus".to_owned());
    args.push(format!("boot={}", config.vcpus));
    args.push("--memory".to_owned());
    args.push(format!("size={}M", config.memory_mib));

    if let Some(net) = &config.net {
        args.push("--net".to_owned());
        args.push(net.clone());
    }

    args.push("--serial".to_owned());
    args.push(format!("socket={}", serial_socket.display()));
    args.push("--console".to_owned());
    args.push("off".to_owned());
    args
}

impl Toolstack for CloudHypervisor {
    fn name(&self) -> &'static str {
        "cloud-hypervisor"
    }

    // Disks are hot-plugged as virtio-pci devices whatever the guest type.
    fn supports_block_hotplug(&self, _mode: VirtMode) -> bool {
        true
    }

    fn create_domain(&self, config: &DomainConfig) -> Result<Box<dyn Domain>, DomainError> {
        if config.mode != VirtMode::Pv {
            debug!("Ignoring virtualization mode '{}'", config.mode);
        }
        let tmp_dir = TempDir::new_with_prefix("/tmp/blk-hotplug").map_err(|e| {
            DomainError::Prepare(std::io::Error::other(format!("creating temp dir: {e}")))
        })?;

        Ok(Box::new(ChDomain {
            binary: self.binary.clone(),
            config: config.clone(),
            api_socket: tmp_dir.as_path().join("api.sock"),
            serial_socket: tmp_dir.as_path().join("serial.sock"),
            tmp_dir,
            child: None,
        }))
    }
}

pub struct ChDomain {
    binary: PathBuf,
    config: DomainConfig,
    api_socket: PathBuf,
    serial_socket: PathBuf,
    tmp_dir: TempDir,
    child: Option<Child>,
}

impl ChDomain {
    fn api(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<&str>,
    ) -> Result<Option<String>, DomainError> {
        let mut socket = UnixStream::connect(&self.api_socket)
            .map_err(|e| DomainError::Connect(self.api_socket.clone(), e))?;
        simple_api_command(&mut socket, method, endpoint, body)
            .map_err(|e| DomainError::Api(endpoint.to_owned(), e))
    }

    fn ensure_running(&self) -> Result<(), DomainError> {
        if self.child.is_some() {
            Ok(())
        } else {
            Err(DomainError::NotRunning(self.config.name.clone()))
        }
    }

    fn wait_vmm_ready(&mut self) -> Result<(), DomainError> {
        let deadline = Instant::now() + VMM_START_TIMEOUT;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(DomainError::VmmExited(status));
                }
            }

            match self.api("GET", "vmm.ping", None) {
                Ok(version) => {
                    debug!("VMM answered: {}", version.unwrap_or_default());
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    warn!("Last API error: {e}");
                    return Err(DomainError::VmmStartTimeout(VMM_START_TIMEOUT));
                }
                Err(_) => thread::sleep(API_POLL_INTERVAL),
            }
        }
    }

    fn connect_serial(&self) -> Result<SerialConsole, DomainError> {
        let stream = UnixStream::connect(&self.serial_socket)
            .map_err(|e| DomainError::Connect(self.serial_socket.clone(), e))?;
        Ok(SerialConsole::from_stream(stream)?)
    }
}

impl Domain for ChDomain {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<Box<dyn Console>, DomainError> {
        let stdout = File::create(self.tmp_dir.as_path().join("vmm.stdout"))
            .map_err(DomainError::Prepare)?;
        let stderr = File::create(self.tmp_dir.as_path().join("vmm.stderr"))
            .map_err(DomainError::Prepare)?;

        let args = vmm_args(&self.config, &self.api_socket, &self.serial_socket);
        debug!("Spawning {} {}", self.binary.display(), args.join(" "));
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| DomainError::Spawn(self.binary.display().to_string(), e))?;
        self.child = Some(child);

        self.wait_vmm_ready()?;
        info!("Domain '{}' started", self.config.name);

        guest_console(&self.config, || self.connect_serial())
    }

    fn block_attach(&mut self, resource: &BlockResource, device: &str) -> Result<(), DomainError> {
        self.ensure_running()?;
        info!("Attaching {resource} to '{}' as {device}", self.config.name);
        let body = resource
            .ch_disk_config(device)
            .map_err(DomainError::Serialize)?;
        if let Some(response) = self.api("PUT", "vm.add-disk", Some(&body))? {
            match serde_json::from_str::<PciDeviceInfo>(&response) {
                Ok(info) => debug!("Disk '{}' plugged at {}", info.id, info.bdf),
                Err(e) => warn!("Unexpected add-disk response '{response}': {e}"),
            }
        }
        Ok(())
    }

    fn block_detach(&mut self, device: &str) -> Result<(), DomainError> {
        self.ensure_running()?;
        info!("Detaching {device} from '{}'", self.config.name);
        let body = serde_json::json!({ "id": device }).to_string();
        self.api("PUT", "vm.remove-device", Some(&body)).map(|_| ())
    }

    fn stop(&mut self) -> Result<(), DomainError> {
        self.ensure_running()?;
        if let Err(e) = self.api("PUT", "vm.shutdown", None) {
            warn!("vm.shutdown failed: {e}");
        }
        // The VMM may already be gone by the time the answer is due.
        let _ = self.api("PUT", "vmm.shutdown", None);

        if let Some(mut child) = self.child.take() {
            match child.wait_timeout(VMM_SHUTDOWN_TIMEOUT) {
                Ok(Some(status)) => debug!("VMM exited: {status}"),
                _ => {
                    warn!("VMM did not exit on its own, terminating it");
                    kill_child(&mut child);
                }
            }
        }
        info!("Domain '{}' stopped", self.config.name);
        Ok(())
    }
}

impl Drop for ChDomain {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_child(&mut child);
        }
    }
}
