// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Xen backend driven through the `xl` toolstack.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use vmm_sys_util::tempdir::TempDir;

use crate::block::BlockResource;
use crate::console::{Console, SerialConsole};
use crate::domain::{guest_console, Domain, DomainConfig, DomainError, Toolstack, VirtMode};

pub const XL_BINARY: &str = "xl";

fn xl(args: &[&str]) -> Result<String, DomainError> {
    let command = format!("{XL_BINARY} {}", args.join(" "));
    debug!("Running {command}");
    let output = Command::new(XL_BINARY)
        .args(args)
        .output()
        .map_err(|e| DomainError::Spawn(command.clone(), e))?;

    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if output.status.success() {
        Ok(text)
    } else {
        Err(DomainError::ToolstackCommand {
            command,
            status: output.status,
            output: text.trim().to_owned(),
        })
    }
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Domain configuration file in `xl.cfg` syntax.
pub fn render_xl_config(config: &DomainConfig) -> String {
    let mut cfg = vec![
        format!("name = {}", quoted(&config.name)),
        format!("type = {}", quoted(&config.mode.to_string())),
        format!("memory = {}", config.memory_mib),
        format!("vcpus = {}", config.vcpus),
        format!("kernel = {}", quoted(&config.kernel.to_string_lossy())),
    ];

    if let Some(initramfs) = &config.initramfs {
        cfg.push(format!("ramdisk = {}", quoted(&initramfs.to_string_lossy())));
    }

    let default_cmdline = match config.mode {
        VirtMode::Pv => "console=hvc0",
        VirtMode::Hvm => "console=ttyS0",
    };
    cfg.push(format!(
        "cmdline = {}",
        quoted(config.cmdline.as_deref().unwrap_or(default_cmdline))
    ));

    if config.mode == VirtMode::Hvm {
        cfg.push(format!("serial = {}", quoted("pty")));
    }
    if let Some(net) = &config.net {
        cfg.push(format!("vif = [ {} ]", quoted(net)));
    }

    cfg.push(format!("on_crash = {}", quoted("destroy")));
    cfg.push(String::new());
    cfg.join("\n")
}

#[derive(Debug, Default)]
pub struct Xl;

impl Toolstack for Xl {
    fn name(&self) -> &'static str {
        "xl"
    }

    // Block hot-plug goes through the PV block frontend, which HVM guests
    // without PV drivers do not have.
    fn supports_block_hotplug(&self, mode: VirtMode) -> bool {
        mode == VirtMode::Pv
    }

    fn create_domain(&self, config: &DomainConfig) -> Result<Box<dyn Domain>, DomainError> {
        let tmp_dir = TempDir::new_with_prefix("/tmp/blk-hotplug").map_err(|e| {
            DomainError::Prepare(std::io::Error::other(format!("creating temp dir: {e}")))
        })?;
        let config_path = tmp_dir.as_path().join(format!("{}.cfg", config.name));
        fs::write(&config_path, render_xl_config(config)).map_err(DomainError::Prepare)?;
        debug!("Wrote xl config to {}", config_path.display());

        Ok(Box::new(XlDomain {
            config: config.clone(),
            config_path,
            _tmp_dir: tmp_dir,
            running: false,
        }))
    }
}

pub struct XlDomain {
    config: DomainConfig,
    config_path: PathBuf,
    _tmp_dir: TempDir,
    running: bool,
}

impl XlDomain {
    fn ensure_running(&self) -> Result<(), DomainError> {
        if self.running {
            Ok(())
        } else {
            Err(DomainError::NotRunning(self.config.name.clone()))
        }
    }

    fn spawn_console(&self) -> Result<SerialConsole, DomainError> {
        let mut cmd = Command::new(XL_BINARY);
        cmd.arg("console");
        if self.config.mode == VirtMode::Hvm {
            cmd.args(["-t", "serial"]);
        }
        cmd.arg(&self.config.name);

        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DomainError::Spawn(format!("{cmd:?}"), e))?;

        Ok(SerialConsole::from_child(child)?)
    }
}

impl Domain for XlDomain {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn start(&mut self) -> Result<Box<dyn Console>, DomainError> {
        let config_path = self.config_path.to_string_lossy().into_owned();
        xl(&["create", &config_path])?;
        self.running = true;
        info!("Domain '{}' created", self.config.name);

        guest_console(&self.config, || self.spawn_console())
    }

    fn block_attach(&mut self, resource: &BlockResource, device: &str) -> Result<(), DomainError> {
        self.ensure_running()?;
        let spec = resource.xl_disk_spec(device);
        info!("Attaching {resource} to '{}' as {device}", self.config.name);
        xl(&["block-attach", &self.config.name, &spec]).map(|_| ())
    }

    fn block_detach(&mut self, device: &str) -> Result<(), DomainError> {
        self.ensure_running()?;
        info!("Detaching {device} from '{}'", self.config.name);
        xl(&["block-detach", &self.config.name, device]).map(|_| ())
    }

    fn stop(&mut self) -> Result<(), DomainError> {
        self.ensure_running()?;
        xl(&["destroy", &self.config.name])?;
        self.running = false;
        info!("Domain '{}' destroyed", self.config.name);
        Ok(())
    }
}

impl Drop for XlDomain {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = xl(&["destroy", &self.config.name]) {
                warn!("Failed to destroy domain '{}': {e}", self.config.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pv_config() {
        let mut config = DomainConfig::new("hotplug-test", PathBuf::from("/boot/vmlinuz"));
        config.initramfs = Some(PathBuf::from("/boot/initrd.img"));

        assert_eq!(
            render_xl_config(&config),
            "name = \"hotplug-test\"\n\
             type = \"pv\"\n\
             memory = 256\n\
             vcpus = 1\n\
             kernel = \"/boot/vmlinuz\"\n\
             ramdisk = \"/boot/initrd.img\"\n\
             cmdline = \"console=hvc0\"\n\
             on_crash = \"destroy\"\n"
        );
    }

    #[test]
    fn test_render_hvm_config() {
        let mut config = DomainConfig::new("hvm0", PathBuf::from("/boot/vmlinuz"));
        config.mode = VirtMode::Hvm;
        config.cmdline = Some("console=ttyS0 root=\"/dev/xvda\"".to_owned());
        config.net = Some("bridge=xenbr0".to_owned());

        let cfg = render_xl_config(&config);
        assert!(cfg.contains("type = \"hvm\"\n"));
        assert!(cfg.contains("cmdline = \"console=ttyS0 root=\\\"/dev/xvda\\\"\"\n"));
        assert!(cfg.contains("serial = \"pty\"\n"));
        assert!(cfg.contains("vif = [ \"bridge=xenbr0\" ]\n"));
        assert!(!cfg.contains("ramdisk"));
    }

    #[test]
    fn test_block_hotplug_support() {
        assert!(Xl.supports_block_hotplug(VirtMode::Pv));
        assert!(!Xl.supports_block_hotplug(VirtMode::Hvm));
    }

    #[test]
    fn test_create_domain_writes_config() {
        let config = DomainConfig::new("cfg-test", PathBuf::from("/boot/vmlinuz"));
        let domain = Xl.create_domain(&config).unwrap();
        assert_eq!(domain.name(), "cfg-test");
    }
}
