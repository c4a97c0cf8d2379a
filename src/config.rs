// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use option_parser::{ByteSized, OptionParser, OptionParserError};
use test_infra::cloud_hypervisor::DEFAULT_CH_BINARY;
use test_infra::domain::{DEFAULT_BOOT_TIMEOUT, DEFAULT_MEMORY_MIB};
use test_infra::ssh::{PasswordAuth, SshTarget};
use test_infra::{
    BlockResource, BlockResourceError, CloudHypervisor, DomainConfig, Toolstack, VirtMode, Xl,
};
use thiserror::Error;

use crate::scenario::{
    HotplugScenario, DEFAULT_CYCLES, DEFAULT_DEVICE, DEFAULT_MARKER_FILE, DEFAULT_MKFS,
    DEFAULT_MOUNT_POINT, DEFAULT_RAMDISK, DEFAULT_SETTLE_TIMEOUT, SETTLE_INTERVAL,
};

pub const DEFAULT_DOMAIN_NAME: &str = "hotplug-test";
pub const DEFAULT_TOOLSTACK: &str = "xl";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown toolstack '{0}', expected 'xl' or 'cloud-hypervisor'")]
    UnknownToolstack(String),
    #[error("error parsing --domain")]
    ParseDomain(#[source] OptionParserError),
    #[error("error parsing --ssh")]
    ParseSsh(#[source] OptionParserError),
    #[error("no kernel given and no default kernel available")]
    MissingKernel,
    #[error("domain memory must be at least 1M")]
    InvalidMemory,
    #[error("domain needs at least one vCPU")]
    InvalidVcpus,
    #[error("invalid block resource")]
    InvalidResource(#[source] BlockResourceError),
    #[error("block resource '{resource}' is not backed by ramdisk '{}'", .ramdisk.display())]
    ResourceMismatch {
        resource: BlockResource,
        ramdisk: PathBuf,
    },
    #[error("cycle count must be at least 1")]
    InvalidCycles,
    #[error("invalid guest device name '{0}'")]
    InvalidDevice(String),
    #[error("mount point '{}' is not an absolute path without whitespace", .0.display())]
    InvalidMountPoint(PathBuf),
    #[error("invalid marker file name '{0}'")]
    InvalidMarkerFile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolstackKind {
    Xl,
    CloudHypervisor,
}

impl FromStr for ToolstackKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xl" => Ok(ToolstackKind::Xl),
            "cloud-hypervisor" | "ch" => Ok(ToolstackKind::CloudHypervisor),
            _ => Err(ConfigError::UnknownToolstack(s.to_owned())),
        }
    }
}

/// Unvalidated run parameters, as given on the command line.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub toolstack: String,
    pub domain: Option<String>,
    pub net: Option<String>,
    pub ssh: Option<String>,
    pub ramdisk: PathBuf,
    pub resource: Option<String>,
    pub device: String,
    pub cycles: u32,
    /// Defaults to `/mnt/<device>`.
    pub mount_point: Option<PathBuf>,
    pub marker_file: String,
    pub mkfs: String,
    pub boot_timeout: u64,
    pub settle_timeout: u64,
    pub command_timeout: u64,
    pub hypervisor_binary: PathBuf,
    /// Kernel used when `--domain` does not name one.
    pub default_kernel: Option<PathBuf>,
}

impl Default for RunParams {
    fn default() -> Self {
        RunParams {
            toolstack: DEFAULT_TOOLSTACK.to_owned(),
            domain: None,
            net: None,
            ssh: None,
            ramdisk: PathBuf::from(DEFAULT_RAMDISK),
            resource: None,
            device: DEFAULT_DEVICE.to_owned(),
            cycles: DEFAULT_CYCLES,
            mount_point: None,
            marker_file: DEFAULT_MARKER_FILE.to_owned(),
            mkfs: DEFAULT_MKFS.to_owned(),
            boot_timeout: DEFAULT_BOOT_TIMEOUT.as_secs(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT.as_secs(),
            command_timeout: test_infra::console::DEFAULT_COMMAND_TIMEOUT.as_secs(),
            hypervisor_binary: PathBuf::from(DEFAULT_CH_BINARY),
            default_kernel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub toolstack: ToolstackKind,
    pub hypervisor_binary: PathBuf,
    pub domain: DomainConfig,
    pub scenario: HotplugScenario,
}

fn parse_domain(params: &RunParams) -> Result<DomainConfig, ConfigError> {
    let mut parser = OptionParser::new();
    parser
        .add("name")
        .add("kernel")
        .add("initramfs")
        .add("cmdline")
        .add("memory")
        .add("vcpus")
        .add("mode");
    parser
        .parse(params.domain.as_deref().unwrap_or_default())
        .map_err(ConfigError::ParseDomain)?;

    let name = parser
        .get("name")
        .unwrap_or_else(|| DEFAULT_DOMAIN_NAME.to_owned());
    let kernel = parser
        .get("kernel")
        .map(PathBuf::from)
        .or_else(|| params.default_kernel.clone())
        .ok_or(ConfigError::MissingKernel)?;

    let mut config = DomainConfig::new(&name, kernel);
    config.initramfs = parser.get("initramfs").map(PathBuf::from);
    config.cmdline = parser.get("cmdline");

    config.memory_mib = parser
        .convert::<ByteSized>("memory")
        .map_err(ConfigError::ParseDomain)?
        .map(|ByteSized(bytes)| bytes >> 20)
        .unwrap_or(DEFAULT_MEMORY_MIB);
    if config.memory_mib == 0 {
        return Err(ConfigError::InvalidMemory);
    }

    config.vcpus = parser
        .convert("vcpus")
        .map_err(ConfigError::ParseDomain)?
        .unwrap_or(1);
    if config.vcpus == 0 {
        return Err(ConfigError::InvalidVcpus);
    }

    config.mode = parser
        .convert::<VirtMode>("mode")
        .map_err(ConfigError::ParseDomain)?
        .unwrap_or_default();

    config.net = params.net.clone();
    config.ssh = params.ssh.as_deref().map(parse_ssh).transpose()?;
    config.boot_timeout = Duration::from_secs(params.boot_timeout);
    config.command_timeout = Duration::from_secs(params.command_timeout);
    Ok(config)
}

fn parse_ssh(ssh: &str) -> Result<SshTarget, ConfigError> {
    let mut parser = OptionParser::new();
    parser.add("ip").add("user").add("password");
    parser.parse(ssh).map_err(ConfigError::ParseSsh)?;

    let ip = parser.require("ip").map_err(ConfigError::ParseSsh)?;
    let mut auth = PasswordAuth::default();
    if let Some(user) = parser.get("user") {
        auth.username = user;
    }
    if let Some(password) = parser.get("password") {
        auth.password = password;
    }
    Ok(SshTarget::new(&ip, auth))
}

fn check_device(device: &str) -> Result<(), ConfigError> {
    if device.is_empty() || device.contains('/') || device.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidDevice(device.to_owned()));
    }
    Ok(())
}

fn check_mount_point(mount_point: &Path) -> Result<(), ConfigError> {
    let has_whitespace = mount_point
        .to_str()
        .is_none_or(|p| p.contains(char::is_whitespace));
    if !mount_point.is_absolute() || has_whitespace {
        return Err(ConfigError::InvalidMountPoint(mount_point.to_owned()));
    }
    Ok(())
}

// The marker has to live on the hot-plugged filesystem, right under the
// mount point.
fn check_marker_file(marker_file: &str) -> Result<(), ConfigError> {
    if marker_file.is_empty()
        || marker_file == "."
        || marker_file == ".."
        || marker_file.contains('/')
        || marker_file.contains(char::is_whitespace)
    {
        return Err(ConfigError::InvalidMarkerFile(marker_file.to_owned()));
    }
    Ok(())
}

impl RunConfig {
    pub fn parse(params: RunParams) -> Result<Self, ConfigError> {
        let toolstack = params.toolstack.parse()?;
        let domain = parse_domain(&params)?;

        if params.cycles == 0 {
            return Err(ConfigError::InvalidCycles);
        }
        check_device(&params.device)?;
        let mount_point = params
            .mount_point
            .unwrap_or_else(|| Path::new(DEFAULT_MOUNT_POINT).join(&params.device));
        check_mount_point(&mount_point)?;
        check_marker_file(&params.marker_file)?;

        let resource = match &params.resource {
            Some(resource) => resource.parse().map_err(ConfigError::InvalidResource)?,
            None => BlockResource::Phy(params.ramdisk.clone()),
        };
        // mkfs runs on the ramdisk, so that is what has to get attached.
        if resource.path() != params.ramdisk {
            return Err(ConfigError::ResourceMismatch {
                resource,
                ramdisk: params.ramdisk,
            });
        }

        let scenario = HotplugScenario {
            ramdisk: params.ramdisk,
            resource,
            device: params.device,
            cycles: params.cycles,
            mount_point,
            marker_file: params.marker_file,
            mkfs: params.mkfs,
            settle_timeout: Duration::from_secs(params.settle_timeout),
            settle_interval: SETTLE_INTERVAL,
        };

        Ok(RunConfig {
            toolstack,
            hypervisor_binary: params.hypervisor_binary,
            domain,
            scenario,
        })
    }

    pub fn toolstack(&self) -> Box<dyn Toolstack> {
        match self.toolstack {
            ToolstackKind::Xl => Box::new(Xl),
            ToolstackKind::CloudHypervisor => {
                Box::new(CloudHypervisor::new(&self.hypervisor_binary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RunParams {
        RunParams {
            default_kernel: Some(PathBuf::from("/root/workloads/vmlinux")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::parse(params()).unwrap();
        assert_eq!(config.toolstack, ToolstackKind::Xl);
        assert_eq!(config.toolstack().name(), "xl");

        let domain = &config.domain;
        assert_eq!(domain.name, "hotplug-test");
        assert_eq!(domain.kernel, PathBuf::from("/root/workloads/vmlinux"));
        assert_eq!(domain.memory_mib, 256);
        assert_eq!(domain.vcpus, 1);
        assert_eq!(domain.mode, VirtMode::Pv);
        assert!(domain.ssh.is_none());
        assert_eq!(domain.boot_timeout, Duration::from_secs(120));

        let scenario = &config.scenario;
        assert_eq!(scenario.resource.to_string(), "phy:/dev/ram1");
        assert_eq!(scenario.device, "xvda1");
        assert_eq!(scenario.cycles, 10);
        assert_eq!(scenario.mount_point, PathBuf::from("/mnt/xvda1"));
        assert_eq!(scenario.marker_file, "myfile");
        assert_eq!(scenario.settle_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_domain_option() {
        let config = RunConfig::parse(RunParams {
            toolstack: "cloud-hypervisor".to_owned(),
            domain: Some(
                "name=ch0,kernel=/boot/vmlinuz,memory=1G,vcpus=2,\
                 cmdline=\"console=ttyS0 root=/dev/vda1 rw\",mode=hvm"
                    .to_owned(),
            ),
            net: Some("tap=,mac=12:34:56:78:90:ab".to_owned()),
            device: "vdb".to_owned(),
            ..params()
        })
        .unwrap();

        assert_eq!(config.toolstack, ToolstackKind::CloudHypervisor);
        assert_eq!(config.toolstack().name(), "cloud-hypervisor");
        assert_eq!(config.domain.name, "ch0");
        assert_eq!(config.domain.kernel, PathBuf::from("/boot/vmlinuz"));
        assert_eq!(config.domain.memory_mib, 1024);
        assert_eq!(config.domain.vcpus, 2);
        assert_eq!(
            config.domain.cmdline.as_deref(),
            Some("console=ttyS0 root=/dev/vda1 rw")
        );
        assert_eq!(config.domain.mode, VirtMode::Hvm);
        assert_eq!(
            config.domain.net.as_deref(),
            Some("tap=,mac=12:34:56:78:90:ab")
        );
        assert_eq!(config.scenario.device, "vdb");
        assert_eq!(config.scenario.mount_point, PathBuf::from("/mnt/vdb"));
    }

    #[test]
    fn test_mount_point_option() {
        let config = RunConfig::parse(RunParams {
            mount_point: Some(PathBuf::from("/media/hotplug")),
            ..params()
        })
        .unwrap();
        assert_eq!(config.scenario.mount_point, PathBuf::from("/media/hotplug"));

        for mount_point in ["mnt", "/mnt/hot plug"] {
            assert!(matches!(
                RunConfig::parse(RunParams {
                    mount_point: Some(PathBuf::from(mount_point)),
                    ..params()
                }),
                Err(ConfigError::InvalidMountPoint(_))
            ));
        }
    }

    #[test]
    fn test_marker_file_stays_on_device() {
        let config = RunConfig::parse(RunParams {
            marker_file: "hotplug.dat".to_owned(),
            ..params()
        })
        .unwrap();
        assert_eq!(config.scenario.marker_file, "hotplug.dat");

        for marker_file in ["/etc/myfile", "", ".", "..", "../myfile", "sub/myfile", "my file"] {
            match RunConfig::parse(RunParams {
                marker_file: marker_file.to_owned(),
                ..params()
            }) {
                Err(ConfigError::InvalidMarkerFile(m)) => assert_eq!(m, marker_file),
                r => panic!("marker file '{marker_file}' gave {r:?}"),
            }
        }
    }

    #[test]
    fn test_ssh_option() {
        let config = RunConfig::parse(RunParams {
            ssh: Some("ip=192.168.2.2,user=cloud,password=cloud123".to_owned()),
            ..params()
        })
        .unwrap();
        let ssh = config.domain.ssh.unwrap();
        assert_eq!(ssh.ip, "192.168.2.2");
        assert_eq!(ssh.auth.username, "cloud");
        assert_eq!(ssh.auth.password, "cloud123");

        assert!(matches!(
            RunConfig::parse(RunParams {
                ssh: Some("user=root".to_owned()),
                ..params()
            }),
            Err(ConfigError::ParseSsh(OptionParserError::MissingOption(_)))
        ));
    }

    #[test]
    fn test_resource_option() {
        let config = RunConfig::parse(RunParams {
            ramdisk: PathBuf::from("/dev/ram3"),
            ..params()
        })
        .unwrap();
        assert_eq!(config.scenario.resource.to_string(), "phy:/dev/ram3");

        let config = RunConfig::parse(RunParams {
            ramdisk: PathBuf::from("/dev/ram2"),
            resource: Some("phy:ram2".to_owned()),
            ..params()
        })
        .unwrap();
        assert_eq!(config.scenario.resource.to_string(), "phy:/dev/ram2");

        let config = RunConfig::parse(RunParams {
            ramdisk: PathBuf::from("/tmp/blk.img"),
            resource: Some("file:/tmp/blk.img".to_owned()),
            ..params()
        })
        .unwrap();
        assert_eq!(config.scenario.ramdisk, PathBuf::from("/tmp/blk.img"));
        assert_eq!(config.scenario.resource.to_string(), "file:/tmp/blk.img");

        // Formatting /dev/ram1 and attaching /dev/ram2 tests nothing.
        match RunConfig::parse(RunParams {
            resource: Some("phy:ram2".to_owned()),
            ..params()
        }) {
            Err(ConfigError::ResourceMismatch { resource, ramdisk }) => {
                assert_eq!(resource.to_string(), "phy:/dev/ram2");
                assert_eq!(ramdisk, PathBuf::from("/dev/ram1"));
            }
            r => panic!("unexpected result {r:?}"),
        }

        assert!(matches!(
            RunConfig::parse(RunParams {
                resource: Some("nbd:foo".to_owned()),
                ..params()
            }),
            Err(ConfigError::InvalidResource(_))
        ));
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(
            RunConfig::parse(RunParams::default()),
            Err(ConfigError::MissingKernel)
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                toolstack: "qemu".to_owned(),
                ..params()
            }),
            Err(ConfigError::UnknownToolstack(_))
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                domain: Some("vcpus=0".to_owned()),
                ..params()
            }),
            Err(ConfigError::InvalidVcpus)
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                domain: Some("memory=512K".to_owned()),
                ..params()
            }),
            Err(ConfigError::InvalidMemory)
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                domain: Some("mode=pvh".to_owned()),
                ..params()
            }),
            Err(ConfigError::ParseDomain(OptionParserError::Conversion(..)))
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                domain: Some("disk=foo".to_owned()),
                ..params()
            }),
            Err(ConfigError::ParseDomain(OptionParserError::UnknownOption(_)))
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                cycles: 0,
                ..params()
            }),
            Err(ConfigError::InvalidCycles)
        ));
        assert!(matches!(
            RunConfig::parse(RunParams {
                device: "/dev/xvda1".to_owned(),
                ..params()
            }),
            Err(ConfigError::InvalidDevice(_))
        ));
    }
}
