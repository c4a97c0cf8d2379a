// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-side backing of a hot-plugged block device.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockResourceError {
    #[error("empty block resource")]
    Empty,
    #[error("unsupported block resource type '{0}'")]
    UnknownType(String),
    #[error("file resource must be an absolute path: {0}")]
    RelativeFile(String),
}

/// `phy:<device>` or `file:<image>`.
///
/// Physical devices may be given by bare name (`phy:ram1`), they resolve
/// under `/dev`. A bare absolute path is a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockResource {
    Phy(PathBuf),
    File(PathBuf),
}

impl BlockResource {
    pub fn path(&self) -> &Path {
        match self {
            BlockResource::Phy(p) | BlockResource::File(p) => p,
        }
    }

    /// Disk specification understood by `xl block-attach`. `target` has to
    /// come last as it is allowed to contain commas.
    pub fn xl_disk_spec(&self, vdev: &str) -> String {
        let backend = match self {
            BlockResource::Phy(_) => "phy",
            BlockResource::File(_) => "qdisk",
        };
        format!(
            "format=raw,vdev={vdev},access=rw,backendtype={backend},target={}",
            self.path().display()
        )
    }

    /// `vm.add-disk` request body for the Cloud Hypervisor API.
    pub fn ch_disk_config(&self, id: &str) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct DiskConfig<'a> {
            path: &'a Path,
            id: &'a str,
            readonly: bool,
        }

        serde_json::to_string(&DiskConfig {
            path: self.path(),
            id,
            readonly: false,
        })
    }
}

impl FromStr for BlockResource {
    type Err = BlockResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BlockResourceError::Empty);
        }

        match s.split_once(':') {
            Some(("phy", dev)) if !dev.is_empty() => {
                let path = Path::new(dev);
                if path.is_absolute() {
                    Ok(BlockResource::Phy(path.to_path_buf()))
                } else {
                    Ok(BlockResource::Phy(Path::new("/dev").join(path)))
                }
            }
            Some(("file", file)) if !file.is_empty() => {
                if Path::new(file).is_absolute() {
                    Ok(BlockResource::File(PathBuf::from(file)))
                } else {
                    Err(BlockResourceError::RelativeFile(file.to_owned()))
                }
            }
            Some(("phy" | "file", _)) => Err(BlockResourceError::Empty),
            Some((kind, _)) => Err(BlockResourceError::UnknownType(kind.to_owned())),
            None if s.starts_with('/') => Ok(BlockResource::Phy(PathBuf::from(s))),
            None => Err(BlockResourceError::UnknownType(s.to_owned())),
        }
    }
}

impl fmt::Display for BlockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockResource::Phy(p) => write!(f, "phy:{}", p.display()),
            BlockResource::File(p) => write!(f, "file:{}", p.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_resource() {
        assert_eq!(
            "phy:ram1".parse::<BlockResource>().unwrap(),
            BlockResource::Phy(PathBuf::from("/dev/ram1"))
        );
        assert_eq!(
            "phy:/dev/ram1".parse::<BlockResource>().unwrap(),
            BlockResource::Phy(PathBuf::from("/dev/ram1"))
        );
        assert_eq!(
            "/dev/ram1".parse::<BlockResource>().unwrap(),
            BlockResource::Phy(PathBuf::from("/dev/ram1"))
        );
        assert_eq!(
            "file:/tmp/blk.img".parse::<BlockResource>().unwrap(),
            BlockResource::File(PathBuf::from("/tmp/blk.img"))
        );

        assert_eq!(
            "".parse::<BlockResource>().unwrap_err(),
            BlockResourceError::Empty
        );
        assert_eq!(
            "phy:".parse::<BlockResource>().unwrap_err(),
            BlockResourceError::Empty
        );
        assert_eq!(
            "tap:aio:/tmp/blk.img".parse::<BlockResource>().unwrap_err(),
            BlockResourceError::UnknownType("tap".to_owned())
        );
        assert_eq!(
            "file:blk.img".parse::<BlockResource>().unwrap_err(),
            BlockResourceError::RelativeFile("blk.img".to_owned())
        );
        assert_eq!(
            "ram1".parse::<BlockResource>().unwrap_err(),
            BlockResourceError::UnknownType("ram1".to_owned())
        );
    }

    #[test]
    fn test_display() {
        let r: BlockResource = "phy:ram1".parse().unwrap();
        assert_eq!(r.to_string(), "phy:/dev/ram1");
        assert_eq!(r.to_string().parse::<BlockResource>().unwrap(), r);
    }

    #[test]
    fn test_toolstack_specs() {
        let r = BlockResource::Phy(PathBuf::from("/dev/ram1"));
        assert_eq!(
            r.xl_disk_spec("xvda1"),
            "format=raw,vdev=xvda1,access=rw,backendtype=phy,target=/dev/ram1"
        );

        let v: serde_json::Value =
            serde_json::from_str(&r.ch_disk_config("vdb").unwrap()).unwrap();
        assert_eq!(v["path"], "/dev/ram1");
        assert_eq!(v["id"], "vdb");
        assert_eq!(v["readonly"], false);
    }

    #[test]
    fn test_ch_disk_config_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let r = BlockResource::File(PathBuf::from(OsStr::from_bytes(b"/tmp/blk\xff.img")));
        assert!(r.ch_disk_config("vdb").is_err());
    }
}
