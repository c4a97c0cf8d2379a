// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest `/proc/partitions` parsing.

pub const PROC_PARTITIONS_CMD: &str = "cat /proc/partitions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub major: u32,
    pub minor: u32,
    pub blocks: u64,
    pub name: String,
}

/// Parse the content of `/proc/partitions`.
///
/// The header, blank lines and anything else that does not look like a
/// partition row (e.g. kernel messages interleaved on a serial console) are
/// skipped.
pub fn parse(listing: &str) -> Vec<Partition> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let major = fields.next()?.parse().ok()?;
            let minor = fields.next()?.parse().ok()?;
            let blocks = fields.next()?.parse().ok()?;
            let name = fields.next()?.to_owned();
            if fields.next().is_some() {
                return None;
            }

            Some(Partition {
                major,
                minor,
                blocks,
                name,
            })
        })
        .collect()
}

pub fn contains(listing: &str, device: &str) -> bool {
    parse(listing).iter().any(|p| p.name == device)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "major minor  #blocks  name\n\
                           \n\
                           \x20202        1    4194304 xvda1\n\
                           \x20  1        1      16384 ram1\n\
                           [   42.123456] blkfront: xvda2: flush diskcache: enabled\n";

    #[test]
    fn test_parse() {
        let parts = parse(LISTING);
        assert_eq!(
            parts,
            vec![
                Partition {
                    major: 202,
                    minor: 1,
                    blocks: 4194304,
                    name: "xvda1".to_owned(),
                },
                Partition {
                    major: 1,
                    minor: 1,
                    blocks: 16384,
                    name: "ram1".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn test_contains_matches_whole_names() {
        assert!(contains(LISTING, "xvda1"));
        assert!(!contains(LISTING, "xvda"));
        assert!(!contains(LISTING, "xvda2"));
        assert!(!contains("", "xvda1"));
    }
}
