// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
pub mod tests {
    use std::cmp::Ordering;

    use clap::Command;

    /// Arguments are declared in alphabetical order of their id.
    pub fn assert_args_sorted(cmd: &Command) {
        let args: Vec<_> = cmd.get_arguments().collect();
        for pair in args.windows(2) {
            assert_ne!(
                pair[0].get_id().cmp(pair[1].get_id()),
                Ordering::Greater,
                "args not alphabetically sorted: arg={}, next={}",
                pair[0].get_id(),
                pair[1].get_id()
            );
        }
    }

    /// Every argument shows up in `--help` with a description.
    pub fn assert_args_documented(cmd: &Command) {
        for arg in cmd.get_arguments() {
            assert!(
                arg.get_help().is_some(),
                "arg {} has no help text",
                arg.get_id()
            );
        }
    }
}
