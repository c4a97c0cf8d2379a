// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Outcome of a run and how it is signalled to the harness.

use std::error::Error;
use std::fmt;
use std::process::ExitCode;

/// Exit codes of the automake test harness.
pub const EXIT_PASS: u8 = 0;
pub const EXIT_FAIL: u8 = 1;
pub const EXIT_SKIP: u8 = 77;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Skipped(String),
}

impl Verdict {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Verdict::Passed => ExitCode::from(EXIT_PASS),
            Verdict::Skipped(_) => ExitCode::from(EXIT_SKIP),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "PASS"),
            Verdict::Skipped(reason) => write!(f, "SKIP: {reason}"),
        }
    }
}

pub fn failure_exit_code() -> ExitCode {
    ExitCode::from(EXIT_FAIL)
}

/// One line summary naming every error of the chain.
pub fn failure_summary(error: &dyn Error) -> String {
    let mut summary = format!("FAIL: {error}");
    let mut source = error.source();
    while let Some(e) = source {
        summary.push_str(&format!(": {e}"));
        source = e.source();
    }
    summary
}
