// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host and guest plumbing for block hot-plug testing: toolstack backends,
//! guest consoles and host command execution.

pub mod block;
pub mod cloud_hypervisor;
pub mod console;
pub mod domain;
pub mod host;
pub mod partitions;
pub mod process;
pub mod ssh;
pub mod xl;

pub use block::{BlockResource, BlockResourceError};
pub use cloud_hypervisor::CloudHypervisor;
pub use console::{format_history, CommandResult, Console, ConsoleError, HistoryEntry};
pub use domain::{Domain, DomainConfig, DomainError, Toolstack, VirtMode};
pub use host::{HostError, HostOutput, HostRunner, ShellRunner};
pub use ssh::{PasswordAuth, SshTarget};
pub use xl::Xl;
