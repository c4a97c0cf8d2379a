// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::process::Child;
use std::time::Duration;

use log::{debug, warn};
use wait_timeout::ChildExt;

pub const CHILD_TERM_GRACE: Duration = Duration::new(10, 0);

/// SIGTERM `child`, then SIGKILL it if it is still around after
/// [`CHILD_TERM_GRACE`]. The child is reaped either way.
pub fn kill_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    // SAFETY: plain syscall on a pid we own.
    let r = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ESRCH) {
            let _ = child.wait();
            return;
        }
        warn!("Failed to kill child {} with SIGTERM: {e:?}", child.id());
    }

    match child.wait_timeout(CHILD_TERM_GRACE) {
        Ok(Some(status)) => debug!("Child {} exited: {status}", child.id()),
        // The timeout period elapsed without the child exiting
        Ok(None) => {
            warn!("Child {} ignored SIGTERM, killing it", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(e) => warn!("Failed waiting for child {}: {e:?}", child.id()),
    }
}
