// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Namespace entry.
//!
//! A fork-style `clone(2)` carries the child straight into a fresh
//! namespace set: the child comes back as PID 1 of the new pid namespace
//! and finishes the mount setup, the parent stays behind in its original
//! namespaces to report the child pid and exit. A failed clone leaves the
//! parent completely untouched.

use std::ffi::CStr;

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::CloneFlags;
use nix::unistd::{ForkResult, Pid};
use tracing::warn;

/// Kernels older than this cannot take a second sysfs instance per netns.
const SYSFS_MIN_KERNEL: (u32, u32, u32) = (2, 6, 35);

fn namespace_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
}

/// Clones a child directly into the new namespace set, like `fork` but
/// with the namespace flags applied atomically. Returns the child pid on
/// the parent side; the child comes back with its mounts prepared.
pub fn fork_into_namespaces() -> anyhow::Result<ForkResult> {
    let flags = namespace_flags().bits() as libc::c_ulong | libc::SIGCHLD as libc::c_ulong;

    // SAFETY: a NULL child stack gives fork semantics (both sides continue
    // from here on copy-on-write stacks), and the child only runs
    // async-signal-safe setup before entering its own event loop; no other
    // threads exist at this point
    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };

    match pid {
        -1 => Err(anyhow::Error::new(Errno::last()).context("clone failed")),
        0 => {
            setup_mounts();
            Ok(ForkResult::Child)
        }
        child => Ok(ForkResult::Parent {
            child: Pid::from_raw(child as libc::pid_t),
        }),
    }
}

/// Mount preparation inside the new namespaces. Failures are logged and
/// tolerated, matching a kernel that lacks one of the filesystems.
fn setup_mounts() {
    // without this, mount events propagate back out and confuse a
    // systemd-managed host
    if let Err(err) = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    ) {
        warn!("mounting / failed: {err}");
    }

    // per-namespace /proc
    if let Err(err) = mount(
        None::<&str>,
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        warn!("mounting /proc failed: {err}");
    }

    if kernel_supports_netns_sysfs() {
        if let Err(err) = mount(
            None::<&str>,
            "/sys",
            Some("sysfs"),
            MsFlags::empty(),
            None::<&str>,
        ) {
            warn!("mounting /sys failed: {err}");
        }
    }
}

fn kernel_supports_netns_sysfs() -> bool {
    match kernel_release() {
        Some(release) => release_at_least(&release, SYSFS_MIN_KERNEL),
        None => false,
    }
}

fn kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        warn!("uname failed");
        return None;
    }
    // SAFETY: the kernel NUL-terminates utsname fields
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

/// Compares the leading `major.minor.patch` of a kernel release string.
fn release_at_least(release: &str, min: (u32, u32, u32)) -> bool {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let version = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    version >= min
}
