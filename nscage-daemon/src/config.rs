// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Daemon configuration, populated from the command line by `nscaged`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the control-channel socket.
    pub control_path: PathBuf,
    /// Directory to change into once the namespaces are up.
    pub working_dir: Option<PathBuf>,
    /// File that receives stdout/stderr of the daemon; `/dev/null` when
    /// absent.
    pub log_file: Option<PathBuf>,
    /// File the container pid is written to.
    pub pid_file: Option<PathBuf>,
    /// Whether to enter a fresh namespace set. Off is a debug mode that
    /// serves from the host namespaces.
    pub namespaces: bool,
}

impl DaemonConfig {
    pub fn new(control_path: PathBuf) -> Self {
        DaemonConfig {
            control_path,
            working_dir: None,
            log_file: None,
            pid_file: None,
            namespaces: true,
        }
    }
}
