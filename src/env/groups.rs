// Copyright 2025 The fabr contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named output groups toggled by `hide`/`show` and the `--hide`/`--show`
//! CLI flags.

use std::str::FromStr;

/// A category of terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    /// Connect/disconnect and end-of-run status lines.
    Status,
    /// The `[host] run: ...` / `sudo: ...` announcement lines.
    Running,
    /// Remote standard output.
    Stdout,
    /// Remote standard error.
    Stderr,
    /// Warning lines.
    Warnings,
    /// Output produced explicitly by user tasks.
    User,
    /// Internal debug chatter.
    Debug,
    /// Abort messages.
    Aborts,
    /// Umbrella for stdout + stderr.
    Output,
    /// Umbrella for every group.
    Everything,
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "status" => Group::Status,
            "running" => Group::Running,
            "stdout" => Group::Stdout,
            "stderr" => Group::Stderr,
            "warnings" => Group::Warnings,
            "user" => Group::User,
            "debug" => Group::Debug,
            "aborts" => Group::Aborts,
            "output" => Group::Output,
            "everything" => Group::Everything,
            other => return Err(format!("unknown output group: {other:?}")),
        })
    }
}

/// Which output groups are currently visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGroups {
    pub status: bool,
    pub running: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub warnings: bool,
    pub user: bool,
    pub debug: bool,
    pub aborts: bool,
}

impl Default for OutputGroups {
    fn default() -> Self {
        Self {
            status: true,
            running: true,
            stdout: true,
            stderr: true,
            warnings: true,
            user: true,
            debug: false,
            aborts: true,
        }
    }
}

impl OutputGroups {
    pub fn set(&mut self, group: Group, on: bool) {
        match group {
            Group::Status => self.status = on,
            Group::Running => self.running = on,
            Group::Stdout => self.stdout = on,
            Group::Stderr => self.stderr = on,
            Group::Warnings => self.warnings = on,
            Group::User => self.user = on,
            Group::Debug => self.debug = on,
            Group::Aborts => self.aborts = on,
            Group::Output => {
                self.stdout = on;
                self.stderr = on;
            }
            Group::Everything => {
                self.status = on;
                self.running = on;
                self.stdout = on;
                self.stderr = on;
                self.warnings = on;
                self.user = on;
                self.aborts = on;
                // `everything` deliberately leaves debug alone; it is opted
                // into separately.
            }
        }
    }
}
