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

//! Host-key verification policy.

use directories::BaseDirs;
use std::path::PathBuf;

use crate::env::Env;

/// How server host keys are checked against `~/.ssh/known_hosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Reject unknown or changed keys.
    #[default]
    Reject,
    /// Accept and record unknown keys; still reject changed keys.
    AcceptNew,
    /// Skip the known-hosts file entirely.
    Off,
}

impl HostKeyPolicy {
    /// Derive the policy from the environment: `disable_known_hosts` wins,
    /// then `reject_unknown_hosts` picks between reject and accept-new.
    pub fn from_env(env: &Env) -> Self {
        if env.bool_of("disable_known_hosts") {
            HostKeyPolicy::Off
        } else if env.bool_of("reject_unknown_hosts") {
            HostKeyPolicy::Reject
        } else {
            HostKeyPolicy::AcceptNew
        }
    }
}

/// The default known_hosts file path, if a home directory can be found.
pub fn default_known_hosts_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh").join("known_hosts"))
}
