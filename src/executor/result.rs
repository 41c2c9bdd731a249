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

//! Result types for remote operations and task fan-out.

use std::collections::HashMap;
use std::fmt;

/// Key used in result maps when a task runs without a target host.
pub const LOCAL_ONLY_HOST: &str = "<local-only>";

/// The captured outcome of one remote (or local) command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: u32,
    /// The command as given by the caller.
    pub command: String,
    /// The command actually sent, after shell and sudo wrapping.
    pub real_command: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }
}

/// An `ExecutionResult` displays as its captured stdout, so task code can
/// interpolate it directly.
impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stdout)
    }
}

/// The outcome of a `put` or `get` across possibly many files.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    /// Remote paths written by `put`.
    pub uploaded: Vec<String>,
    /// Local paths written by `get`.
    pub downloaded: Vec<String>,
    /// Source paths that failed, in encounter order.
    pub failed: Vec<String>,
}

impl TransferOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-host results of one task fan-out.
///
/// Hosts appear exactly once, in resolution order. `error` holds the first
/// abort-level failure when the run should stop after this task.
#[derive(Debug, Default)]
pub struct TaskResults {
    order: Vec<String>,
    by_host: HashMap<String, anyhow::Result<()>>,
}

impl TaskResults {
    pub fn record(&mut self, host: impl Into<String>, result: anyhow::Result<()>) {
        let host = host.into();
        if !self.by_host.contains_key(&host) {
            self.order.push(host.clone());
        }
        self.by_host.insert(host, result);
    }

    pub fn get(&self, host: &str) -> Option<&anyhow::Result<()>> {
        self.by_host.get(host)
    }

    /// Hosts in resolution order.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &anyhow::Result<()>)> {
        self.order
            .iter()
            .map(|h| (h.as_str(), &self.by_host[h]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.iter()
            .filter_map(|(h, r)| r.is_err().then_some(h))
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.by_host.values().all(anyhow::Result::is_ok)
    }
}
