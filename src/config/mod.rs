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

//! Optional YAML configuration seeding environment defaults and role
//! definitions before the CLI flags are applied.
//!
//! Search order: `./fabr.yaml`, then `$XDG_CONFIG_HOME/fabr/config.yaml`
//! (or `~/.config/fabr/config.yaml`). A missing file is not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::env::{Env, RoleDef};

/// On-disk configuration shape.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    /// Role name -> host list.
    #[serde(default)]
    pub roledefs: HashMap<String, Vec<String>>,
}

/// Session-wide default settings.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Defaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub gateway: Option<String>,
    pub key_filename: Option<Vec<String>>,
    pub pool_size: Option<usize>,
    /// Connect timeout in seconds.
    pub timeout: Option<u64>,
    /// Per-command timeout in seconds; 0 disables.
    pub command_timeout: Option<u64>,
    pub connection_attempts: Option<u32>,
    /// SSH keepalive interval in seconds; 0 disables.
    pub keepalive: Option<u64>,
    pub shell: Option<String>,
    pub sudo_prompt: Option<String>,
}

impl Config {
    /// Load configuration from a file.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {path:?}, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read configuration file at {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse YAML configuration at {}",
                path.display()
            )
        })?;

        Ok(config)
    }

    /// Load from the first standard location that exists, or defaults.
    pub async fn load_default() -> Result<Self> {
        for path in standard_paths() {
            if path.exists() {
                tracing::debug!("Loading configuration from {path:?}");
                return Self::load(&path).await;
            }
        }
        Ok(Self::default())
    }

    /// Push this configuration's values into an environment's base scope.
    pub fn apply(&self, env: &mut Env) {
        if let Some(user) = &self.defaults.user {
            env.set("user", user.clone());
        }
        if let Some(port) = self.defaults.port {
            env.set("port", i64::from(port));
        }
        if let Some(gateway) = &self.defaults.gateway {
            env.set("gateway", gateway.clone());
        }
        if let Some(keys) = &self.defaults.key_filename {
            env.set("key_filename", keys.clone());
        }
        if let Some(pool_size) = self.defaults.pool_size {
            env.set("pool_size", pool_size as i64);
        }
        if let Some(timeout) = self.defaults.timeout {
            env.set("timeout", timeout as i64);
        }
        if let Some(command_timeout) = self.defaults.command_timeout {
            env.set("command_timeout", command_timeout as i64);
        }
        if let Some(attempts) = self.defaults.connection_attempts {
            env.set("connection_attempts", i64::from(attempts));
        }
        if let Some(keepalive) = self.defaults.keepalive {
            env.set("keepalive", keepalive as i64);
        }
        if let Some(shell) = &self.defaults.shell {
            env.set("shell", shell.clone());
        }
        if let Some(prompt) = &self.defaults.sudo_prompt {
            env.set("sudo_prompt", prompt.clone());
        }
        for (role, hosts) in &self.roledefs {
            env.roledefs
                .insert(role.clone(), RoleDef::Hosts(hosts.clone()));
        }
    }
}

fn standard_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("fabr.yaml")];
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("fabr").join("config.yaml"));
    } else if let Ok(home) = std::env::var("HOME") {
        paths.push(
            PathBuf::from(home)
                .join(".config")
                .join("fabr")
                .join("config.yaml"),
        );
    }
    paths
}
