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

//! Remote command execution: shell wrapping, sudo wrapping, and the
//! `run`/`sudo` operations.

use std::time::Duration;

use anyhow::Context as _;

use crate::env::Env;
use crate::errors::Error;
use crate::executor::result::ExecutionResult;
use crate::output::Stream;
use crate::ssh::pump::{self, CommandSpec};
use crate::utils::interrupt;

use super::TaskContext;

/// Options shared by `run` and `sudo`. `None` fields defer to the
/// corresponding env key.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Wrap the command in `env.shell -c '...'`.
    pub shell: bool,
    /// Request a PTY; defaults to `env.always_use_pty`.
    pub pty: Option<bool>,
    /// Merge stderr into stdout; defaults to `env.combine_stderr`.
    pub combine_stderr: Option<bool>,
    /// Suppress the announcement and output lines for this call.
    pub quiet: bool,
    /// Override `env.warn_only` for this call.
    pub warn_only: Option<bool>,
    /// Override `env.command_timeout` (seconds) for this call.
    pub timeout: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            shell: true,
            pty: None,
            combine_stderr: None,
            quiet: false,
            warn_only: None,
            timeout: None,
        }
    }
}

/// Extra knobs for `sudo`.
#[derive(Debug, Clone, Default)]
pub struct SudoOptions {
    /// Target user (`sudo -u`); defaults to `env.sudo_user`.
    pub user: Option<String>,
    /// Target group (`sudo -g`); defaults to `env.sudo_group`.
    pub group: Option<String>,
    pub run: RunOptions,
}

#[derive(Debug, Clone)]
struct SudoSpec {
    prompt: String,
    user: Option<String>,
    group: Option<String>,
}

/// Escape a string for inclusion inside single quotes.
fn shell_escape(text: &str) -> String {
    text.replace('\'', r"'\''")
}

/// Escape a value for inclusion inside double quotes.
fn dquote_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build the command actually sent down the channel: `shell_env` exports,
/// then optional `sudo -S -p '<prompt>'`, then the `shell -c` wrapper.
pub fn wrap_command(env: &Env, command: &str, shell: bool, sudo: Option<&SudoOptions>) -> String {
    let mut command = command.to_string();

    if let Some(vars) = env.get("shell_env").and_then(crate::env::Value::as_map) {
        if !vars.is_empty() {
            let mut keys: Vec<_> = vars.keys().collect();
            keys.sort();
            let exports = keys
                .iter()
                .map(|k| format!("{k}=\"{}\"", dquote_escape(&vars[*k])))
                .collect::<Vec<_>>()
                .join(" ");
            command = format!("export {exports} && {command}");
        }
    }

    let sudo_prefix = sudo.map(|opts| {
        let spec = SudoSpec {
            prompt: env.sudo_prompt().to_string(),
            user: opts
                .user
                .clone()
                .or_else(|| env.opt_str("sudo_user").map(str::to_string)),
            group: opts
                .group
                .clone()
                .or_else(|| env.opt_str("sudo_group").map(str::to_string)),
        };
        let mut prefix = format!("sudo -S -p '{}' ", shell_escape(&spec.prompt));
        if let Some(user) = &spec.user {
            prefix.push_str(&format!("-u '{}' ", shell_escape(user)));
        }
        if let Some(group) = &spec.group {
            prefix.push_str(&format!("-g '{}' ", shell_escape(group)));
        }
        prefix
    });

    let wrapped = if shell {
        format!("{} -c '{}'", env.shell(), shell_escape(&command))
    } else {
        command
    };

    match sudo_prefix {
        Some(prefix) => format!("{prefix}{wrapped}"),
        None => wrapped,
    }
}

impl TaskContext {
    /// Run a command on the current host.
    pub async fn run(&mut self, command: &str, opts: RunOptions) -> anyhow::Result<ExecutionResult> {
        self.exec_remote(command, opts, None).await
    }

    /// Run a command under sudo on the current host.
    pub async fn sudo(
        &mut self,
        command: &str,
        opts: SudoOptions,
    ) -> anyhow::Result<ExecutionResult> {
        let run = opts.run.clone();
        self.exec_remote(command, run, Some(opts)).await
    }

    async fn exec_remote(
        &mut self,
        command: &str,
        opts: RunOptions,
        sudo: Option<SudoOptions>,
    ) -> anyhow::Result<ExecutionResult> {
        if interrupt::stop_requested() {
            return Err(Error::Interrupted.into());
        }

        let stream = if sudo.is_some() {
            Stream::Sudo
        } else {
            Stream::Run
        };
        let real_command = wrap_command(&self.env, command, opts.shell, sudo.as_ref());

        let writer = self.writer(opts.quiet);
        writer.line(stream, command);

        let conn = self.connection().await?;

        // With use_sudo_password the password is collected up front, so the
        // in-stream prompt can be answered without stopping the pump.
        if sudo.is_some() && self.env.bool_of("use_sudo_password") {
            let host_string = conn.host.canonical();
            if self.env.password_for(&host_string).is_none() {
                if self.env.abort_on_prompts() || self.env.bool_of("parallel") {
                    return Err(Error::PromptAborted("a sudo password".to_string()).into());
                }
                let password =
                    super::prompt::password_prompt(&format!("[{host_string}] Sudo password"))
                        .await?;
                self.env.set_password_for(&host_string, &password);
            }
        }
        let spec = CommandSpec {
            command: command.to_string(),
            real_command: real_command.clone(),
            stream,
            pty: opts.pty.unwrap_or_else(|| self.env.bool_of("always_use_pty")),
            combine_stderr: opts
                .combine_stderr
                .unwrap_or_else(|| self.env.bool_of("combine_stderr")),
            timeout: opts
                .timeout
                .or_else(|| self.env.command_timeout())
                .map(Duration::from_secs),
        };

        let outcome = pump::run_command(&conn, &mut self.env, &writer, &spec)
            .await
            .with_context(|| {
                format!(
                    "{} {command:?} on {}",
                    if spec.stream == Stream::Sudo { "sudo" } else { "run" },
                    conn.host.canonical()
                )
            })?;

        let result = ExecutionResult {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            return_code: outcome.status,
            command: command.to_string(),
            real_command,
        };

        if result.failed() {
            let warn_only = opts.warn_only.unwrap_or_else(|| self.env.warn_only());
            if warn_only {
                writer.warn(&format!(
                    "command {command:?} returned exit code {}",
                    result.return_code
                ));
            } else {
                return Err(Error::CommandFailed {
                    command: command.to_string(),
                    return_code: result.return_code,
                }
                .into());
            }
        }
        Ok(result)
    }
}
