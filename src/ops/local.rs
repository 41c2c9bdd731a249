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

//! Local subprocess execution.

use anyhow::Context as _;
use tokio::process::Command;

use crate::errors::Error;
use crate::executor::result::ExecutionResult;
use crate::output::Stream;
use crate::utils::interrupt;

use super::TaskContext;

impl TaskContext {
    /// Run a command on the local machine through `env.local_shell`.
    ///
    /// With `capture` the output is buffered into the result; otherwise the
    /// child inherits the terminal and streams directly, and the result's
    /// stdout/stderr are empty.
    pub async fn local(&mut self, command: &str, capture: bool) -> anyhow::Result<ExecutionResult> {
        if interrupt::stop_requested() {
            return Err(Error::Interrupted.into());
        }

        let shell = self.env.str_of("local_shell").to_string();
        let writer = self.writer(false);
        writer.line(Stream::Local, command);

        let mut cmd = Command::new(&shell);
        cmd.arg("-c").arg(command);

        let (stdout, stderr, code) = if capture {
            let output = cmd
                .output()
                .await
                .with_context(|| format!("spawning local command {command:?} via {shell}"))?;
            (
                String::from_utf8_lossy(&output.stdout)
                    .trim_end_matches('\n')
                    .to_string(),
                String::from_utf8_lossy(&output.stderr)
                    .trim_end_matches('\n')
                    .to_string(),
                exit_code(output.status),
            )
        } else {
            let status = cmd
                .status()
                .await
                .with_context(|| format!("spawning local command {command:?} via {shell}"))?;
            (String::new(), String::new(), exit_code(status))
        };

        let result = ExecutionResult {
            stdout,
            stderr,
            return_code: code,
            command: command.to_string(),
            real_command: format!("{shell} -c {command:?}"),
        };

        if result.failed() {
            if self.env.warn_only() {
                writer.warn(&format!(
                    "local command {command:?} returned exit code {}",
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

fn exit_code(status: std::process::ExitStatus) -> u32 {
    match status.code() {
        Some(code) => code as u32,
        // Killed by a signal; report the conventional 128+N when available.
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return 128 + signal as u32;
                }
            }
            1
        }
    }
}
