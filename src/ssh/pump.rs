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

//! The interactive channel pump: runs one command over a (usually PTY)
//! channel, demultiplexes stdout/stderr into line events, answers password
//! prompts on the channel's stdin, and collects the exit status.
//!
//! Prompts arrive without a trailing newline, so the splitter treats a bare
//! `\r` as a line boundary and keeps the unterminated tail around for
//! pattern matching. Answered prompts are dropped from both the captured
//! output and the terminal.

use std::time::Duration;

use russh::{Channel, ChannelMsg};

use crate::env::Env;
use crate::errors::{Error, Result};
use crate::output::{HostWriter, Stream};
use crate::utils::interrupt;

use super::client::Connection;

/// Maximum password injections per command before giving up; sudo asking
/// again means the password was wrong.
const MAX_PROMPT_RESPONSES: u32 = 3;

/// One command to drive over a channel.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command as the user wrote it.
    pub command: String,
    /// The command after shell and sudo wrapping.
    pub real_command: String,
    /// Announcement stream (`run` or `sudo`); also selects sudo prompt
    /// handling.
    pub stream: Stream,
    pub pty: bool,
    pub combine_stderr: bool,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    fn is_sudo(&self) -> bool {
        self.stream == Stream::Sudo
    }
}

/// Captured output and exit status of one command.
#[derive(Debug, Clone)]
pub struct PumpOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: u32,
}

/// Incremental byte-to-line splitter.
///
/// Complete lines end at `\n` (with a preceding `\r` stripped) or at a bare
/// `\r`. Whatever follows the last boundary stays pending; interactive
/// prompts live there.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    last_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the lines completed by this chunk.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut data = data;

        // A \r\n pair split across chunks: the \r already closed the line.
        if self.last_cr {
            if let [b'\n', rest @ ..] = data {
                data = rest;
            }
            self.last_cr = false;
        }

        self.buf.extend_from_slice(data);
        let mut start = 0;
        let mut i = 0;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\n' => {
                    lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                    i += 1;
                    if i < self.buf.len() {
                        if self.buf[i] == b'\n' {
                            i += 1;
                        }
                    } else {
                        self.last_cr = true;
                    }
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.buf.drain(..start);
        lines
    }

    /// The unterminated tail, if any.
    pub fn pending(&self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }

    /// Discard the unterminated tail (an answered prompt).
    pub fn clear_pending(&mut self) {
        self.buf.clear();
    }

    /// Take the unterminated tail as a final line.
    pub fn flush(&mut self) -> Option<String> {
        let tail = self.pending();
        self.buf.clear();
        tail
    }
}

/// What kind of prompt is sitting unterminated in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptKind {
    Sudo,
    Password,
}

fn detect_prompt(
    pending: &str,
    sudo_expected: bool,
    sudo_prompt: &str,
    patterns: &[regex::Regex],
) -> Option<PromptKind> {
    let tail = pending.trim_end();
    if tail.is_empty() {
        return None;
    }
    if sudo_expected && tail.ends_with(sudo_prompt) {
        return Some(PromptKind::Sudo);
    }
    if patterns.iter().any(|re| re.is_match(tail)) {
        return Some(PromptKind::Password);
    }
    None
}

/// Run one command over a fresh channel on `conn`, streaming lines through
/// `writer` and answering prompts, until the remote process exits.
pub async fn run_command(
    conn: &Connection,
    env: &mut Env,
    writer: &HostWriter,
    spec: &CommandSpec,
) -> Result<PumpOutcome> {
    let channel = conn.open_session().await?;

    if spec.pty {
        let term = std::env::var("TERM").unwrap_or_else(|_| "vt100".to_string());
        let (cols, rows) = match terminal_size::terminal_size() {
            Some((w, h)) => (u32::from(w.0), u32::from(h.0)),
            None => (80, 24),
        };
        channel
            .request_pty(false, &term, cols, rows, 0, 0, &[])
            .await?;
    }

    channel.exec(true, spec.real_command.as_str()).await?;

    match spec.timeout {
        Some(timeout) => tokio::time::timeout(timeout, drive(channel, conn, env, writer, spec))
            .await
            .map_err(|_| Error::CommandTimeout {
                command: spec.command.clone(),
                seconds: timeout.as_secs(),
            })?,
        None => drive(channel, conn, env, writer, spec).await,
    }
}

async fn drive(
    mut channel: Channel<russh::client::Msg>,
    conn: &Connection,
    env: &mut Env,
    writer: &HostWriter,
    spec: &CommandSpec,
) -> Result<PumpOutcome> {
    let host_string = conn.host.canonical();
    let sudo_prompt = env.sudo_prompt().to_string();
    let patterns = env.password_prompt_patterns();
    let stop = interrupt::stop_token();

    let mut out_split = LineSplitter::new();
    let mut err_split = LineSplitter::new();
    let mut out_lines: Vec<String> = Vec::new();
    let mut err_lines: Vec<String> = Vec::new();
    let mut status: Option<u32> = None;
    let mut responses_sent = 0u32;
    let mut interrupted = false;

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled(), if !interrupted => {
                interrupted = true;
                if env.bool_of("remote_interrupt") {
                    // Forward ^C and keep draining until the remote exits.
                    channel.data(&b"\x03"[..]).await?;
                } else {
                    drop(channel);
                    return Err(Error::Interrupted);
                }
            }

            msg = channel.wait() => {
                let Some(msg) = msg else { break };
                match msg {
                    ChannelMsg::Data { ref data } => {
                        for line in out_split.push(data) {
                            writer.line(Stream::Out, &line);
                            out_lines.push(line);
                        }
                        if let Some(pending) = out_split.pending() {
                            if let Some(kind) =
                                detect_prompt(&pending, spec.is_sudo(), &sudo_prompt, &patterns)
                            {
                                responses_sent += 1;
                                if responses_sent > MAX_PROMPT_RESPONSES {
                                    return Err(Error::PromptAborted(format!(
                                        "a working password ({} rejected attempts)",
                                        responses_sent - 1
                                    )));
                                }
                                let password =
                                    resolve_password(env, &host_string, kind).await?;
                                channel
                                    .data(format!("{password}\n").as_bytes())
                                    .await?;
                                // The prompt never reaches capture or screen.
                                out_split.clear_pending();
                            }
                        }
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        let split = if spec.combine_stderr { &mut out_split } else { &mut err_split };
                        let lines = split.push(data);
                        for line in lines {
                            if spec.combine_stderr {
                                writer.line(Stream::Out, &line);
                                out_lines.push(line);
                            } else {
                                writer.line(Stream::Err, &line);
                                err_lines.push(line);
                            }
                        }
                    }
                    // The exit status can arrive before the last data
                    // message; keep draining.
                    ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                    _ => {}
                }
            }
        }
    }

    for (split, lines, stream) in [
        (&mut out_split, &mut out_lines, Stream::Out),
        (&mut err_split, &mut err_lines, Stream::Err),
    ] {
        if let Some(tail) = split.flush() {
            writer.line(stream, &tail);
            lines.push(tail);
        }
    }

    match status {
        Some(status) => Ok(PumpOutcome {
            stdout: out_lines.join("\n"),
            stderr: err_lines.join("\n"),
            status,
        }),
        None if interrupted => Err(Error::Interrupted),
        None => Err(Error::CommandDidntExit {
            command: spec.command.clone(),
        }),
    }
}

/// Find a password for an in-flight prompt: the stored one, or ask the user
/// once when interactive prompting is allowed.
async fn resolve_password(env: &mut Env, host_string: &str, kind: PromptKind) -> Result<String> {
    if let Some(password) = env.password_for(host_string) {
        return Ok(password);
    }
    let what = match kind {
        PromptKind::Sudo => "a sudo password",
        PromptKind::Password => "a password",
    };
    if env.abort_on_prompts() || env.bool_of("parallel") {
        return Err(Error::PromptAborted(what.to_string()));
    }
    let text = format!("[{host_string}] {}", match kind {
        PromptKind::Sudo => "Sudo password",
        PromptKind::Password => "Password",
    });
    let password = crate::ops::prompt::password_prompt(&text).await?;
    env.set_password_for(host_string, &password);
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_newlines() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"hello\nworld\n"), vec!["hello", "world"]);
        assert_eq!(s.pending(), None);
    }

    #[test]
    fn test_splitter_partial_line() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"hel"), Vec::<String>::new());
        assert_eq!(s.pending().as_deref(), Some("hel"));
        assert_eq!(s.push(b"lo\n"), vec!["hello"]);
        assert_eq!(s.pending(), None);
    }

    #[test]
    fn test_splitter_crlf() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"a\r\nb\r\n"), vec!["a", "b"]);
    }

    #[test]
    fn test_splitter_bare_cr_ends_line() {
        let mut s = LineSplitter::new();
        assert_eq!(
            s.push(b"progress 50%\rprogress 100%\r"),
            vec!["progress 50%", "progress 100%"]
        );
        assert_eq!(s.pending(), None);
    }

    #[test]
    fn test_splitter_crlf_across_chunks() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"line\r"), vec!["line"]);
        // The \n completing the \r\n pair must not produce an empty line.
        assert_eq!(s.push(b"\nnext\n"), vec!["next"]);
    }

    #[test]
    fn test_splitter_flush() {
        let mut s = LineSplitter::new();
        s.push(b"no newline");
        assert_eq!(s.flush().as_deref(), Some("no newline"));
        assert_eq!(s.flush(), None);
    }

    #[test]
    fn test_detect_sudo_prompt() {
        let patterns = Env::new().password_prompt_patterns();
        assert_eq!(
            detect_prompt("sudo password:", true, "sudo password:", &patterns),
            Some(PromptKind::Sudo)
        );
        // Sudo prompt text only counts on sudo invocations...
        assert_eq!(
            detect_prompt("custom prompt>", false, "custom prompt>", &patterns),
            None
        );
        // ...but standard password prompts match anywhere.
        assert_eq!(
            detect_prompt("[sudo] password for alice:", false, "zz", &patterns),
            Some(PromptKind::Password)
        );
        assert_eq!(
            detect_prompt("Password: ", false, "zz", &patterns),
            Some(PromptKind::Password)
        );
    }

    #[test]
    fn test_ordinary_output_is_not_a_prompt() {
        let patterns = Env::new().password_prompt_patterns();
        assert_eq!(detect_prompt("Linux", false, "sudo password:", &patterns), None);
        assert_eq!(detect_prompt("", true, "sudo password:", &patterns), None);
        assert_eq!(
            detect_prompt("checking passwords in db", false, "sudo password:", &patterns),
            None
        );
    }
}
