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

//! Line-atomic output multiplexing for concurrent per-host streams.
//!
//! A single process-wide lock guards writes to stdout and stderr and the
//! interactive prompt reader, so lines from different hosts interleave but
//! never splice mid-line, and a prompt exchange is never interrupted by
//! output. Every line is prefixed `[host] stream:` unless prefixing is
//! disabled, and each stream kind maps onto an output group that
//! `hide`/`show` can suppress.

use once_cell::sync::Lazy;
use owo_colors::OwoColorize;
use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;

use crate::env::OutputGroups;

/// Both terminal writers behind the one lock.
struct Terminal {
    stdout: io::Stdout,
    stderr: io::Stderr,
}

static TERMINAL: Lazy<Mutex<Terminal>> = Lazy::new(|| {
    Mutex::new(Terminal {
        stdout: io::stdout(),
        stderr: io::stderr(),
    })
});

/// The stream label attached to each output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Run,
    Sudo,
    Out,
    Err,
    Local,
    Download,
    Upload,
    Warning,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Run => "run",
            Stream::Sudo => "sudo",
            Stream::Out => "out",
            Stream::Err => "err",
            Stream::Local => "local",
            Stream::Download => "download",
            Stream::Upload => "upload",
            Stream::Warning => "warning",
        }
    }

    fn visible(self, groups: &OutputGroups) -> bool {
        match self {
            Stream::Run | Stream::Sudo | Stream::Local => groups.running,
            Stream::Out => groups.stdout,
            Stream::Err => groups.stderr,
            Stream::Download | Stream::Upload => groups.running,
            Stream::Warning => groups.warnings,
        }
    }

    fn goes_to_stderr(self) -> bool {
        matches!(self, Stream::Err | Stream::Warning)
    }
}

/// Render one output line with its `[host] stream:` prefix.
pub fn format_line(host: Option<&str>, stream: Stream, prefix: bool, text: &str) -> String {
    if !prefix {
        return text.to_string();
    }
    match host {
        Some(host) => format!("[{host}] {}: {text}", stream.as_str()),
        None => format!("[localhost] {}: {text}", stream.as_str()),
    }
}

/// Emit one line for `(host, stream)`, honoring group visibility.
pub fn line(host: Option<&str>, stream: Stream, groups: &OutputGroups, prefix: bool, text: &str) {
    if !stream.visible(groups) {
        return;
    }
    let rendered = format_line(host, stream, prefix, text);
    if stream.goes_to_stderr() {
        let _ = write_stderr(&rendered);
    } else {
        let _ = write_stdout(&rendered);
    }
}

/// Emit a warning line for a host (or the local side when `host` is None).
pub fn warn(host: Option<&str>, groups: &OutputGroups, message: &str) {
    if !groups.warnings {
        return;
    }
    let text = format!("Warning: {message}");
    let rendered = format_line(host, Stream::Warning, true, &text);
    let _ = if io::stderr().is_terminal() {
        write_stderr(&rendered.yellow().to_string())
    } else {
        write_stderr(&rendered)
    };
}

/// Emit an abort message; these bypass prefixing and go to stderr.
pub fn abort_message(groups: &OutputGroups, message: &str) {
    if !groups.aborts {
        return;
    }
    let text = format!("Fatal error: {message}");
    let _ = if io::stderr().is_terminal() {
        write_stderr(&text.red().bold().to_string())
    } else {
        write_stderr(&text)
    };
}

/// Emit a status line (connects, disconnects, `Done.`).
pub fn status(groups: &OutputGroups, message: &str) {
    if groups.status {
        let _ = write_stdout(message);
    }
}

/// Emit a bare stderr line that is part of a prompt exchange (retry
/// notices and the like); bypasses group gating but not the lock.
pub fn error_line(text: &str) {
    let _ = write_stderr(text);
}

/// Run `f` with exclusive terminal access, for prompt exchanges that must
/// write a question and read the answer without output interleaving. The
/// caller blocks while holding the lock, so this belongs on a blocking
/// thread.
pub(crate) fn with_terminal_lock<T>(f: impl FnOnce(&mut io::Stderr) -> T) -> T {
    let mut terminal = TERMINAL.lock().unwrap();
    f(&mut terminal.stderr)
}

fn write_stdout(text: &str) -> io::Result<()> {
    let mut terminal = TERMINAL.lock().unwrap();
    writeln!(terminal.stdout, "{text}")?;
    terminal.stdout.flush()
}

fn write_stderr(text: &str) -> io::Result<()> {
    let mut terminal = TERMINAL.lock().unwrap();
    writeln!(terminal.stderr, "{text}")?;
    terminal.stderr.flush()
}

/// Per-host handle bundling the pieces every emit needs.
#[derive(Debug, Clone)]
pub struct HostWriter {
    host: Option<String>,
    groups: OutputGroups,
    prefix: bool,
}

impl HostWriter {
    pub fn new(host: Option<&str>, groups: OutputGroups, prefix: bool) -> Self {
        Self {
            host: host.map(str::to_string),
            groups,
            prefix,
        }
    }

    pub fn line(&self, stream: Stream, text: &str) {
        line(self.host.as_deref(), stream, &self.groups, self.prefix, text);
    }

    pub fn warn(&self, message: &str) {
        warn(self.host.as_deref(), &self.groups, message);
    }
}
