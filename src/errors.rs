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

//! Failure taxonomy for host resolution, connection and remote operations.
//!
//! Every failure a task can hit maps onto one of these kinds. The executor
//! records them per host; whether a kind aborts the run or merely skips the
//! host is decided by the policy keys (`warn_only`, `skip_bad_hosts`,
//! `skip_unreachable`) at the point the error is raised.

use std::fmt;
use std::io;

/// Error type for fleet operations.
#[derive(Debug)]
pub enum Error {
    /// A host string that could not be parsed (empty host, bad port).
    BadHostString(String),
    /// DNS lookup failed for a host.
    NameLookup { host: String, source: io::Error },
    /// TCP/SSH level connection failure after all attempts.
    Unreachable {
        host: String,
        attempts: u32,
        message: String,
    },
    /// All authentication methods were exhausted.
    AuthFailed { host: String },
    /// The server's host key was rejected.
    BadHostKey { host: String },
    /// A remote command exited nonzero and `warn_only` was not set.
    CommandFailed {
        command: String,
        return_code: u32,
    },
    /// A remote command exceeded `command_timeout`.
    CommandTimeout { command: String, seconds: u64 },
    /// The channel closed without reporting an exit status.
    CommandDidntExit { command: String },
    /// An interactive prompt was required while `abort_on_prompts` was set.
    PromptAborted(String),
    /// One or more files failed to transfer.
    TransferFailed { failed: Vec<String> },
    /// The host was skipped under a skip policy; carries the underlying cause.
    SkipHost { host: String, reason: String },
    /// The run was cancelled by the user (SIGINT).
    Interrupted,
    /// Generic abort raised by user code or policy.
    Aborted(String),
    /// Transport error from the SSH library.
    Ssh(russh::Error),
    /// SFTP subsystem error.
    Sftp(russh_sftp::client::error::Error),
    /// Local I/O error.
    Io(io::Error),
}

impl Error {
    /// Whether this failure may be converted into a per-host skip under
    /// `skip_bad_hosts`.
    pub fn is_skippable(&self) -> bool {
        !matches!(self, Error::BadHostKey { .. } | Error::Interrupted)
    }

    /// The host this error is attributed to, when known.
    pub fn host(&self) -> Option<&str> {
        match self {
            Error::NameLookup { host, .. }
            | Error::Unreachable { host, .. }
            | Error::AuthFailed { host }
            | Error::BadHostKey { host }
            | Error::SkipHost { host, .. } => Some(host),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadHostString(s) => write!(f, "Bad host string: {s:?}"),
            Error::NameLookup { host, source } => {
                write!(f, "Name lookup failed for {host}: {source}")
            }
            Error::Unreachable {
                host,
                attempts,
                message,
            } => {
                let s = if *attempts == 1 { "" } else { "s" };
                write!(
                    f,
                    "Unable to connect to {host} (tried {attempts} time{s}): {message}"
                )
            }
            Error::AuthFailed { host } => write!(f, "Authentication failed for {host}"),
            Error::BadHostKey { host } => write!(
                f,
                "Host key for {host} did not match the known key! The server's key \
                 changed recently, or this is a man-in-the-middle attack."
            ),
            Error::CommandFailed {
                command,
                return_code,
            } => write!(f, "Command {command:?} exited with status {return_code}"),
            Error::CommandTimeout { command, seconds } => write!(
                f,
                "Command {command:?} did not complete within {seconds} seconds"
            ),
            Error::CommandDidntExit { command } => {
                write!(f, "Channel closed before {command:?} reported an exit status")
            }
            Error::PromptAborted(what) => {
                write!(f, "Needed to prompt for {what}, but abort-on-prompts was set")
            }
            Error::TransferFailed { failed } => {
                write!(f, "Transfer failed for: {}", failed.join(", "))
            }
            Error::SkipHost { host, reason } => write!(f, "Skipping host {host}: {reason}"),
            Error::Interrupted => write!(f, "Interrupted by user"),
            Error::Aborted(msg) => write!(f, "{msg}"),
            Error::Ssh(e) => write!(f, "SSH error: {e}"),
            Error::Sftp(e) => write!(f, "SFTP error: {e:?}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::NameLookup { source, .. } => Some(source),
            Error::Ssh(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<russh::Error> for Error {
    fn from(e: russh::Error) -> Self {
        Error::Ssh(e)
    }
}

impl From<russh_sftp::client::error::Error> for Error {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        Error::Sftp(e)
    }
}

/// Result type for fleet operations.
pub type Result<T> = std::result::Result<T, Error>;
