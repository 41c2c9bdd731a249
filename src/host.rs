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

//! Host string parsing and normalization.
//!
//! Host strings follow `[user[:password]@]host[:port]`. IPv6 hosts use
//! square brackets for host/port separation (`[::1]:2222`); a bracket-less
//! string with more than one colon is treated as a bare IPv6 address.
//! An embedded password is stripped into the environment's password map and
//! never appears in the canonical form.

use std::fmt;

use crate::env::Env;
use crate::errors::{Error, Result};

/// A fully resolved `user@host:port` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostString {
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// The pieces of a host string as written, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHost {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Split a host string into its raw parts without applying defaults.
pub fn parse_host_string(host_string: &str) -> Result<RawHost> {
    let bad = || Error::BadHostString(host_string.to_string());

    // Split on the *last* @ so passwords containing @ survive.
    let (cred_part, host_part) = match host_string.rfind('@') {
        Some(at) => (Some(&host_string[..at]), &host_string[at + 1..]),
        None => (None, host_string),
    };

    let (user, password) = match cred_part {
        None | Some("") => (None, None),
        Some(cred) => match cred.split_once(':') {
            Some((u, pw)) => (
                (!u.is_empty()).then(|| u.to_string()),
                (!pw.is_empty()).then(|| pw.to_string()),
            ),
            None => (Some(cred.to_string()), None),
        },
    };

    let (host, port_str) = if let Some(rest) = host_part.strip_prefix('[') {
        // Bracketed IPv6: [::1] or [::1]:2222
        let end = rest.find(']').ok_or_else(bad)?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port_str = match after.strip_prefix(':') {
            Some(p) => Some(p),
            None if after.is_empty() => None,
            None => return Err(bad()),
        };
        (host, port_str)
    } else if host_part.matches(':').count() > 1 {
        // Bare IPv6 address, no port.
        (host_part, None)
    } else {
        match host_part.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (host_part, None),
        }
    };

    if host.is_empty() {
        return Err(bad());
    }
    let port = match port_str {
        Some(p) => Some(p.parse::<u16>().map_err(|_| bad())?),
        None => None,
    };

    Ok(RawHost {
        user,
        password,
        host: Some(host.to_string()),
        port,
    })
}

impl HostString {
    /// Parse a host string, filling in `env.user` / `env.port` defaults and
    /// stashing any embedded password into the environment keyed by the
    /// canonical form.
    pub fn normalize(host_string: &str, env: &mut Env) -> Result<Self> {
        let raw = parse_host_string(host_string)?;
        let normalized = Self {
            user: raw.user.unwrap_or_else(|| env.user().to_string()),
            host: raw.host.ok_or_else(|| {
                Error::BadHostString(host_string.to_string())
            })?,
            port: raw.port.unwrap_or_else(|| env.port()),
        };
        if let Some(password) = raw.password {
            env.set_password_for(&normalized.canonical(), &password);
        }
        Ok(normalized)
    }

    /// The canonical `user@host:port` form used as cache and result key.
    pub fn canonical(&self) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.port)
        }
    }

    /// The `(host, port)` pair for the transport layer.
    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for HostString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Strip default user and port from a host string for display, e.g. in the
/// end-of-run disconnect lines.
pub fn denormalize(host_string: &str, env: &Env) -> String {
    let Ok(raw) = parse_host_string(host_string) else {
        return host_string.to_string();
    };
    let host = raw.host.unwrap_or_default();
    let user = match raw.user {
        Some(u) if u != env.user() => format!("{u}@"),
        _ => String::new(),
    };
    let port = match raw.port {
        Some(p) if p != 22 => format!(":{p}"),
        _ => String::new(),
    };
    let host = if !port.is_empty() && host.contains(':') {
        format!("[{host}]")
    } else {
        host
    };
    format!("{user}{host}{port}")
}
