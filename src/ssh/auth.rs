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

//! Credential selection and the authentication attempt chain.
//!
//! Candidates are tried in a fixed order: explicit key files, stored
//! passwords, the SSH agent (unless `no_agent`), then the stock identity
//! files under `~/.ssh` (unless `no_keys`).

use directories::BaseDirs;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

use russh::client::Handle;

use crate::env::Env;
use crate::errors::{Error, Result};
use crate::host::HostString;

use super::client::ClientHandler;

/// One credential to offer the server.
#[derive(Clone)]
pub enum AuthMethod {
    /// A private key file named by `key_filename`.
    KeyFile {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    /// A password from `env.passwords` / `env.password` or a prompt.
    Password(Zeroizing<String>),
    /// Every identity the running SSH agent offers.
    Agent,
    /// A default identity file discovered under `~/.ssh`.
    DefaultKey { path: PathBuf },
}

impl AuthMethod {
    /// The key file this method reads, if any.
    pub fn key_path(&self) -> Option<&std::path::Path> {
        match self {
            AuthMethod::KeyFile { path, .. } | AuthMethod::DefaultKey { path } => Some(path),
            _ => None,
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile { path, .. } => {
                f.debug_struct("KeyFile").field("path", path).finish()
            }
            AuthMethod::Password(_) => f.write_str("Password([REDACTED])"),
            AuthMethod::Agent => f.write_str("Agent"),
            AuthMethod::DefaultKey { path } => {
                f.debug_struct("DefaultKey").field("path", path).finish()
            }
        }
    }
}

/// Identity file names probed when `no_keys` is not set, most common first.
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_rsa", "id_ecdsa"];

/// Build the ordered credential list for a host.
pub fn candidates(env: &Env, host: &HostString) -> Vec<AuthMethod> {
    let mut methods = Vec::new();

    for key in env.list_of("key_filename") {
        let path = expand_tilde(&key);
        methods.push(AuthMethod::KeyFile {
            path,
            passphrase: None,
        });
    }

    if let Some(password) = env.password_for(&host.canonical()) {
        methods.push(AuthMethod::Password(Zeroizing::new(password)));
    }

    if !env.bool_of("no_agent") && std::env::var_os("SSH_AUTH_SOCK").is_some() {
        methods.push(AuthMethod::Agent);
    }

    if !env.bool_of("no_keys") {
        if let Some(dirs) = BaseDirs::new() {
            let ssh_dir = dirs.home_dir().join(".ssh");
            for name in DEFAULT_IDENTITIES {
                let path = ssh_dir.join(name);
                if path.exists() {
                    methods.push(AuthMethod::DefaultKey { path });
                }
            }
        }
    }

    methods
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}

/// What walking the credential chain produced.
#[derive(Debug, Default)]
pub struct ChainOutcome {
    pub success: bool,
    /// A key file that could not be loaded for want of a passphrase; the
    /// caller may prompt for one and retry.
    pub locked_key: Option<PathBuf>,
}

/// Try each candidate against an open handle, in order.
pub async fn try_methods(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    methods: &[AuthMethod],
) -> Result<ChainOutcome> {
    let mut outcome = ChainOutcome::default();
    for method in methods {
        tracing::debug!("Trying auth method {method:?} for user {user}");
        match attempt(handle, user, method).await {
            Ok(true) => {
                outcome.success = true;
                return Ok(outcome);
            }
            Ok(false) => continue,
            // A key that fails to load removes itself from the chain, but
            // an encrypted one is remembered so the caller can ask for its
            // passphrase. Transport-level errors are fatal.
            Err(Error::Ssh(e)) => return Err(Error::Ssh(e)),
            Err(e) => {
                if is_encrypted_key_error(&e.to_string()) {
                    if let Some(path) = method.key_path() {
                        outcome.locked_key.get_or_insert_with(|| path.to_path_buf());
                    }
                }
                tracing::debug!("Auth method failed: {e}");
                continue;
            }
        }
    }
    Ok(outcome)
}

async fn attempt(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    method: &AuthMethod,
) -> Result<bool> {
    match method {
        AuthMethod::Password(password) => {
            let result = handle.authenticate_password(user, password.as_str()).await?;
            Ok(result.success())
        }
        AuthMethod::KeyFile { path, passphrase } => {
            authenticate_key_file(handle, user, path, passphrase.as_deref().map(|s| s.as_str())).await
        }
        AuthMethod::DefaultKey { path } => {
            authenticate_key_file(handle, user, path, None).await
        }
        AuthMethod::Agent => {
            let mut agent = russh::keys::agent::client::AgentClient::connect_env()
                .await
                .map_err(|e| Error::Aborted(format!("SSH agent unavailable: {e}")))?;
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| Error::Aborted(format!("SSH agent refused identity list: {e}")))?;
            if identities.is_empty() {
                return Ok(false);
            }
            for identity in identities {
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                let result = handle
                    .authenticate_publickey_with(user, identity, hash, &mut agent)
                    .await;
                if let Ok(auth_result) = result {
                    if auth_result.success() {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
    }
}

async fn authenticate_key_file(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    path: &std::path::Path,
    passphrase: Option<&str>,
) -> Result<bool> {
    let key = russh::keys::load_secret_key(path, passphrase)
        .map_err(|e| Error::Aborted(format!("Cannot load key {}: {e}", path.display())))?;
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(
            user,
            russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash),
        )
        .await?;
    Ok(result.success())
}

/// Whether a key-load failure looks like a missing passphrase, which
/// deserves a passphrase prompt instead of a login-password prompt.
pub fn is_encrypted_key_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("encrypted") || lower.contains("passphrase")
}
