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

//! One authenticated SSH client per target host.
//!
//! Opening a connection resolves the address (or tunnels through a gateway
//! client via a `direct-tcpip` channel), retries transport failures up to
//! `connection_attempts`, then walks the credential chain. When every
//! credential fails and prompting is allowed, the user is asked for a
//! password which is remembered for the rest of the run.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Handler, Msg};
use russh::Channel;
use russh_sftp::client::SftpSession;

use crate::env::Env;
use crate::errors::{Error, Result};
use crate::host::HostString;
use crate::ops::prompt::password_prompt;
use crate::output;

use super::auth::{self, AuthMethod};
use super::known_hosts::{default_known_hosts_path, HostKeyPolicy};

/// How many times a failed login password may be re-entered interactively.
const PASSWORD_PROMPT_ATTEMPTS: u32 = 3;

/// Host-key verification callback for russh.
#[derive(Debug, Clone)]
pub struct ClientHandler {
    hostname: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(hostname: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            hostname,
            port,
            policy,
        }
    }
}

impl Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let bad_key = || Error::BadHostKey {
            host: self.hostname.clone(),
        };
        match self.policy {
            HostKeyPolicy::Off => Ok(true),
            HostKeyPolicy::Reject => {
                match russh::keys::check_known_hosts(&self.hostname, self.port, server_public_key)
                {
                    Ok(true) => Ok(true),
                    Ok(false) | Err(_) => Err(bad_key()),
                }
            }
            HostKeyPolicy::AcceptNew => {
                match russh::keys::check_known_hosts(&self.hostname, self.port, server_public_key)
                {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        if let Some(path) = default_known_hosts_path() {
                            if let Err(e) = russh::keys::known_hosts::learn_known_hosts_path(
                                &self.hostname,
                                self.port,
                                server_public_key,
                                &path,
                            ) {
                                tracing::warn!(
                                    "Could not record host key for {}: {e}",
                                    self.hostname
                                );
                            }
                        }
                        Ok(true)
                    }
                    // A mismatch is never silently accepted.
                    Err(_) => Err(bad_key()),
                }
            }
        }
    }
}

/// An authenticated SSH connection to one host.
pub struct Connection {
    handle: Arc<Handle<ClientHandler>>,
    pub host: HostString,
    pub via_gateway: bool,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("via_gateway", &self.via_gateway)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open and authenticate a connection, tunneling through `gateway` when
    /// one is supplied.
    pub async fn open(
        host: &HostString,
        env: &mut Env,
        gateway: Option<&Connection>,
    ) -> Result<Self> {
        let canonical = host.canonical();
        let attempts = env.connection_attempts();
        let connect_timeout = Duration::from_secs(env.connect_timeout());
        let policy = HostKeyPolicy::from_env(env);

        let mut last_error = String::new();
        let mut handle = None;
        for attempt in 1..=attempts {
            match Self::try_connect(host, env, gateway, connect_timeout, policy).await {
                Ok(h) => {
                    handle = Some(h);
                    break;
                }
                // Host key and DNS problems don't improve with retries.
                Err(e @ (Error::BadHostKey { .. } | Error::NameLookup { .. })) => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        "Connection attempt {attempt}/{attempts} to {canonical} failed: {e}"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        let backoff = Duration::from_secs(1 << (attempt - 1).min(3));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        let mut handle = handle.ok_or_else(|| Error::Unreachable {
            host: canonical.clone(),
            attempts,
            message: last_error,
        })?;

        Self::authenticate(&mut handle, host, env).await?;

        if let Some(interval) = env.keepalive() {
            tracing::debug!("Keepalive every {interval}s on {canonical}");
        }

        Ok(Self {
            handle: Arc::new(handle),
            host: host.clone(),
            via_gateway: gateway.is_some(),
        })
    }

    async fn try_connect(
        host: &HostString,
        env: &Env,
        gateway: Option<&Connection>,
        connect_timeout: Duration,
        policy: HostKeyPolicy,
    ) -> Result<Handle<ClientHandler>> {
        let config = Arc::new(russh_config(env));
        let handler = ClientHandler::new(host.host.clone(), host.port, policy);

        if let Some(gateway) = gateway {
            // Tunnel through the gateway and run the SSH handshake over the
            // resulting stream.
            let channel = tokio::time::timeout(
                connect_timeout,
                gateway.open_direct_tcpip(&host.host, host.port),
            )
            .await
            .map_err(|_| Error::Unreachable {
                host: host.canonical(),
                attempts: 1,
                message: format!("timed out tunneling through {}", gateway.host.canonical()),
            })??;
            let stream = channel.into_stream();
            let handle = tokio::time::timeout(
                connect_timeout,
                client::connect_stream(config, stream, handler),
            )
            .await
            .map_err(|_| timeout_error(host, connect_timeout))??;
            return Ok(handle);
        }

        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((host.host.as_str(), host.port))
                .await
                .map_err(|e| Error::NameLookup {
                    host: host.host.clone(),
                    source: e,
                })?
                .collect();
        if addrs.is_empty() {
            return Err(Error::NameLookup {
                host: host.host.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses resolved",
                ),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match tokio::time::timeout(
                connect_timeout,
                client::connect(config.clone(), addr, handler.clone()),
            )
            .await
            {
                Ok(Ok(handle)) => return Ok(handle),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some(timeout_error(host, connect_timeout)),
            }
        }
        Err(last_err.expect("at least one address was attempted"))
    }

    /// Walk the credential chain, then fall back to interactive password
    /// prompting unless prompts are forbidden.
    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        host: &HostString,
        env: &mut Env,
    ) -> Result<()> {
        let canonical = host.canonical();
        let methods = auth::candidates(env, host);
        let outcome = auth::try_methods(handle, &host.user, &methods).await?;
        if outcome.success {
            return Ok(());
        }

        let auth_failed = || Error::AuthFailed {
            host: canonical.clone(),
        };
        if env.abort_on_prompts() || env.bool_of("parallel") {
            return Err(auth_failed());
        }

        // A key that wanted a passphrase gets asked about by name; plain
        // auth failure falls back to the login password.
        if let Some(locked_key) = &outcome.locked_key {
            for _ in 0..PASSWORD_PROMPT_ATTEMPTS {
                let text = format!("[{canonical}] Passphrase for private key");
                let passphrase = password_prompt(&text).await?;
                let attempt = [AuthMethod::KeyFile {
                    path: locked_key.clone(),
                    passphrase: Some(zeroize::Zeroizing::new(passphrase)),
                }];
                if auth::try_methods(handle, &host.user, &attempt).await?.success {
                    return Ok(());
                }
                output::error_line("Sorry, try again.");
            }
            return Err(auth_failed());
        }

        for _ in 0..PASSWORD_PROMPT_ATTEMPTS {
            let text = format!("[{canonical}] Login password for '{}'", host.user);
            let password = password_prompt(&text).await?;
            let attempt = [AuthMethod::Password(zeroize::Zeroizing::new(
                password.clone(),
            ))];
            if auth::try_methods(handle, &host.user, &attempt).await?.success {
                env.set_password_for(&canonical, &password);
                return Ok(());
            }
            output::error_line("Sorry, try again.");
        }
        Err(auth_failed())
    }

    /// Open a session channel on this connection.
    pub async fn open_session(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(Error::Ssh)
    }

    /// Open a `direct-tcpip` channel to `(host, port)`; used to tunnel
    /// further connections through this one.
    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(Error::Ssh)
    }

    /// Start an SFTP session over a fresh channel.
    pub async fn sftp(&self) -> Result<SftpSession> {
        let channel = self.open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(Error::Sftp)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}

fn russh_config(env: &Env) -> client::Config {
    let mut config = client::Config::default();
    if let Some(interval) = env.keepalive() {
        config.keepalive_interval = Some(Duration::from_secs(interval));
        config.keepalive_max = 3;
    }
    config
}

fn timeout_error(host: &HostString, timeout: Duration) -> Error {
    Error::Unreachable {
        host: host.canonical(),
        attempts: 1,
        message: format!("timed out after {}s", timeout.as_secs()),
    }
}
