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

//! Per-worker cache of authenticated connections.
//!
//! Keys combine the canonical host string with the gateway it was reached
//! through, so changing `env.gateway` mid-run yields a separate client.
//! Entries keep insertion order; shutdown closes targets first and
//! gateways after their dependents.

use std::sync::Arc;

use crate::env::Env;
use crate::errors::{Error, Result};
use crate::host::{denormalize, HostString};
use crate::output;

use super::client::Connection;

struct CacheEntry {
    key: String,
    canonical: String,
    is_gateway: bool,
    conn: Arc<Connection>,
}

/// Connection cache for one worker (or for the whole process in serial
/// mode).
#[derive(Default)]
pub struct ConnectionCache {
    entries: Vec<CacheEntry>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return a live client for `host_string`, opening one on miss.
    pub async fn get(&mut self, host_string: &str, env: &mut Env) -> Result<Arc<Connection>> {
        let host = HostString::normalize(host_string, env)?;
        let canonical = host.canonical();

        // The gateway never tunnels through itself.
        let gateway_canonical = match env.gateway().map(str::to_string) {
            Some(gw) => {
                let gw_canonical = HostString::normalize(&gw, env)?.canonical();
                (gw_canonical != canonical).then_some(gw_canonical)
            }
            None => None,
        };

        let key = match &gateway_canonical {
            Some(gw) => format!("{canonical} via {gw}"),
            None => canonical.clone(),
        };
        if let Some(entry) = self.entries.iter().find(|e| e.key == key) {
            return Ok(Arc::clone(&entry.conn));
        }

        let gateway = match &gateway_canonical {
            Some(gw) => Some(self.get_gateway(gw, env).await?),
            None => None,
        };

        let conn = self.open_checked(&host, env, gateway.as_deref()).await?;
        let conn = Arc::new(conn);
        self.entries.push(CacheEntry {
            key,
            canonical,
            is_gateway: false,
            conn: Arc::clone(&conn),
        });
        Ok(conn)
    }

    /// Obtain (and cache) the gateway client itself, always as a direct
    /// connection.
    async fn get_gateway(&mut self, gw_canonical: &str, env: &mut Env) -> Result<Arc<Connection>> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.is_gateway && e.canonical == gw_canonical)
        {
            return Ok(Arc::clone(&entry.conn));
        }
        tracing::debug!("Opening gateway connection to {gw_canonical}");
        let host = HostString::normalize(gw_canonical, env)?;
        let conn = Arc::new(self.open_checked(&host, env, None).await?);
        self.entries.push(CacheEntry {
            key: format!("gateway {gw_canonical}"),
            canonical: gw_canonical.to_string(),
            is_gateway: true,
            conn: Arc::clone(&conn),
        });
        Ok(conn)
    }

    /// Open a connection, converting unreachable hosts into a skip when the
    /// policy allows it.
    async fn open_checked(
        &self,
        host: &HostString,
        env: &mut Env,
        gateway: Option<&Connection>,
    ) -> Result<Connection> {
        match Connection::open(host, env, gateway).await {
            Ok(conn) => Ok(conn),
            Err(e @ (Error::Unreachable { .. } | Error::NameLookup { .. }))
                if env.bool_of("skip_unreachable") =>
            {
                let reason = e.to_string();
                output::warn(Some(&host.canonical()), &env.output, &reason);
                Err(Error::SkipHost {
                    host: host.canonical(),
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Close every cached connection: targets in the order opened, then
    /// gateways (which dependents may still be draining through).
    pub async fn disconnect_all(&mut self, env: &Env) {
        let entries = std::mem::take(&mut self.entries);
        let (gateways, targets): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.is_gateway);
        for entry in targets.into_iter().chain(gateways) {
            entry.conn.close().await;
            output::status(
                &env.output,
                &format!(
                    "Disconnecting from {}... done.",
                    denormalize(&entry.canonical, env)
                ),
            );
        }
    }
}
