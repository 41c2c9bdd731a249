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

//! The execution environment: a typed key/value context with scoped
//! overlays.
//!
//! Every operation reads its configuration from an [`Env`]. Reads walk the
//! overlay stack child-first, so a `scoped` block can override any key and
//! have the previous value restored when the block exits, by any path.
//! Parallel workers receive a clone of the parent environment; mutations in
//! a worker never leak to siblings or to the parent.

mod groups;

pub use groups::{Group, OutputGroups};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::errors::{Error, Result};

/// A configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
    Map(HashMap<String, String>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, String>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(l: Vec<String>) -> Self {
        Value::List(l)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::List(l) => write!(f, "{}", l.join(",")),
            Value::Map(m) => {
                let mut pairs: Vec<_> = m.iter().map(|(k, v)| format!("{k}={v}")).collect();
                pairs.sort();
                write!(f, "{}", pairs.join(","))
            }
        }
    }
}

/// A role definition: either a fixed host list or a provider called at
/// resolution time.
#[derive(Clone)]
pub enum RoleDef {
    Hosts(Vec<String>),
    Provider(Arc<dyn Fn() -> Result<Vec<String>> + Send + Sync>),
}

impl RoleDef {
    pub fn hosts(&self) -> Result<Vec<String>> {
        match self {
            RoleDef::Hosts(hosts) => Ok(hosts.clone()),
            RoleDef::Provider(f) => f(),
        }
    }
}

impl fmt::Debug for RoleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleDef::Hosts(h) => f.debug_tuple("Hosts").field(h).finish(),
            RoleDef::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

/// The ambient configuration context.
///
/// Keys live in a stack of overlay maps; [`Env::get`] walks the stack from
/// the innermost scope outward. The base scope holds the defaults listed in
/// [`Env::new`] plus whatever the CLI and config file seeded.
///
/// Passwords keyed by host string and role definitions live outside the
/// overlay stack: both are mutated in place (a password learned inside a
/// `scoped` block must survive the block).
#[derive(Clone)]
pub struct Env {
    scopes: Vec<HashMap<String, Value>>,
    passwords: HashMap<String, Zeroizing<String>>,
    pub roledefs: HashMap<String, RoleDef>,
    pub output: OutputGroups,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("scopes", &self.scopes)
            .field("passwords", &format_args!("[{} stored]", self.passwords.len()))
            .field("roledefs", &self.roledefs)
            .field("output", &self.output)
            .finish()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// An environment populated with the stock defaults.
    pub fn new() -> Self {
        let local_user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "root".to_string());

        let mut base = HashMap::new();
        let defaults: &[(&str, Value)] = &[
            ("host_string", Value::Str(String::new())),
            ("user", Value::Str(local_user.clone())),
            ("local_user", Value::Str(local_user)),
            ("port", Value::Int(22)),
            ("password", Value::Str(String::new())),
            ("key_filename", Value::List(Vec::new())),
            ("no_agent", Value::Bool(false)),
            ("no_keys", Value::Bool(false)),
            ("gateway", Value::Str(String::new())),
            ("timeout", Value::Int(10)),
            ("command_timeout", Value::Int(0)),
            ("connection_attempts", Value::Int(1)),
            ("keepalive", Value::Int(0)),
            ("parallel", Value::Bool(false)),
            ("pool_size", Value::Int(0)),
            ("warn_only", Value::Bool(false)),
            ("abort_on_prompts", Value::Bool(false)),
            ("abort_message", Value::Str("Fatal error".to_string())),
            ("use_sudo_password", Value::Bool(false)),
            ("sudo_prompt", Value::Str("sudo password:".to_string())),
            ("sudo_user", Value::Str(String::new())),
            ("sudo_group", Value::Str(String::new())),
            ("shell", Value::Str("/bin/bash -l".to_string())),
            ("local_shell", Value::Str("/bin/sh".to_string())),
            ("shell_env", Value::Map(HashMap::new())),
            ("always_use_pty", Value::Bool(true)),
            ("combine_stderr", Value::Bool(true)),
            ("linewise", Value::Bool(false)),
            ("output_prefix", Value::Bool(true)),
            ("hosts", Value::List(Vec::new())),
            ("roles", Value::List(Vec::new())),
            ("exclude_hosts", Value::List(Vec::new())),
            ("skip_bad_hosts", Value::Bool(false)),
            ("skip_unreachable", Value::Bool(false)),
            ("remote_interrupt", Value::Bool(false)),
            ("reject_unknown_hosts", Value::Bool(true)),
            ("disable_known_hosts", Value::Bool(false)),
            (
                "password_prompt_patterns",
                Value::List(vec![
                    r"(?i)\[sudo\] password for [^:]*:\s*$".to_string(),
                    r"(?i)^password:\s*$".to_string(),
                    r"(?i)[^\s]+'s password:\s*$".to_string(),
                    r"(?i)passphrase for [^:]*:\s*$".to_string(),
                ]),
            ),
        ];
        for (k, v) in defaults {
            base.insert((*k).to_string(), v.clone());
        }

        Self {
            scopes: vec![base],
            passwords: HashMap::new(),
            roledefs: HashMap::new(),
            output: OutputGroups::default(),
        }
    }

    /// Look a key up, innermost scope first.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(key))
    }

    /// Set a key in the innermost scope.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.scopes
            .last_mut()
            .expect("env always has a base scope")
            .insert(key.into(), value.into());
    }

    /// Current overlay depth. The base scope counts as depth 1.
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Enter a scope overlaying the given keys.
    pub fn push_scope(&mut self, overrides: impl IntoIterator<Item = (String, Value)>) {
        self.scopes.push(overrides.into_iter().collect());
    }

    /// Leave the innermost scope, restoring every overlaid key. The base
    /// scope is never popped.
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Run `f` inside a scope overlaying `overrides`; the scope is left
    /// whether or not `f` succeeds.
    pub fn scoped<T>(
        &mut self,
        overrides: impl IntoIterator<Item = (String, Value)>,
        f: impl FnOnce(&mut Env) -> T,
    ) -> T {
        self.push_scope(overrides);
        let out = f(self);
        self.pop_scope();
        out
    }

    // Typed lookups. Defaults exist for every stock key, so these only fall
    // back when user code overwrote a key with the wrong type.

    pub fn str_of(&self, key: &str) -> &str {
        self.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn int_of(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(0)
    }

    pub fn bool_of(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn list_of(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    /// A string key whose empty value means "unset".
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        match self.str_of(key) {
            "" => None,
            s => Some(s),
        }
    }

    // Named accessors for the keys the engine reads on hot paths.

    pub fn host_string(&self) -> Option<&str> {
        self.opt_str("host_string")
    }

    pub fn user(&self) -> &str {
        self.str_of("user")
    }

    pub fn port(&self) -> u16 {
        self.int_of("port").clamp(1, i64::from(u16::MAX)) as u16
    }

    pub fn gateway(&self) -> Option<&str> {
        self.opt_str("gateway")
    }

    pub fn connect_timeout(&self) -> u64 {
        self.int_of("timeout").max(1) as u64
    }

    pub fn command_timeout(&self) -> Option<u64> {
        match self.int_of("command_timeout") {
            t if t > 0 => Some(t as u64),
            _ => None,
        }
    }

    pub fn connection_attempts(&self) -> u32 {
        self.int_of("connection_attempts").max(1) as u32
    }

    pub fn keepalive(&self) -> Option<u64> {
        match self.int_of("keepalive") {
            k if k > 0 => Some(k as u64),
            _ => None,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.int_of("pool_size").max(0) as usize
    }

    pub fn warn_only(&self) -> bool {
        self.bool_of("warn_only")
    }

    pub fn abort_on_prompts(&self) -> bool {
        self.bool_of("abort_on_prompts")
    }

    pub fn sudo_prompt(&self) -> &str {
        self.str_of("sudo_prompt")
    }

    pub fn shell(&self) -> &str {
        self.str_of("shell")
    }

    /// Stored password for a host string, falling back to the session-wide
    /// `password` key.
    pub fn password_for(&self, host_string: &str) -> Option<String> {
        if let Some(pw) = self.passwords.get(host_string) {
            return Some(pw.to_string());
        }
        self.opt_str("password").map(str::to_string)
    }

    /// Remember a password for a host string. Also seeds the session-wide
    /// `password` key when it was empty, mirroring what a user typing a
    /// password once would expect.
    pub fn set_password_for(&mut self, host_string: &str, password: &str) {
        self.passwords
            .insert(host_string.to_string(), Zeroizing::new(password.to_string()));
        if self.opt_str("password").is_none() {
            self.set("password", password);
        }
    }

    /// Compiled password-prompt patterns. Invalid patterns are skipped with
    /// a log line rather than failing the command that tripped over them.
    pub fn password_prompt_patterns(&self) -> Vec<regex::Regex> {
        self.list_of("password_prompt_patterns")
            .iter()
            .filter_map(|p| match regex::Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring bad password prompt pattern {p:?}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Hide the given output groups (see [`OutputGroups`]).
    pub fn hide(&mut self, groups: &[Group]) {
        for g in groups {
            self.output.set(*g, false);
        }
    }

    /// Show the given output groups.
    pub fn show(&mut self, groups: &[Group]) {
        for g in groups {
            self.output.set(*g, true);
        }
    }

    /// Abort with the configured message prefix.
    pub fn abort(&self, message: impl fmt::Display) -> Error {
        Error::Aborted(format!("{}: {message}", self.str_of("abort_message")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let env = Env::new();
        assert_eq!(env.port(), 22);
        assert_eq!(env.connection_attempts(), 1);
        assert!(env.bool_of("reject_unknown_hosts"));
        assert!(env.bool_of("combine_stderr"));
        assert!(!env.warn_only());
        assert_eq!(env.command_timeout(), None);
        assert_eq!(env.host_string(), None);
    }

    #[test]
    fn test_scoped_overlay_restores() {
        let mut env = Env::new();
        env.set("warn_only", false);
        env.scoped(vec![("warn_only".to_string(), Value::Bool(true))], |env| {
            assert!(env.warn_only());
        });
        assert!(!env.warn_only());
    }

    #[test]
    fn test_nested_scopes_stack() {
        let mut env = Env::new();
        env.set("port", 22i64);
        env.push_scope(vec![("port".to_string(), Value::Int(2222))]);
        assert_eq!(env.port(), 2222);
        env.push_scope(vec![("port".to_string(), Value::Int(2022))]);
        assert_eq!(env.port(), 2022);
        env.pop_scope();
        assert_eq!(env.port(), 2222);
        env.pop_scope();
        assert_eq!(env.port(), 22);
    }

    #[test]
    fn test_base_scope_never_popped() {
        let mut env = Env::new();
        env.pop_scope();
        env.pop_scope();
        assert_eq!(env.scope_depth(), 1);
        assert_eq!(env.port(), 22);
    }

    #[test]
    fn test_set_writes_innermost_scope() {
        let mut env = Env::new();
        env.push_scope(Vec::new());
        env.set("user", "deploy");
        assert_eq!(env.user(), "deploy");
        env.pop_scope();
        assert_ne!(env.user(), "deploy");
    }

    #[test]
    fn test_passwords_survive_scopes() {
        let mut env = Env::new();
        env.push_scope(Vec::new());
        env.set_password_for("deploy@web1:22", "hunter2");
        env.pop_scope();
        assert_eq!(
            env.password_for("deploy@web1:22").as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn test_password_fallback_to_session_password() {
        let mut env = Env::new();
        assert_eq!(env.password_for("a@b:22"), None);
        env.set("password", "secret");
        assert_eq!(env.password_for("a@b:22").as_deref(), Some("secret"));
    }

    #[test]
    fn test_prompt_patterns_compile() {
        let env = Env::new();
        let patterns = env.password_prompt_patterns();
        assert!(!patterns.is_empty());
        assert!(patterns
            .iter()
            .any(|re| re.is_match("[sudo] password for alice:")));
        assert!(patterns.iter().any(|re| re.is_match("Password:")));
    }

    #[test]
    fn test_worker_clone_is_isolated() {
        let mut parent = Env::new();
        parent.set("user", "deploy");
        let mut worker = parent.clone();
        worker.set("user", "other");
        assert_eq!(parent.user(), "deploy");
        assert_eq!(worker.user(), "other");
    }
}
