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

//! Host-list resolution: merge explicit hosts, expand roles, apply
//! excludes, normalize and deduplicate.

use std::collections::HashSet;

use crate::env::Env;
use crate::errors::{Error, Result};
use crate::host::HostString;
use crate::task::Task;

/// Host/role/exclude lists supplied at one precedence level (e.g. by the
/// caller of `execute`, or parsed from the command line).
#[derive(Debug, Clone, Default)]
pub struct HostSelection {
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
    pub exclude_hosts: Vec<String>,
}

impl HostSelection {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.roles.is_empty()
    }
}

/// Resolve the host list for one task invocation.
///
/// Precedence for hosts/roles, first non-empty level wins:
/// 1. the per-invocation [`HostSelection`] passed to `execute`,
/// 2. the task's own metadata,
/// 3. `env.hosts` / `env.roles` (already seeded from the CLI).
///
/// Excludes from every level are merged. The result is a canonicalized,
/// order-preserving, deduplicated list; an empty result means the task runs
/// once without a target host.
pub fn resolve(task: &Task, invocation: &HostSelection, env: &mut Env) -> Result<Vec<String>> {
    let (hosts, roles) = if !invocation.is_empty() {
        (invocation.hosts.clone(), invocation.roles.clone())
    } else if !task.hosts.is_empty() || !task.roles.is_empty() {
        (task.hosts.clone(), task.roles.clone())
    } else {
        (env.list_of("hosts"), env.list_of("roles"))
    };

    let mut merged = hosts;
    for role in &roles {
        merged.extend(expand_role(role, env)?);
    }

    let mut excludes: Vec<String> = env.list_of("exclude_hosts");
    excludes.extend(invocation.exclude_hosts.iter().cloned());
    let excluded = normalize_set(&excludes, env)?;

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for host in &merged {
        let canonical = HostString::normalize(host, env)?.canonical();
        if excluded.contains(&canonical) {
            continue;
        }
        if seen.insert(canonical.clone()) {
            resolved.push(canonical);
        }
    }
    Ok(resolved)
}

fn expand_role(role: &str, env: &Env) -> Result<Vec<String>> {
    let def = env
        .roledefs
        .get(role)
        .ok_or_else(|| Error::BadHostString(format!("role not defined: {role}")))?;
    def.hosts()
        .map_err(|e| Error::BadHostString(format!("role {role:?} failed to resolve: {e}")))
}

fn normalize_set(hosts: &[String], env: &mut Env) -> Result<HashSet<String>> {
    hosts
        .iter()
        .map(|h| Ok(HostString::normalize(h, env)?.canonical()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::RoleDef;
    use std::sync::Arc;

    fn env_with_roles() -> Env {
        let mut env = Env::new();
        env.set("user", "deploy");
        env.roledefs.insert(
            "web".to_string(),
            RoleDef::Hosts(vec!["h1".to_string(), "h2".to_string()]),
        );
        env.roledefs
            .insert("db".to_string(), RoleDef::Hosts(vec!["h3".to_string()]));
        env
    }

    fn bare_task() -> Task {
        Task::new("t", |_ctx| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_dedup_preserves_order() {
        let mut env = Env::new();
        env.set("user", "deploy");
        let sel = HostSelection {
            hosts: vec![
                "a".to_string(),
                "b".to_string(),
                "a".to_string(),
                "c".to_string(),
            ],
            ..Default::default()
        };
        let resolved = resolve(&bare_task(), &sel, &mut env).unwrap();
        assert_eq!(
            resolved,
            vec!["deploy@a:22", "deploy@b:22", "deploy@c:22"]
        );
    }

    #[test]
    fn test_role_expansion_with_exclude() {
        let mut env = env_with_roles();
        let sel = HostSelection {
            roles: vec!["web".to_string(), "db".to_string()],
            exclude_hosts: vec!["h2".to_string()],
            ..Default::default()
        };
        let resolved = resolve(&bare_task(), &sel, &mut env).unwrap();
        assert_eq!(resolved, vec!["deploy@h1:22", "deploy@h3:22"]);
    }

    #[test]
    fn test_invocation_beats_task_beats_env() {
        let mut env = env_with_roles();
        env.set("hosts", vec!["envhost".to_string()]);

        let task = bare_task().with_hosts(["taskhost"]);

        // No invocation-level hosts: task metadata wins.
        let resolved = resolve(&task, &HostSelection::default(), &mut env).unwrap();
        assert_eq!(resolved, vec!["deploy@taskhost:22"]);

        // Invocation-level hosts beat the task's.
        let sel = HostSelection {
            hosts: vec!["callhost".to_string()],
            ..Default::default()
        };
        let resolved = resolve(&task, &sel, &mut env).unwrap();
        assert_eq!(resolved, vec!["deploy@callhost:22"]);

        // Nothing anywhere else: env is consulted.
        let resolved = resolve(&bare_task(), &HostSelection::default(), &mut env).unwrap();
        assert_eq!(resolved, vec!["deploy@envhost:22"]);
    }

    #[test]
    fn test_role_provider_callable() {
        let mut env = Env::new();
        env.set("user", "deploy");
        env.roledefs.insert(
            "dynamic".to_string(),
            RoleDef::Provider(Arc::new(|| Ok(vec!["d1".to_string()]))),
        );
        let sel = HostSelection {
            roles: vec!["dynamic".to_string()],
            ..Default::default()
        };
        let resolved = resolve(&bare_task(), &sel, &mut env).unwrap();
        assert_eq!(resolved, vec!["deploy@d1:22"]);
    }

    #[test]
    fn test_failing_role_provider_aborts_resolution() {
        let mut env = Env::new();
        env.roledefs.insert(
            "broken".to_string(),
            RoleDef::Provider(Arc::new(|| {
                Err(crate::errors::Error::Aborted("backend down".to_string()))
            })),
        );
        let sel = HostSelection {
            roles: vec!["broken".to_string()],
            ..Default::default()
        };
        let err = resolve(&bare_task(), &sel, &mut env).unwrap_err();
        assert!(matches!(err, Error::BadHostString(_)));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let mut env = Env::new();
        let sel = HostSelection {
            roles: vec!["nope".to_string()],
            ..Default::default()
        };
        assert!(resolve(&bare_task(), &sel, &mut env).is_err());
    }

    #[test]
    fn test_exclude_matches_after_normalization() {
        let mut env = Env::new();
        env.set("user", "deploy");
        let sel = HostSelection {
            hosts: vec!["deploy@h1:22".to_string(), "h2".to_string()],
            exclude_hosts: vec!["h1".to_string()],
            ..Default::default()
        };
        let resolved = resolve(&bare_task(), &sel, &mut env).unwrap();
        assert_eq!(resolved, vec!["deploy@h2:22"]);
    }

    #[test]
    fn test_empty_resolution_is_ok() {
        let mut env = Env::new();
        let resolved = resolve(&bare_task(), &HostSelection::default(), &mut env).unwrap();
        assert!(resolved.is_empty());
    }
}
