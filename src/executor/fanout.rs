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

//! Serial and bounded-parallel task dispatch.
//!
//! Serial mode walks the host list in order on one environment and one
//! connection cache. Parallel mode gives every worker a clone of the parent
//! environment and its own cache; concurrency is bounded by a semaphore
//! sized from `pool_size`. Results flow back over a bounded channel and the
//! map is populated in host-resolution order regardless of completion
//! order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::env::Env;
use crate::errors::Error;
use crate::hostlist::{self, HostSelection};
use crate::ops::TaskContext;
use crate::output;
use crate::ssh::ConnectionCache;
use crate::task::Task;
use crate::utils::interrupt;

use super::result::{TaskResults, LOCAL_ONLY_HOST};

/// Drives tasks across hosts; owns the serial-mode environment and
/// connection cache, both of which persist across tasks in one run.
pub struct Executor {
    pub env: Env,
    cache: Arc<Mutex<ConnectionCache>>,
}

impl Executor {
    pub fn new(env: Env) -> Self {
        Self {
            env,
            cache: Arc::new(Mutex::new(ConnectionCache::new())),
        }
    }

    /// Execute one task across its resolved host list.
    ///
    /// Host-resolution failures abort before any host runs. Per-host
    /// failures are recorded in the result map, except that in serial mode
    /// a failure without `skip_bad_hosts` stops the walk and is returned
    /// as the error — no partial map is handed back, so any returned map
    /// always holds every resolved host exactly once. In parallel mode
    /// every spawned worker completes either way.
    pub async fn execute(
        &mut self,
        task: &Task,
        invocation: &HostSelection,
        args: Vec<String>,
        kwargs: HashMap<String, String>,
    ) -> anyhow::Result<TaskResults> {
        let hosts = hostlist::resolve(task, invocation, &mut self.env)?;
        tracing::debug!("Task {} resolved to hosts: {hosts:?}", task.name);

        if hosts.is_empty() {
            let mut results = TaskResults::default();
            let mut env = self.env.clone();
            env.set("host_string", "");
            let ctx = TaskContext::new(env, Arc::clone(&self.cache))
                .with_args(args, kwargs);
            let (result, env) = run_host(task, ctx).await;
            self.env = env;
            match result {
                Err(e) if self.aborts_serial_walk(&e) => {
                    output::abort_message(&self.env.output, &format!("{e:#}"));
                    return Err(e);
                }
                other => results.record(LOCAL_ONLY_HOST, other),
            }
            return Ok(results);
        }

        let parallel = task.parallel.unwrap_or_else(|| self.env.bool_of("parallel"));
        if parallel {
            Ok(self.execute_parallel(task, &hosts, args, kwargs).await)
        } else {
            self.execute_serial(task, &hosts, args, kwargs).await
        }
    }

    async fn execute_serial(
        &mut self,
        task: &Task,
        hosts: &[String],
        args: Vec<String>,
        kwargs: HashMap<String, String>,
    ) -> anyhow::Result<TaskResults> {
        let mut results = TaskResults::default();
        for host in hosts {
            if interrupt::stop_requested() {
                results.record(host.clone(), Err(Error::Interrupted.into()));
                continue;
            }

            let mut env = self.env.clone();
            env.set("host_string", host.clone());
            let ctx = TaskContext::new(env, Arc::clone(&self.cache))
                .with_args(args.clone(), kwargs.clone());
            let (result, mut env) = run_host(task, ctx).await;

            // Serial mode keeps one logical environment: passwords typed
            // and keys set while on this host carry over to the next.
            env.set("host_string", "");
            self.env = env;

            match result {
                Err(e) if self.aborts_serial_walk(&e) => {
                    // An unskipped failure ends the walk; it surfaces as
                    // the error rather than a map missing the unvisited
                    // hosts.
                    output::abort_message(&self.env.output, &format!("{e:#}"));
                    return Err(e.context(format!("task {} failed on {host}", task.name)));
                }
                other => {
                    if let Err(e) = &other {
                        if !is_skip(e) {
                            output::warn(Some(host), &self.env.output, &format!("{e:#}"));
                        }
                        // Skips already warned where the skip was decided.
                    }
                    results.record(host.clone(), other);
                }
            }
        }
        Ok(results)
    }

    /// Whether a failure ends a serial walk instead of being recorded.
    fn aborts_serial_walk(&self, e: &anyhow::Error) -> bool {
        !is_skip(e) && !self.env.bool_of("skip_bad_hosts")
    }

    async fn execute_parallel(
        &mut self,
        task: &Task,
        hosts: &[String],
        args: Vec<String>,
        kwargs: HashMap<String, String>,
    ) -> TaskResults {
        let pool_size = task
            .pool_size
            .filter(|n| *n > 0)
            .or_else(|| Some(self.env.pool_size()).filter(|n| *n > 0))
            .unwrap_or(hosts.len())
            .max(1);
        tracing::debug!(
            "Running task {} on {} hosts, pool size {pool_size}",
            task.name,
            hosts.len()
        );

        let semaphore = Arc::new(Semaphore::new(pool_size));
        let (tx, mut rx) = mpsc::channel::<(String, anyhow::Result<()>)>(hosts.len().max(1));

        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            let task = task.clone();
            let host = host.clone();
            let mut env = self.env.clone();
            env.set("host_string", host.clone());
            env.set("parallel", true);
            let args = args.clone();
            let kwargs = kwargs.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let result = if interrupt::stop_requested() {
                    Err(Error::Interrupted.into())
                } else {
                    let cache = Arc::new(Mutex::new(ConnectionCache::new()));
                    let ctx = TaskContext::new(env, Arc::clone(&cache)).with_args(args, kwargs);
                    let (result, env) = run_host(&task, ctx).await;
                    cache.lock().await.disconnect_all(&env).await;
                    result
                };
                let _ = tx.send((host, result)).await;
            }));
        }
        drop(tx);

        // Collect one result per worker. Once an interrupt is pending the
        // drain is bounded by env.timeout; workers that fail to wind down
        // in time are abandoned.
        let mut by_host = HashMap::new();
        loop {
            let received = if interrupt::stop_requested() {
                match tokio::time::timeout(
                    Duration::from_secs(self.env.connect_timeout()),
                    rx.recv(),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => {
                        output::warn(
                            None,
                            &self.env.output,
                            "gave up waiting for interrupted workers",
                        );
                        break;
                    }
                }
            } else {
                rx.recv().await
            };
            match received {
                Some((host, result)) => {
                    by_host.insert(host, result);
                }
                None => break,
            }
        }
        join_all(handles).await;

        let mut results = TaskResults::default();
        for host in hosts {
            let result = by_host
                .remove(host)
                .unwrap_or_else(|| Err(Error::Aborted("worker failed to join".to_string()).into()));
            if let Err(e) = &result {
                if is_skip(e) || self.env.bool_of("skip_bad_hosts") {
                    output::warn(Some(host), &self.env.output, &format!("{e:#}"));
                } else {
                    output::abort_message(&self.env.output, &format!("{e:#}"));
                }
            }
            results.record(host.clone(), result);
        }
        results
    }

    /// Close every connection opened in serial mode (parallel workers close
    /// their own before exiting).
    pub async fn shutdown(&mut self) {
        let cache = Arc::clone(&self.cache);
        cache.lock().await.disconnect_all(&self.env).await;
    }
}

fn is_skip(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Error>(), Some(Error::SkipHost { .. }))
}

/// Run hooks and body for one host; hands the environment back so serial
/// mode can keep it.
async fn run_host(task: &Task, mut ctx: TaskContext) -> (anyhow::Result<()>, Env) {
    let mut result = match &task.before {
        Some(hook) => hook(&mut ctx).await,
        None => Ok(()),
    };
    if result.is_ok() {
        result = (task.body)(&mut ctx).await;
    }
    // The after-hook is teardown: it runs on failure too, but its own
    // failure never masks the body's.
    if let Some(hook) = &task.after {
        let after = hook(&mut ctx).await;
        if result.is_ok() {
            result = after;
        }
    }
    (result, ctx.env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet_env() -> Env {
        let mut env = Env::new();
        env.output.warnings = false;
        env.output.aborts = false;
        env.output.status = false;
        env
    }

    fn counting_task(name: &str, counter: Arc<AtomicUsize>) -> Task {
        Task::new(name, move |_ctx| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_local_only_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task("t", Arc::clone(&counter));
        let mut executor = Executor::new(quiet_env());
        let results = executor
            .execute(&task, &HostSelection::default(), Vec::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(results.hosts().collect::<Vec<_>>(), vec![LOCAL_ONLY_HOST]);
        assert!(results.all_succeeded());
    }

    #[tokio::test]
    async fn test_serial_runs_once_per_host_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let order = Arc::clone(&order);
            Task::new("t", move |ctx| {
                let order = Arc::clone(&order);
                let host = ctx.host_string().unwrap();
                Box::pin(async move {
                    order.lock().await.push(host);
                    Ok(())
                })
            })
        };
        let mut executor = Executor::new(quiet_env());
        let selection = HostSelection {
            hosts: vec!["h1".to_string(), "h2".to_string(), "h1".to_string()],
            ..Default::default()
        };
        let results = executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let user = executor.env.user().to_string();
        assert_eq!(
            *order.lock().await,
            vec![format!("{user}@h1:22"), format!("{user}@h2:22")]
        );
    }

    #[tokio::test]
    async fn test_serial_failure_without_skip_surfaces_as_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = {
            let counter = Arc::clone(&counter);
            Task::new("t", move |ctx| {
                let counter = Arc::clone(&counter);
                let host = ctx.host_string().unwrap();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if host.contains("h1") {
                        anyhow::bail!("boom on h1");
                    }
                    Ok(())
                })
            })
        };
        let mut executor = Executor::new(quiet_env());
        let selection = HostSelection {
            hosts: vec!["h1".to_string(), "h2".to_string()],
            ..Default::default()
        };
        let err = executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap_err();

        // The walk stops at h1 and the failure propagates; no partial
        // result map with missing hosts is ever returned.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(format!("{err:#}").contains("boom on h1"));
    }

    #[tokio::test]
    async fn test_serial_continues_with_skip_bad_hosts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = {
            let counter = Arc::clone(&counter);
            Task::new("t", move |ctx| {
                let counter = Arc::clone(&counter);
                let host = ctx.host_string().unwrap();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if host.contains("h1") {
                        anyhow::bail!("boom on h1");
                    }
                    Ok(())
                })
            })
        };
        let mut env = quiet_env();
        env.set("skip_bad_hosts", true);
        let mut executor = Executor::new(env);
        let selection = HostSelection {
            hosts: vec!["h1".to_string(), "h2".to_string()],
            ..Default::default()
        };
        let results = executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results.failed_hosts().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_all_hosts_complete_despite_failure() {
        let task = Task::new("t", |ctx| {
            let host = ctx.host_string().unwrap();
            Box::pin(async move {
                if host.contains("h2") {
                    anyhow::bail!("boom on h2");
                }
                Ok(())
            })
        })
        .parallel();

        let mut executor = Executor::new(quiet_env());
        let selection = HostSelection {
            hosts: vec!["h1".to_string(), "h2".to_string(), "h3".to_string()],
            ..Default::default()
        };
        let results = executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results.failed_hosts().len(), 1);
        let user = executor.env.user().to_string();
        assert!(results
            .get(&format!("{user}@h3:22"))
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_parallel_pool_bound_is_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let task = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            Task::new("t", move |_ctx| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        }
        .parallel()
        .with_pool_size(2);

        let mut executor = Executor::new(quiet_env());
        let selection = HostSelection {
            hosts: (1..=6).map(|i| format!("h{i}")).collect(),
            ..Default::default()
        };
        let results = executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 6);
        assert!(results.all_succeeded());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_parallel_env_mutations_do_not_leak() {
        let task = Task::new("t", |ctx| {
            Box::pin(async move {
                ctx.env.set("user", "mutated");
                Ok(())
            })
        })
        .parallel();

        let mut env = quiet_env();
        env.set("user", "deploy");
        let mut executor = Executor::new(env);
        let selection = HostSelection {
            hosts: vec!["h1".to_string(), "h2".to_string()],
            ..Default::default()
        };
        executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(executor.env.user(), "deploy");
    }

    #[tokio::test]
    async fn test_before_and_after_hooks_wrap_body() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let t1 = Arc::clone(&trace);
            let t2 = Arc::clone(&trace);
            let t3 = Arc::clone(&trace);
            Task::new("t", move |_ctx| {
                let trace = Arc::clone(&t1);
                Box::pin(async move {
                    trace.lock().await.push("body");
                    Ok(())
                })
            })
            .with_before(move |_ctx| {
                let trace = Arc::clone(&t2);
                Box::pin(async move {
                    trace.lock().await.push("before");
                    Ok(())
                })
            })
            .with_after(move |_ctx| {
                let trace = Arc::clone(&t3);
                Box::pin(async move {
                    trace.lock().await.push("after");
                    Ok(())
                })
            })
        };

        let mut executor = Executor::new(quiet_env());
        let selection = HostSelection {
            hosts: vec!["h1".to_string()],
            ..Default::default()
        };
        executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(*trace.lock().await, vec!["before", "body", "after"]);
    }

    #[tokio::test]
    async fn test_serial_env_changes_carry_to_next_host() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let seen = Arc::clone(&seen);
            Task::new("t", move |ctx| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.lock().await.push(ctx.env.str_of("marker").to_string());
                    ctx.env.set("marker", "set-by-task");
                    Ok(())
                })
            })
        };
        let mut env = quiet_env();
        env.set("marker", "");
        let mut executor = Executor::new(env);
        let selection = HostSelection {
            hosts: vec!["h1".to_string(), "h2".to_string()],
            ..Default::default()
        };
        executor
            .execute(&task, &selection, Vec::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock().await, vec!["", "set-by-task"]);
    }
}
