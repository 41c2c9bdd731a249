use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fabr::hostlist::HostSelection;
use fabr::{Env, Executor, Task};

fn quiet_env() -> Env {
    let mut env = Env::new();
    env.set("user", "deploy");
    env.output.warnings = false;
    env.output.aborts = false;
    env.output.status = false;
    env
}

fn selection(hosts: &[&str]) -> HostSelection {
    HostSelection {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..Default::default()
    }
}

async fn execute(task: &Task, env: Env, hosts: &[&str]) -> fabr::TaskResults {
    Executor::new(env)
        .execute(task, &selection(hosts), Vec::new(), HashMap::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn result_map_has_each_host_exactly_once() {
    let task = Task::new("t", |_ctx| Box::pin(async { Ok(()) }));
    let results = execute(&task, quiet_env(), &["h1", "h2", "h1", "h3"]).await;

    let hosts: Vec<_> = results.hosts().collect();
    assert_eq!(hosts, vec!["deploy@h1:22", "deploy@h2:22", "deploy@h3:22"]);
    assert!(results.all_succeeded());
}

#[tokio::test]
async fn serial_order_follows_host_list() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let task = {
        let seen = Arc::clone(&seen);
        Task::new("t", move |ctx| {
            let seen = Arc::clone(&seen);
            let host = ctx.host_string().unwrap();
            Box::pin(async move {
                seen.lock().unwrap().push(host);
                Ok(())
            })
        })
    };
    execute(&task, quiet_env(), &["h3", "h1", "h2"]).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["deploy@h3:22", "deploy@h1:22", "deploy@h2:22"]
    );
}

#[tokio::test]
async fn serial_abort_returns_error_not_partial_map() {
    // An unskipped serial failure propagates; the remaining hosts never
    // run and no map missing their keys is returned.
    let ran = Arc::new(std::sync::Mutex::new(Vec::new()));
    let task = {
        let ran = Arc::clone(&ran);
        Task::new("t", move |ctx| {
            let ran = Arc::clone(&ran);
            let host = ctx.host_string().unwrap();
            Box::pin(async move {
                ran.lock().unwrap().push(host.clone());
                if host.contains("h2") {
                    anyhow::bail!("h2 exploded");
                }
                Ok(())
            })
        })
    };
    let err = Executor::new(quiet_env())
        .execute(
            &task,
            &selection(&["h1", "h2", "h3"]),
            Vec::new(),
            HashMap::new(),
        )
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("h2 exploded"));
    assert_eq!(*ran.lock().unwrap(), vec!["deploy@h1:22", "deploy@h2:22"]);
}

#[tokio::test]
async fn serial_skip_bad_hosts_keeps_every_key() {
    let task = Task::new("t", |ctx| {
        let host = ctx.host_string().unwrap();
        Box::pin(async move {
            if host.contains("h2") {
                anyhow::bail!("h2 exploded");
            }
            Ok(())
        })
    });
    let mut env = quiet_env();
    env.set("skip_bad_hosts", true);
    let results = execute(&task, env, &["h1", "h2", "h3"]).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results.failed_hosts(), vec!["deploy@h2:22"]);
    assert!(results.get("deploy@h3:22").unwrap().is_ok());
}

#[tokio::test]
async fn parallel_fanout_completes_every_host() {
    let task = Task::new("t", |ctx| {
        let host = ctx.host_string().unwrap();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if host.contains("h2") {
                anyhow::bail!("h2 exploded");
            }
            Ok(())
        })
    })
    .parallel();

    let results = execute(&task, quiet_env(), &["h1", "h2", "h3", "h4"]).await;
    assert_eq!(results.len(), 4);
    assert_eq!(results.failed_hosts(), vec!["deploy@h2:22"]);
    assert!(results.get("deploy@h4:22").unwrap().is_ok());
}

#[tokio::test]
async fn pool_size_bounds_concurrency() {
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
                tokio::time::sleep(Duration::from_millis(25)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }
    .parallel()
    .with_pool_size(3);

    let hosts: Vec<String> = (1..=10).map(|i| format!("h{i}")).collect();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    let results = execute(&task, quiet_env(), &host_refs).await;

    assert_eq!(results.len(), 10);
    assert!(results.all_succeeded());
    assert!(
        peak.load(Ordering::SeqCst) <= 3,
        "more than pool_size workers ran at once"
    );
}

#[tokio::test]
async fn env_parallel_key_switches_mode() {
    // No @parallel on the task; env.parallel drives it, as -P would.
    let task = Task::new("t", |ctx| {
        let parallel = ctx.env.bool_of("parallel");
        Box::pin(async move {
            assert!(parallel);
            Ok(())
        })
    });
    let mut env = quiet_env();
    env.set("parallel", true);
    let results = execute(&task, env, &["h1", "h2"]).await;
    assert!(results.all_succeeded());
}

#[tokio::test]
async fn task_args_reach_the_body() {
    let task = Task::new("t", |ctx| {
        let args = ctx.args.clone();
        let version = ctx.kwargs.get("version").cloned();
        Box::pin(async move {
            assert_eq!(args, vec!["staging"]);
            assert_eq!(version.as_deref(), Some("v2"));
            Ok(())
        })
    });
    let mut kwargs = HashMap::new();
    kwargs.insert("version".to_string(), "v2".to_string());
    let results = Executor::new(quiet_env())
        .execute(
            &task,
            &selection(&["h1"]),
            vec!["staging".to_string()],
            kwargs,
        )
        .await
        .unwrap();
    assert!(results.all_succeeded());
}

#[tokio::test]
async fn empty_host_list_runs_once_locally() {
    let count = Arc::new(AtomicUsize::new(0));
    let task = {
        let count = Arc::clone(&count);
        Task::new("t", move |ctx| {
            let count = Arc::clone(&count);
            let host = ctx.host_string();
            Box::pin(async move {
                assert!(host.is_none());
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    };
    let results = Executor::new(quiet_env())
        .execute(&task, &HostSelection::default(), Vec::new(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 1);
}
