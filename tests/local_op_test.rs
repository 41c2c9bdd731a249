use std::sync::Arc;
use tokio::sync::Mutex;

use fabr::ssh::ConnectionCache;
use fabr::{Env, Error, TaskContext};

fn ctx() -> TaskContext {
    let mut env = Env::new();
    env.output.running = false;
    env.output.warnings = false;
    TaskContext::new(env, Arc::new(Mutex::new(ConnectionCache::new())))
}

#[tokio::test]
async fn captured_local_command_buffers_output() {
    let mut ctx = ctx();
    let result = ctx.local("printf 'a\\nb'", true).await.unwrap();
    assert_eq!(result.stdout, "a\nb");
    assert_eq!(result.return_code, 0);
    assert!(result.succeeded());
    assert_eq!(result.command, "printf 'a\\nb'");
}

#[tokio::test]
async fn failing_local_command_aborts() {
    let mut ctx = ctx();
    let err = ctx.local("false", true).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CommandFailed { .. })
    ));
}

#[tokio::test]
async fn warn_only_returns_the_failed_result() {
    // S5: run('false', warn_only=True) returns a failed result and
    // execution continues.
    let mut ctx = ctx();
    ctx.env.set("warn_only", true);
    let result = ctx.local("exit 7", true).await.unwrap();
    assert!(result.failed());
    assert!(!result.succeeded());
    assert_eq!(result.return_code, 7);
}

#[tokio::test]
async fn scoped_warn_only_override() {
    let mut ctx = ctx();
    let result = ctx
        .with_settings(
            vec![("warn_only".to_string(), fabr::Value::Bool(true))],
            |ctx| Box::pin(async move { ctx.local("exit 1", true).await }),
        )
        .await
        .unwrap();
    assert!(result.failed());

    // Outside the scope the default abort policy is back.
    assert!(ctx.local("exit 1", true).await.is_err());
}
