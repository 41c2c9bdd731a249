use std::sync::Arc;
use tokio::sync::Mutex;

use fabr::env::Value;
use fabr::ssh::ConnectionCache;
use fabr::{Env, TaskContext};

fn ctx() -> TaskContext {
    TaskContext::new(Env::new(), Arc::new(Mutex::new(ConnectionCache::new())))
}

#[tokio::test]
async fn settings_restore_after_normal_exit() {
    let mut ctx = ctx();
    ctx.env.set("warn_only", false);
    ctx.env.set("user", "deploy");

    ctx.with_settings(
        vec![
            ("warn_only".to_string(), Value::Bool(true)),
            ("user".to_string(), Value::Str("other".to_string())),
        ],
        |ctx| {
            Box::pin(async move {
                assert!(ctx.env.warn_only());
                assert_eq!(ctx.env.user(), "other");
            })
        },
    )
    .await;

    assert!(!ctx.env.warn_only());
    assert_eq!(ctx.env.user(), "deploy");
}

#[tokio::test]
async fn settings_restore_after_failure() {
    let mut ctx = ctx();
    ctx.env.set("port", 22i64);

    let result: anyhow::Result<()> = ctx
        .with_settings(vec![("port".to_string(), Value::Int(2222))], |ctx| {
            Box::pin(async move {
                assert_eq!(ctx.env.port(), 2222);
                anyhow::bail!("task blew up mid-scope")
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(ctx.env.port(), 22);
}

#[tokio::test]
async fn nested_settings_compose() {
    let mut ctx = ctx();
    let base_depth = ctx.env.scope_depth();

    ctx.with_settings(vec![("port".to_string(), Value::Int(2222))], |ctx| {
        Box::pin(async move {
            ctx.with_settings(vec![("port".to_string(), Value::Int(2022))], |ctx| {
                Box::pin(async move {
                    assert_eq!(ctx.env.port(), 2022);
                })
            })
            .await;
            assert_eq!(ctx.env.port(), 2222);
        })
    })
    .await;

    assert_eq!(ctx.env.port(), 22);
    assert_eq!(ctx.env.scope_depth(), base_depth);
}

#[tokio::test]
async fn keys_set_inside_scope_do_not_survive_it() {
    let mut ctx = ctx();
    ctx.with_settings(Vec::new(), |ctx| {
        Box::pin(async move {
            ctx.env.set("marker", "inside");
            assert_eq!(ctx.env.str_of("marker"), "inside");
        })
    })
    .await;
    assert_eq!(ctx.env.str_of("marker"), "");
}

#[tokio::test]
async fn passwords_learned_inside_scope_survive_it() {
    let mut ctx = ctx();
    ctx.with_settings(Vec::new(), |ctx| {
        Box::pin(async move {
            ctx.env.set_password_for("deploy@h1:22", "hunter2");
        })
    })
    .await;
    assert_eq!(
        ctx.env.password_for("deploy@h1:22").as_deref(),
        Some("hunter2")
    );
}
