//! A small fabfile: build locally, ship the artifact, restart the service.
//!
//! Run with e.g.
//!   cargo run --example fabfile -- -H deploy@web1,deploy@web2 -P deploy
//!   cargo run --example fabfile -- -R web restart
//!   cargo run --example fabfile -- -l

use fabr::{PutOptions, RunOptions, SudoOptions, Task, TaskRegistry};

fn tasks() -> TaskRegistry {
    let mut tasks = TaskRegistry::new();

    tasks.register(
        Task::new("host_type", |ctx| {
            Box::pin(async move {
                ctx.run("uname -s", RunOptions::default()).await?;
                Ok(())
            })
        })
        .with_doc("Print each host's kernel name"),
    );

    tasks.register(
        Task::new("deploy", |ctx| {
            Box::pin(async move {
                let version = ctx
                    .kwargs
                    .get("version")
                    .cloned()
                    .unwrap_or_else(|| "latest".to_string());
                ctx.local("cargo build --release", false).await?;
                ctx.put(
                    "target/release/myapp",
                    "/opt/myapp/bin/myapp.new",
                    PutOptions {
                        mirror_local_mode: true,
                        ..Default::default()
                    },
                )
                .await?;
                ctx.sudo(
                    "mv /opt/myapp/bin/myapp.new /opt/myapp/bin/myapp && systemctl restart myapp",
                    SudoOptions::default(),
                )
                .await?;
                ctx.run(
                    &format!("curl -fsS localhost:8080/health?expect={version}"),
                    RunOptions {
                        warn_only: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(())
            })
        })
        .with_roles(["web"])
        .parallel()
        .with_pool_size(4)
        .with_doc("Build the release binary and roll it out to the web role"),
    );

    tasks.register(
        Task::new("restart", |ctx| {
            Box::pin(async move {
                ctx.sudo("systemctl restart myapp", SudoOptions::default())
                    .await?;
                Ok(())
            })
        })
        .with_roles(["web"])
        .with_doc("Restart the application service"),
    );

    tasks.register(
        Task::new("fetch_logs", |ctx| {
            Box::pin(async move {
                ctx.get(
                    "/var/log/myapp/*.log",
                    "logs/",
                    fabr::GetOptions {
                        use_sudo: true,
                        ..Default::default()
                    },
                )
                .await?;
                Ok(())
            })
        })
        .with_doc("Download application logs from each host"),
    );

    tasks
}

#[tokio::main]
async fn main() {
    std::process::exit(fabr::cli::run(tasks()).await);
}
