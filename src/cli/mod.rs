//! The `fab`-style command-line driver.
//!
//! Task discovery is the embedding binary's concern: it registers its tasks
//! in a [`TaskRegistry`] and hands control to [`run`], which parses flags,
//! seeds the environment, resolves hosts and fans each named task out.

mod taskargs;

pub use taskargs::{parse_invocation, TaskInvocation};

use clap::Parser;
use owo_colors::OwoColorize;
use std::path::PathBuf;

use crate::config::Config;
use crate::env::{Env, Group, Value};
use crate::executor::Executor;
use crate::hostlist::HostSelection;
use crate::task::TaskRegistry;
use crate::utils::{interrupt, logging};

/// Exit code for abort-level failures.
const EXIT_FAILURE: i32 = 1;
/// Exit code for argument or task-resolution errors.
const EXIT_USAGE: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "fab",
    version,
    about = "Run tasks across a fleet of hosts over SSH",
    long_about = None
)]
pub struct Cli {
    #[arg(
        short = 'H',
        long = "hosts",
        value_delimiter = ',',
        help = "Comma-separated list of target hosts ([user@]host[:port])"
    )]
    pub hosts: Option<Vec<String>>,

    #[arg(
        short = 'R',
        long = "roles",
        value_delimiter = ',',
        help = "Comma-separated list of roles to target"
    )]
    pub roles: Option<Vec<String>>,

    #[arg(
        short = 'x',
        long = "exclude-hosts",
        value_delimiter = ',',
        help = "Hosts to exclude from the resolved list"
    )]
    pub exclude_hosts: Option<Vec<String>>,

    #[arg(short = 'u', long, help = "Default username for SSH connections")]
    pub user: Option<String>,

    #[arg(short = 'p', long, help = "Password for SSH and sudo")]
    pub password: Option<String>,

    #[arg(
        short = 'i',
        long = "identity",
        help = "SSH private key file (repeatable)"
    )]
    pub identity: Vec<PathBuf>,

    #[arg(short = 'P', long, help = "Run tasks across hosts in parallel")]
    pub parallel: bool,

    #[arg(
        short = 'z',
        long = "pool-size",
        help = "Maximum concurrent hosts in parallel mode"
    )]
    pub pool_size: Option<usize>,

    #[arg(short = 't', long, help = "Connection timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(
        short = 'T',
        long = "command-timeout",
        help = "Remote command timeout in seconds"
    )]
    pub command_timeout: Option<u64>,

    #[arg(
        short = 'w',
        long = "warn-only",
        help = "Warn instead of aborting on failed commands"
    )]
    pub warn_only: bool,

    #[arg(short = 's', long, help = "Shell used to wrap remote commands")]
    pub shell: Option<String>,

    #[arg(short = 'g', long, help = "Gateway (bastion) host to tunnel through")]
    pub gateway: Option<String>,

    #[arg(short = 'k', long = "no-keys", help = "Don't load default identity files")]
    pub no_keys: bool,

    #[arg(short = 'A', long = "no-agent", help = "Don't use the SSH agent")]
    pub no_agent: bool,

    #[arg(
        short = 'a',
        long = "abort-on-prompts",
        help = "Abort instead of prompting for input"
    )]
    pub abort_on_prompts: bool,

    #[arg(long, value_delimiter = ',', help = "Output groups to hide")]
    pub hide: Vec<String>,

    #[arg(long, value_delimiter = ',', help = "Output groups to show")]
    pub show: Vec<String>,

    #[arg(short = 'l', long = "list", help = "List available tasks and exit")]
    pub list: bool,

    #[arg(
        short = 'd',
        long = "display",
        value_name = "TASK",
        help = "Show a task's documentation and exit"
    )]
    pub display: Option<String>,

    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        help = "Set an env key (repeatable; bare KEY means true)"
    )]
    pub set: Vec<String>,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    #[arg(value_name = "TASK[:ARG,KEY=VAL]", help = "Tasks to execute, in order")]
    pub tasks: Vec<String>,
}

/// Parse the command line and run the named tasks from `registry`.
/// Returns the process exit code.
pub async fn run(registry: TaskRegistry) -> i32 {
    let cli = Cli::parse();
    run_with(cli, registry).await
}

/// [`run`] with pre-parsed arguments; the testable entry point.
pub async fn run_with(cli: Cli, registry: TaskRegistry) -> i32 {
    logging::init_logging(cli.verbose);

    let mut env = Env::new();
    let config = match &cli.config {
        Some(path) => Config::load(path).await,
        None => Config::load_default().await,
    };
    match config {
        Ok(config) => config.apply(&mut env),
        Err(e) => {
            eprintln!("{e:#}");
            return EXIT_USAGE;
        }
    }

    if let Err(message) = apply_flags(&cli, &mut env) {
        eprintln!("{message}");
        return EXIT_USAGE;
    }

    if cli.list {
        print_task_list(&registry);
        return 0;
    }
    if let Some(name) = &cli.display {
        return match registry.get(name) {
            Some(task) => {
                println!("Displaying detailed information for task '{name}':\n");
                println!(
                    "    {}",
                    task.doc.as_deref().unwrap_or("No docstring provided")
                );
                0
            }
            None => {
                eprintln!("Task not found: {name}");
                EXIT_USAGE
            }
        };
    }

    // Resolve invocations up front so a typo aborts before any host runs.
    let mut invocations = Vec::new();
    if cli.tasks.is_empty() {
        match registry.default_task() {
            Some(task) => invocations.push(TaskInvocation {
                name: task.name.clone(),
                args: Vec::new(),
                kwargs: Default::default(),
            }),
            None => {
                eprintln!("No tasks specified. Available tasks:\n");
                print_task_list(&registry);
                return EXIT_USAGE;
            }
        }
    } else {
        for spec in &cli.tasks {
            match parse_invocation(spec) {
                Ok(invocation) => invocations.push(invocation),
                Err(message) => {
                    eprintln!("{message}");
                    return EXIT_USAGE;
                }
            }
        }
    }
    for invocation in &invocations {
        if registry.get(&invocation.name).is_none() {
            eprintln!("Task not found: {}", invocation.name);
            return EXIT_USAGE;
        }
    }

    interrupt::install_sigint_handler();

    let mut executor = Executor::new(env);
    let mut exit_code = 0;
    for invocation in invocations {
        let task = registry
            .get(&invocation.name)
            .expect("invocations were validated above")
            .clone();
        match executor
            .execute(
                &task,
                &HostSelection::default(),
                invocation.args,
                invocation.kwargs,
            )
            .await
        {
            Ok(results) => {
                if !results.all_succeeded() {
                    exit_code = EXIT_FAILURE;
                    if !executor.env.bool_of("skip_bad_hosts") {
                        break;
                    }
                }
            }
            Err(e) => {
                if matches!(
                    e.downcast_ref::<crate::errors::Error>(),
                    Some(crate::errors::Error::BadHostString(_))
                ) {
                    // Host resolution failed before any host ran.
                    eprintln!("{e}");
                    executor.shutdown().await;
                    return EXIT_USAGE;
                }
                // An aborted serial walk; the abort line was already
                // printed through the multiplexer.
                exit_code = EXIT_FAILURE;
                break;
            }
        }
        if interrupt::stop_requested() {
            exit_code = EXIT_FAILURE;
            break;
        }
    }

    if exit_code == 0 {
        crate::output::status(&executor.env.output, "\nDone.");
    }
    executor.shutdown().await;
    exit_code
}

fn print_task_list(registry: &TaskRegistry) {
    if registry.is_empty() {
        println!("No tasks registered");
        return;
    }
    println!("Available tasks:\n");
    let width = registry
        .iter()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(0);
    for task in registry.iter() {
        let summary = task
            .doc
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("");
        let marker = if task.default { " (default)" } else { "" };
        if summary.is_empty() {
            println!("    {}{marker}", task.name.bold());
        } else {
            println!("    {:width$}  {summary}{marker}", task.name.bold());
        }
    }
}

/// Fold the CLI flags into the environment. String errors become usage
/// errors upstream.
fn apply_flags(cli: &Cli, env: &mut Env) -> Result<(), String> {
    if let Some(hosts) = &cli.hosts {
        env.set("hosts", hosts.clone());
    }
    if let Some(roles) = &cli.roles {
        env.set("roles", roles.clone());
    }
    if let Some(excludes) = &cli.exclude_hosts {
        env.set("exclude_hosts", excludes.clone());
    }
    if let Some(user) = &cli.user {
        env.set("user", user.clone());
    }
    if let Some(password) = &cli.password {
        env.set("password", password.clone());
    }
    if !cli.identity.is_empty() {
        env.set(
            "key_filename",
            cli.identity
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
        );
    }
    if cli.parallel {
        env.set("parallel", true);
    }
    if let Some(pool_size) = cli.pool_size {
        env.set("pool_size", pool_size as i64);
    }
    if let Some(timeout) = cli.timeout {
        env.set("timeout", timeout as i64);
    }
    if let Some(command_timeout) = cli.command_timeout {
        env.set("command_timeout", command_timeout as i64);
    }
    if cli.warn_only {
        env.set("warn_only", true);
    }
    if let Some(shell) = &cli.shell {
        env.set("shell", shell.clone());
    }
    if let Some(gateway) = &cli.gateway {
        env.set("gateway", gateway.clone());
    }
    if cli.no_keys {
        env.set("no_keys", true);
    }
    if cli.no_agent {
        env.set("no_agent", true);
    }
    if cli.abort_on_prompts {
        env.set("abort_on_prompts", true);
    }

    for entry in &cli.set {
        let (key, value) = match entry.split_once('=') {
            Some((k, v)) => (k, parse_set_value(v)),
            None => (entry.as_str(), Value::Bool(true)),
        };
        if key.is_empty() {
            return Err(format!("--set needs a key: {entry:?}"));
        }
        env.set(key, value);
    }

    let parse_groups = |names: &[String]| -> Result<Vec<Group>, String> {
        names.iter().map(|n| n.parse::<Group>()).collect()
    };
    let hidden = parse_groups(&cli.hide)?;
    env.hide(&hidden);
    let shown = parse_groups(&cli.show)?;
    env.show(&shown);

    Ok(())
}

fn parse_set_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        Value::Bool(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Value::Bool(false)
    } else if let Ok(n) = raw.parse::<i64>() {
        Value::Int(n)
    } else {
        Value::Str(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fab").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flag_mapping() {
        let cli = parse(&[
            "-H",
            "h1,h2",
            "-R",
            "web",
            "-x",
            "h2",
            "-u",
            "deploy",
            "-P",
            "-z",
            "4",
            "-w",
            "-g",
            "bastion",
            "-a",
            "deploy",
        ]);
        let mut env = Env::new();
        apply_flags(&cli, &mut env).unwrap();

        assert_eq!(env.list_of("hosts"), vec!["h1", "h2"]);
        assert_eq!(env.list_of("roles"), vec!["web"]);
        assert_eq!(env.list_of("exclude_hosts"), vec!["h2"]);
        assert_eq!(env.user(), "deploy");
        assert!(env.bool_of("parallel"));
        assert_eq!(env.pool_size(), 4);
        assert!(env.warn_only());
        assert_eq!(env.gateway(), Some("bastion"));
        assert!(env.abort_on_prompts());
        assert_eq!(cli.tasks, vec!["deploy"]);
    }

    #[test]
    fn test_set_values_are_typed() {
        let cli = parse(&["--set", "keepalive=30", "--set", "linewise", "--set", "shell=/bin/sh", "t"]);
        let mut env = Env::new();
        apply_flags(&cli, &mut env).unwrap();
        assert_eq!(env.keepalive(), Some(30));
        assert!(env.bool_of("linewise"));
        assert_eq!(env.shell(), "/bin/sh");
    }

    #[test]
    fn test_hide_and_show_groups() {
        let cli = parse(&["--hide", "running,stdout", "--show", "debug", "t"]);
        let mut env = Env::new();
        apply_flags(&cli, &mut env).unwrap();
        assert!(!env.output.running);
        assert!(!env.output.stdout);
        assert!(env.output.debug);
    }

    #[test]
    fn test_bad_group_is_usage_error() {
        let cli = parse(&["--hide", "bogus", "t"]);
        let mut env = Env::new();
        assert!(apply_flags(&cli, &mut env).is_err());
    }

    #[test]
    fn test_identity_files() {
        let cli = parse(&["-i", "/tmp/a", "-i", "/tmp/b", "t"]);
        let mut env = Env::new();
        apply_flags(&cli, &mut env).unwrap();
        assert_eq!(env.list_of("key_filename"), vec!["/tmp/a", "/tmp/b"]);
    }
}
