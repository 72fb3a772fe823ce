//! Shared command dispatch for the REPL and the line socket: both
//! surfaces speak the same line-oriented command language, so the
//! parsing and response formatting lives here once.

use crate::format::format_status_line;
use std::path::PathBuf;
use std::sync::Arc;
use taskmaster_core::{SignalName, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shared state every command needs: the live Supervisor, the config
/// path for `reload`, and the token that tells the daemon's outer loops
/// to wind down on `shutdown`.
#[derive(Clone)]
pub struct CommandContext {
    pub supervisor: Arc<Supervisor>,
    pub config_path: PathBuf,
    pub shutdown: CancellationToken,
}

enum Op {
    Start,
    Stop,
    Restart,
}

impl Op {
    fn verb(&self) -> &'static str {
        match self {
            Op::Start => "start",
            Op::Stop => "stop",
            Op::Restart => "restart",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            Op::Start => "Started",
            Op::Stop => "Stopped",
            Op::Restart => "Restarted",
        }
    }
}

/// Parses one command line and returns the response lines to print or
/// send back. Never panics on malformed input — unknown/malformed
/// commands just produce an error line.
pub async fn dispatch(line: &str, ctx: &CommandContext) -> Vec<String> {
    let mut parts = line.trim().split_whitespace();
    let cmd = match parts.next() {
        Some(c) => c,
        None => return Vec::new(),
    };
    let arg1 = parts.next();
    let arg2 = parts.next();

    match cmd {
        "status" => status_lines(ctx, arg1).await,
        "start" => simple_op(ctx, arg1, Op::Start).await,
        "stop" => simple_op(ctx, arg1, Op::Stop).await,
        "restart" => simple_op(ctx, arg1, Op::Restart).await,
        "reload" => vec![reload(ctx).await],
        "config" => config_lines(ctx, arg1).await,
        "signal" => signal_lines(ctx, arg1, arg2).await,
        "shutdown" => {
            ctx.shutdown.cancel();
            vec!["shutting down".to_string()]
        }
        "version" => vec![format!("taskmaster {}", taskmaster_core::version())],
        "help" => vec![help_text(arg1)],
        "exit" | "quit" => Vec::new(),
        _ => vec!["Unknown command".to_string()],
    }
}

async fn status_lines(ctx: &CommandContext, name: Option<&str>) -> Vec<String> {
    match ctx.supervisor.status(name).await {
        Ok(statuses) => {
            let mut lines = Vec::new();
            for program in statuses {
                for worker in &program.workers {
                    lines.push(format_status_line(&program.name, worker));
                }
            }
            lines
        }
        Err(e) => vec![format!("status failed: {e}")],
    }
}

async fn simple_op(ctx: &CommandContext, target: Option<&str>, op: Op) -> Vec<String> {
    let Some(target) = target else {
        return vec![format!("Usage: {} <name|all>", op.verb())];
    };

    if target == "all" {
        match op {
            Op::Start => ctx.supervisor.start_all().await,
            Op::Stop => ctx.supervisor.stop_all(false).await,
            Op::Restart => ctx.supervisor.restart_all(false).await,
        }
        return vec![format!("{} all", op.past_tense())];
    }

    let result = match op {
        Op::Start => ctx.supervisor.start(target).await,
        Op::Stop => ctx.supervisor.stop(target, false).await,
        Op::Restart => ctx.supervisor.restart(target, false).await,
    };

    match result {
        Ok(()) => vec![format!("{} {target}", op.past_tense())],
        Err(e) => vec![format!("{} failed: {e}", op.verb())],
    }
}

async fn config_lines(ctx: &CommandContext, name: Option<&str>) -> Vec<String> {
    let Some(name) = name else {
        return vec!["Usage: config <name>".to_string()];
    };

    match ctx.supervisor.config(name).await {
        Ok(spec) => vec![
            format!("name: {}", spec.name),
            format!("command: {}", spec.command),
            format!("num_procs: {}", spec.num_procs),
            format!("autostart: {}", spec.autostart),
            format!("restart_policy: {:?}", spec.restart_policy),
            format!("start_retries: {}", spec.start_retries),
            format!("start_secs: {}", spec.start_secs),
            format!("stop_signal: {}", spec.stop_signal),
            format!("stop_secs: {}", spec.stop_secs),
            format!("working_dir: {}", spec.working_dir.display()),
            format!("umask: {:#o}", spec.umask),
            format!("discard_output: {}", spec.discard_output),
        ],
        Err(e) => vec![format!("config failed: {e}")],
    }
}

async fn signal_lines(ctx: &CommandContext, name: Option<&str>, sig: Option<&str>) -> Vec<String> {
    let (Some(name), Some(sig)) = (name, sig) else {
        return vec!["Usage: signal <name> <SIG>".to_string()];
    };

    let signal: SignalName = match sig.parse() {
        Ok(s) => s,
        Err(e) => return vec![format!("signal failed: {e}")],
    };

    match ctx.supervisor.signal(name, signal).await {
        Ok(()) => vec![format!("Signaled {name} with {signal}")],
        Err(e) => vec![format!("signal failed: {e}")],
    }
}

async fn reload(ctx: &CommandContext) -> String {
    match taskmaster_config::load(&ctx.config_path) {
        Ok(catalog) => {
            for warning in &catalog.warnings {
                warn!(%warning, "program dropped during reload");
            }
            ctx.supervisor.reload(catalog.programs).await;
            "Configuration reloaded".to_string()
        }
        Err(e) => format!("Configuration reload failed: {e}"),
    }
}

fn help_text(topic: Option<&str>) -> String {
    match topic {
        Some(topic) => match topic {
            "status" => "status [name] - show worker states, one line per instance".to_string(),
            "start" => "start <name|all> - start every instance of a program".to_string(),
            "stop" => "stop <name|all> - stop every instance of a program".to_string(),
            "restart" => "restart <name|all> - stop then start a program".to_string(),
            "reload" => "reload - re-read the config file and reconcile the catalog".to_string(),
            "config" => "config <name> - print the effective spec for a program".to_string(),
            "signal" => "signal <name> <SIG> - send a signal to every running instance".to_string(),
            "shutdown" => "shutdown - stop every program and exit the daemon".to_string(),
            other => format!("no help available for `{other}`"),
        },
        None => {
            "commands: status [name], start <name|all>, stop <name|all>, restart <name|all>, \
             reload, config <name>, signal <name> <SIG>, shutdown, exit|quit, help [cmd], version"
                .to_string()
        }
    }
}
