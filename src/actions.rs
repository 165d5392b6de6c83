//! Routing a declared action token to one of four execution strategies: systemctl against a
//! unit, direct systemctl sub-commands, a script runner, or postmulti for multi-instance mail
//! systems.  Mutating actions get a post-action status verification; postmulti additionally
//! gets a settle pause, because its daemons report their state a beat behind the command.

use crate::error::{self, Result};
use crate::exec;
use crate::registry::ConfigEntry;
use crate::settings::GlobalConfig;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;

lazy_static! {
    // The only characters permitted in declared extra arguments.
    static ref SAFE_ARG: Regex = Regex::new(r"^[A-Za-z0-9._:+@/=\-,]+$").unwrap();
    static ref RUNNER: Regex = Regex::new(r"^(bash|sh|perl|exec):(/.+)$").unwrap();
    static ref PM_RUNNING: Regex = Regex::new(
        r"(?im)\bis running\b|\bpid:\s*\d+|^\s*[A-Za-z0-9._-]+:\s+(?:the postfix mail system is\s+)?running\b"
    )
    .unwrap();
    static ref PM_STOPPED: Regex =
        Regex::new(r"(?im)\bnot running\b|\binactive\b|\bstopped\b").unwrap();
}

/// Sub-commands that must never reach systemctl, no matter what an entry declares.
const FORBIDDEN_SUBCOMMANDS: &[&str] = &["poweroff", "reboot", "halt"];

const POSTMULTI_SERVICE: &str = "exec:/usr/sbin/postmulti";

/// Multi-instance mail daemons settle a moment after the control command returns; status reads
/// before that report the old state.
const POSTMULTI_SETTLE: Duration = Duration::from_millis(600);

/// Which execution strategy an entry's service binding selects for a given token.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    Postmulti,
    DaemonReload,
    Runner { kind: String, script: String },
    DirectSystemctl,
    UnitControl { unit: String },
}

fn select_strategy(service: &str, cmd: &str) -> Strategy {
    if service == POSTMULTI_SERVICE {
        return Strategy::Postmulti;
    }
    // daemon-reload has no unit argument and works the same for every binding.
    if cmd == "daemon-reload" {
        return Strategy::DaemonReload;
    }
    if let Some(caps) = RUNNER.captures(service) {
        return Strategy::Runner {
            kind: caps[1].to_string(),
            script: caps[2].to_string(),
        };
    }
    if service == "systemctl" {
        return Strategy::DirectSystemctl;
    }
    Strategy::UnitControl {
        unit: service.to_string(),
    }
}

/// Run `cmd` for `entry`.  The token must be declared in the entry's action table and every
/// declared extra argument must pass the syntactic whitelist; the client never supplies
/// free-form arguments.
pub async fn dispatch(
    global: &GlobalConfig,
    name: &str,
    entry: &ConfigEntry,
    cmd: &str,
) -> Result<Value> {
    let args = entry
        .actions
        .get(cmd)
        .ok_or_else(|| error::Error::ActionUnknown {
            cmd: cmd.to_string(),
        })?;

    for arg in args {
        if !SAFE_ARG.is_match(arg) {
            return error::BadActionArgSnafu { arg: arg.as_str() }.fail();
        }
    }

    match select_strategy(&entry.service, cmd) {
        Strategy::Postmulti => postmulti(global, name, entry, cmd, args).await,
        Strategy::DaemonReload => daemon_reload(global).await,
        Strategy::Runner { kind, script } => runner(&kind, &script, cmd, args).await,
        Strategy::DirectSystemctl => direct_systemctl(global, cmd, args).await,
        Strategy::UnitControl { unit } if unit.is_empty() => {
            // File-management-only entries have nothing to run against.
            error::ActionUnknownSnafu { cmd }.fail()
        }
        Strategy::UnitControl { unit } => unit_control(global, &unit, cmd, args).await,
    }
}

fn systemctl_argv(global: &GlobalConfig, tail: &[&str]) -> Vec<String> {
    let mut argv = Vec::with_capacity(1 + global.systemctl_flags.len() + tail.len());
    argv.push(global.systemctl.clone());
    argv.extend(global.systemctl_flags.iter().cloned());
    argv.extend(tail.iter().map(|s| s.to_string()));
    argv
}

async fn systemctl_rc(global: &GlobalConfig, tail: &[&str]) -> Result<i32> {
    exec::run_rc(exec::COMMAND_TIMEOUT_SECS, &systemctl_argv(global, tail)).await
}

async fn is_active(global: &GlobalConfig, unit: &str) -> Result<bool> {
    let argv = systemctl_argv(global, &["is-active", unit]);
    Ok(exec::run_rc(exec::STATUS_TIMEOUT_SECS, &argv).await? == 0)
}

async fn daemon_reload(global: &GlobalConfig) -> Result<Value> {
    let rc = systemctl_rc(global, &["daemon-reload"]).await?;
    Ok(json!({ "ok": rc == 0, "action": "daemon-reload", "rc": rc }))
}

async fn direct_systemctl(global: &GlobalConfig, cmd: &str, args: &[String]) -> Result<Value> {
    if FORBIDDEN_SUBCOMMANDS.contains(&cmd) {
        return error::ActionForbiddenSnafu { cmd }.fail();
    }
    let mut tail = vec![cmd];
    tail.extend(args.iter().map(String::as_str));
    let rc = systemctl_rc(global, &tail).await?;
    Ok(json!({ "ok": rc == 0, "action": cmd, "rc": rc }))
}

async fn unit_control(
    global: &GlobalConfig,
    unit: &str,
    cmd: &str,
    args: &[String],
) -> Result<Value> {
    let rc = match cmd {
        "stop_start" => {
            systemctl_rc(global, &["stop", unit]).await?;
            systemctl_rc(global, &["start", unit]).await?
        }
        "restart" => systemctl_rc(global, &["restart", unit]).await?,
        "reload" => {
            // Reloading a stopped unit either fails or, worse, starts it; refuse instead.
            if !is_active(global, unit).await? {
                return error::ServiceNotActiveSnafu { unit }.fail();
            }
            systemctl_rc(global, &["reload", unit]).await?
        }
        "start" => systemctl_rc(global, &["start", unit]).await?,
        "stop" => systemctl_rc(global, &["stop", unit]).await?,
        other => {
            let mut tail = vec![other, unit];
            tail.extend(args.iter().map(String::as_str));
            let rc = systemctl_rc(global, &tail).await?;
            return Ok(json!({ "ok": rc == 0, "action": other, "rc": rc }));
        }
    };

    // Verify what actually happened rather than trusting the control command's exit code.
    // For stop, success means the unit is NOT running.
    let running = is_active(global, unit).await?;
    let ok = if cmd == "stop" { !running } else { running };
    Ok(json!({
        "ok": ok,
        "action": cmd,
        "status": if running { "running" } else { "stopped" },
        "rc": rc,
    }))
}

async fn runner(kind: &str, script: &str, cmd: &str, args: &[String]) -> Result<Value> {
    let mut argv: Vec<String> = match kind {
        "perl" => vec!["/usr/bin/perl".to_string(), script.to_string()],
        "bash" => vec!["/bin/bash".to_string(), script.to_string()],
        "sh" => vec!["/bin/sh".to_string(), script.to_string()],
        // exec: runs the script itself; no interpreter in front of it.
        _ => vec![script.to_string()],
    };

    if kind == "exec" && script.ends_with("/systemctl") {
        if let Some(first) = args.first() {
            if FORBIDDEN_SUBCOMMANDS.contains(&first.as_str()) {
                return error::ActionForbiddenSnafu { cmd: first.as_str() }.fail();
            }
        }
    }

    argv.extend(args.iter().cloned());
    let cap = exec::capture(exec::COMMAND_TIMEOUT_SECS, &argv).await?;

    // A wrapped `is-active` probe is a status read, not a mutation; report the state instead
    // of pass/fail.
    if args.first().map(String::as_str) == Some("is-active") {
        return Ok(json!({
            "ok": true,
            "action": cmd,
            "status": if cap.rc == 0 { "running" } else { "stopped" },
            "rc": cap.rc,
        }));
    }

    Ok(json!({ "ok": cap.rc == 0, "action": cmd, "rc": cap.rc, "output": cap.out }))
}

async fn postmulti(
    global: &GlobalConfig,
    name: &str,
    entry: &ConfigEntry,
    cmd: &str,
    args: &[String],
) -> Result<Value> {
    let bin = entry
        .service
        .strip_prefix("exec:")
        .unwrap_or(&entry.service)
        .to_string();

    let mut argv = vec![bin.clone()];
    argv.extend(args.iter().cloned());
    let primary = exec::capture(exec::COMMAND_TIMEOUT_SECS, &argv).await?;

    if matches!(cmd, "stop" | "start" | "reload" | "restart") {
        tokio::time::sleep(POSTMULTI_SETTLE).await;
    }

    let status_args: Vec<String> = match entry.actions.get("status") {
        Some(declared) if !declared.is_empty() => declared.clone(),
        _ => vec![
            "-i".to_string(),
            name.to_string(),
            "-p".to_string(),
            "status".to_string(),
        ],
    };
    let mut status_argv = vec![bin];
    status_argv.extend(status_args);
    let status = exec::capture(exec::STATUS_TIMEOUT_SECS, &status_argv).await?;

    let state = parse_postmulti_state(&status.out, status.rc);
    let ok = match cmd {
        "stop" => state == "stopped",
        "status" => true,
        _ => state == "running",
    };

    Ok(json!({
        "ok": ok,
        "action": cmd,
        "status": state,
        "state": state,
        "rc": primary.rc,
        "output": primary.out,
    }))
}

/// Postmulti speaks prose, not exit codes.  Match the known phrasings case-insensitively and
/// only fall back to the exit code when the text is inconclusive.
fn parse_postmulti_state(out: &str, rc: i32) -> &'static str {
    if PM_RUNNING.is_match(out) {
        return "running";
    }
    if PM_STOPPED.is_match(out) {
        return "stopped";
    }
    match rc {
        0 => "running",
        1 => "stopped",
        _ => "unknown",
    }
}
