//! Interactive command loop over stdin.

use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use tgs_core::{
    command::{CommandInterface, CommandResult, ScannerState},
    config::{ConfigManager, ScannerConfig},
};

use crate::cli::{ConsoleCommand, HELP};

pub async fn run(cmd: CommandInterface, mut configs: ConfigManager) -> anyhow::Result<()> {
    println!("Telegram group scanner. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            r = lines.next_line() => r.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let parsed = match ConsoleCommand::parse(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if parsed == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(&cmd, &mut configs, parsed).await {
            warn!(error = %e, "command failed");
            println!("Error: {e:#}");
        }
    }

    shutdown(&cmd).await;
    Ok(())
}

async fn execute(
    cmd: &CommandInterface,
    configs: &mut ConfigManager,
    command: ConsoleCommand,
) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Start => print_result(&cmd.start().await),
        ConsoleCommand::Stop => print_result(&cmd.stop().await),
        ConsoleCommand::Pause => print_result(&cmd.pause().await),
        ConsoleCommand::Resume => print_result(&cmd.resume().await),
        ConsoleCommand::Status => print_json(&cmd.get_status().await)?,
        ConsoleCommand::Report => print_json(&cmd.generate_report(None, None).await)?,
        ConsoleCommand::List => {
            let groups = match cmd.app().components() {
                Some(c) => c.scanner.discovered_groups().await,
                None => Vec::new(),
            };
            if groups.is_empty() {
                println!("No groups discovered yet. Run 'start' first.");
            }
            for g in groups {
                let handle = g.username.map(|u| format!(" @{u}")).unwrap_or_default();
                println!(
                    "{:>16}  {}{}  ({} members)",
                    g.id, g.title, handle, g.member_count
                );
            }
        }
        ConsoleCommand::Config => {
            let cfg = configs
                .current()
                .cloned()
                .unwrap_or_else(|| cmd.app().config().clone());
            print_json(&masked_config(&cfg)?)?;
        }
        ConsoleCommand::Reload => {
            let cfg = configs.reload().context("reloading configuration")?;
            cmd.app().reload_filter(&cfg.relevance);
            println!(
                "Configuration reloaded: {} keywords, {} patterns, logic {}",
                cfg.relevance.keywords.len(),
                cfg.relevance.regex_patterns.len(),
                cfg.relevance.logic
            );
        }
        ConsoleCommand::Export { format, path } => {
            let Some(c) = cmd.app().components() else {
                println!("Nothing to export yet. Run 'start' first.");
                return Ok(());
            };
            match c.storage.export_data(format, path).await? {
                Some(out) => println!("Exported to {}", out.display()),
                None => println!("No stored messages to export."),
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

/// Stop a live scanner before exit; give it a bounded amount of time.
pub async fn shutdown(cmd: &CommandInterface) {
    if cmd.current_state().await == ScannerState::Stopped {
        return;
    }
    match tokio::time::timeout(Duration::from_secs(10), cmd.stop()).await {
        Ok(res) => print_result(&res),
        Err(_) => warn!("scanner did not stop within 10s"),
    }
}

pub fn print_result(res: &CommandResult) {
    let mark = if res.success { "ok" } else { "failed" };
    match res.groups_monitored {
        Some(n) => println!("[{mark}] {} ({n} groups, state: {})", res.message, res.state),
        None => println!("[{mark}] {} (state: {})", res.message, res.state),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

const SECRET_KEYS: [(&str, &str); 3] = [
    ("api_credentials", "api_hash"),
    ("api_credentials", "bot_token"),
    ("ai_responder", "api_key"),
];

fn masked_config(cfg: &ScannerConfig) -> anyhow::Result<Value> {
    let mut v = serde_json::to_value(cfg)?;
    for (section, key) in SECRET_KEYS {
        if let Some(slot) = v.get_mut(section).and_then(|s| s.get_mut(key)) {
            if slot.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                *slot = Value::String("********".to_string());
            }
        }
    }
    Ok(v)
}
