//! Command-line flags and the interactive console grammar.

use std::path::PathBuf;

use clap::Parser;
use tgs_core::storage::ExportFormat;

/// Telegram group scanner: watches groups for relevant messages
#[derive(Parser, Debug)]
#[command(name = "tgs", version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json", env = "TGS_CONFIG")]
    pub config: PathBuf,

    /// Start, scan for --duration seconds (or until Ctrl-C), then print a report
    #[arg(short, long)]
    pub batch: bool,

    /// Batch run length in seconds
    #[arg(short, long, requires = "batch")]
    pub duration: Option<u64>,

    /// Log level for our crates (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Status,
    Report,
    List,
    Config,
    Reload,
    Export {
        format: ExportFormat,
        path: Option<PathBuf>,
    },
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  start                  discover groups, scan history and start monitoring
  stop                   stop monitoring
  pause                  pause monitoring
  resume                 resume monitoring
  status                 show scanner status
  report                 show today's scanning report
  list                   list discovered groups
  config                 show the active configuration (secrets masked)
  reload                 re-read the configuration and apply new filter criteria
  export <fmt> [path]    export stored messages (json, csv, txt)
  help                   show this help
  quit                   stop and exit";

impl ConsoleCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(None);
        };

        let cmd = match head.to_lowercase().as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "status" => Self::Status,
            "report" => Self::Report,
            "list" => Self::List,
            "config" => Self::Config,
            "reload" => Self::Reload,
            "export" => {
                let format = words
                    .next()
                    .ok_or_else(|| "usage: export <json|csv|txt> [path]".to_string())?
                    .parse::<ExportFormat>()
                    .map_err(|e| e.to_string())?;
                Self::Export {
                    format,
                    path: words.next().map(PathBuf::from),
                }
            }
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command: {other} (try 'help')")),
        };

        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument: {extra}"));
        }
        Ok(Some(cmd))
    }
}
