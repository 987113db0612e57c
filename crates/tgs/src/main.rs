use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info, warn};

use tgs_core::{
    app::{Ports, ScannerApp},
    command::{CommandInterface, ScannerState},
    config::{ConfigManager, ScannerConfig},
    logging::{self, LogOptions},
    ports::{OcrEngine, ResponseGenerator, TelegramClient},
    resilience::ErrorHandler,
};
use tgs_openai::OpenAiGenerator;
use tgs_telegram::TelegramBot;
use tgs_tesseract::TesseractOcr;

mod cli;
mod console;

use cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let _log = logging::init(
        "tgs",
        &LogOptions {
            level: Some(args.log_level.clone()),
            log_file: args.log_file.clone(),
        },
    )?;

    let mut configs = ConfigManager::new(&args.config);
    let cfg = configs.load().context("loading configuration")?;
    let app = Arc::new(build_app(cfg).await?);
    let cmd = CommandInterface::new(app);

    if args.batch {
        run_batch(&cmd, args.duration.map(Duration::from_secs)).await
    } else {
        console::run(cmd, configs).await
    }
}

async fn build_app(cfg: ScannerConfig) -> anyhow::Result<ScannerApp> {
    let token = cfg
        .api_credentials
        .bot_token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            anyhow!("no bot token: set api_credentials.bot_token or TELEGRAM_BOT_TOKEN")
        })?;
    let telegram: Arc<dyn TelegramClient> = Arc::new(TelegramBot::new(token));

    let tesseract = TesseractOcr::new();
    let ocr: Option<Arc<dyn OcrEngine>> = if tesseract.is_available().await {
        Some(Arc::new(tesseract))
    } else {
        warn!("tesseract not found; image text extraction disabled");
        None
    };

    let errors = Arc::new(ErrorHandler::new(cfg.rate_limiting.retry_policy()));
    let generator: Option<Arc<dyn ResponseGenerator>> = if cfg.ai_responder.enabled {
        let g = OpenAiGenerator::new(cfg.ai_responder.clone(), errors.clone())
            .context("configuring ai responder")?;
        Some(Arc::new(g))
    } else {
        None
    };

    Ok(ScannerApp::with_error_handler(
        cfg,
        Ports {
            telegram,
            ocr,
            generator,
        },
        errors,
    ))
}

/// Start, run until the duration elapses, Ctrl-C, or the scanner fails,
/// then stop and print the report.
async fn run_batch(cmd: &CommandInterface, duration: Option<Duration>) -> anyhow::Result<()> {
    let started = cmd.start().await;
    console::print_result(&started);
    if !started.success {
        return Err(anyhow!(started.message));
    }

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("batch duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = tick.tick() => {
                if cmd.current_state().await == ScannerState::Error {
                    warn!("scanner entered error state, ending batch run");
                    break;
                }
            }
        }
    }

    let last_error = cmd.last_error().await;
    console::shutdown(cmd).await;
    let report = cmd.generate_report(None, None).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    match last_error {
        Some(e) => Err(anyhow!(e)),
        None => Ok(()),
    }
}
