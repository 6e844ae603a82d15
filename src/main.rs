use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webtoon_splitter::{
    channel, default_config_path, load_splitter_config, FolderImageService, InputEvent,
    SessionController, SessionError, SessionEvent, SplitterConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "webtoon-splitter",
    about = "Plan page cuts for a vertical webtoon chapter",
    version
)]
struct Cli {
    /// Chapter folder containing a Raw/ directory of source strips
    chapter: PathBuf,

    /// Absolute y position of a cut, may be repeated
    #[arg(long = "at", value_name = "POS")]
    at: Vec<u32>,

    /// Place cuts at a fixed pitch before applying --at
    #[arg(long, value_name = "PX")]
    pitch: Option<u32>,

    /// Output extension recorded in the split plan
    #[arg(short, long, value_name = "EXT")]
    format: Option<String>,

    /// Settings file, defaults to <CHAPTER>/webtoon_splitter.json when present
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(env_filter))
        .init();
}

fn resolve_config(cli: &Cli) -> Result<SplitterConfig, String> {
    let mut config = match &cli.config {
        Some(path) => load_splitter_config(path)
            .map_err(|err| format!("failed to read config {}: {err}", path.display()))?,
        None => {
            let path = default_config_path(&cli.chapter);
            if path.is_file() {
                load_splitter_config(&path)
                    .map_err(|err| format!("failed to read config {}: {err}", path.display()))?
            } else {
                SplitterConfig::default()
            }
        }
    };
    if let Some(format) = &cli.format {
        config.export_format = format.clone();
    }
    Ok(config.normalize())
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = resolve_config(&cli)?;
    let (events, mut receiver) = channel();
    let service = Arc::new(FolderImageService::new());
    let mut controller = SessionController::new(service, config, events);

    controller
        .open_chapter(&cli.chapter)
        .await
        .map_err(|err| err.user_message())?;

    if let Some(pitch) = cli.pitch {
        controller.dispatch(InputEvent::AutoGenerate { pitch });
    }
    for position in &cli.at {
        controller.dispatch(InputEvent::ShiftClick {
            y: f64::from(*position),
        });
    }

    for row in controller.separators().rows() {
        println!("{:>8}px  {:>8}px", row.position, row.segment);
    }
    println!("{}", controller.separators().summary());

    match controller.export_chapter() {
        Ok(()) => {}
        Err(SessionError::NoSeparators) => {
            // Drain queued reports so a rejected pitch is visible.
            while let Ok(event) = receiver.try_recv() {
                if let SessionEvent::Error { message } = event {
                    warn!("{message}");
                }
            }
            return Err(SessionError::NoSeparators.user_message());
        }
        Err(err) => return Err(err.user_message()),
    }

    while let Some(event) = receiver.recv().await {
        match event {
            SessionEvent::ExportFinished(report) => {
                match report.output_path {
                    Some(path) => info!(bands = report.band_count, "split plan written to {}", path.display()),
                    None => info!(bands = report.band_count, "export finished"),
                }
                return Ok(());
            }
            SessionEvent::ExportFailed { message } => return Err(message),
            SessionEvent::Error { message } => warn!("{message}"),
            _ => {}
        }
    }
    Err("session closed before the export finished".into())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
