//! Parley headless host: runs a practice call from the terminal.
//!
//! ## Runtime note
//!
//! The call engine spawns its loop on the ambient tokio runtime, so every
//! engine call below happens inside `#[tokio::main]`.

mod settings;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_core::{
    audio::device::list_input_devices,
    services::http::clients_from,
    CallEngine, CallServices, CallSession, CpalMicrophone, EncoderRegistry, MessageLog,
    RodioOutput, ScenarioContext, ScoreReport, SessionPhase, TurnState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use storage::SqliteMessageLog;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Practice sales calls against an AI persona", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the message database
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a live call (type `score` to finish and score, `end` to hang up)
    Call {
        /// Persona to call
        #[arg(long)]
        persona: String,

        /// TTS voice for the persona (defaults to `defaultVoiceId`)
        #[arg(long)]
        voice: Option<String>,

        /// Call type, e.g. cold-call, discovery, renewal
        #[arg(long, default_value = "cold-call")]
        call_type: String,

        /// Free-text scenario description sent with every dialogue request
        #[arg(long, default_value = "")]
        scenario: String,

        /// Exact input device name
        #[arg(long)]
        device: Option<String>,
    },

    /// Print the stored transcript of a session
    History {
        session_id: String,
    },

    /// List audio input devices
    Devices,

    /// Show the effective settings (file, environment and flags merged)
    Settings {
        /// Write the effective settings back to the settings file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info,parley_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let settings_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env();
    if let Some(db) = cli.db.clone() {
        settings.database_path = Some(db);
    }

    match cli.command {
        Commands::Call {
            persona,
            voice,
            call_type,
            scenario,
            device,
        } => {
            if let Some(voice) = voice {
                settings.default_voice_id = voice;
            }
            if let Some(device) = device {
                settings.preferred_input_device = Some(device);
            }
            settings.normalize();
            let scenario = ScenarioContext {
                persona_id: persona,
                call_type,
                description: scenario,
            };
            run_call(&settings, scenario).await
        }
        Commands::History { session_id } => print_history(&settings, &session_id),
        Commands::Devices => {
            print_devices();
            Ok(())
        }
        Commands::Settings { save } => show_settings(&settings, &settings_path, save),
    }
}

async fn run_call(settings: &AppSettings, scenario: ScenarioContext) -> Result<()> {
    let log = Arc::new(
        SqliteMessageLog::open(settings.database_path())
            .context("failed to open message database")?,
    );
    info!(path = %log.path().display(), "message log ready");

    let (recognizer, dialogue, synthesizer) =
        clients_from(&settings.endpoints()).context("failed to build service clients")?;
    let services = CallServices {
        recognizer: Arc::new(recognizer),
        dialogue: Arc::new(dialogue),
        synthesizer: Arc::new(synthesizer),
        output: Arc::new(RodioOutput::new()),
        log: log.clone(),
    };

    let session = CallSession::new(settings.default_voice_id.clone(), scenario);
    let engine = CallEngine::start(
        session,
        settings.call_config(),
        services,
        &CpalMicrophone::new(),
        &EncoderRegistry::with_defaults(),
    )
    .context("failed to start call")?;

    println!("Call {} started. Speak when ready.", engine.session().id);
    println!("Commands: `score` to finish and score, `end` to hang up.");

    let mut transcripts = engine.subscribe_transcripts();
    let printer = tokio::spawn(async move {
        loop {
            match transcripts.recv().await {
                Ok(event) => println!("[{}] {}", event.role.as_str(), event.text),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "transcript printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut status = engine.subscribe_status();
    let mut status_open = true;
    let mut announced_end = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                engine.end_call().await?;
                break;
            }
            line = lines.next_line() => {
                let command = line.context("failed to read stdin")?;
                match command.as_deref().map(str::trim) {
                    None | Some("end") => {
                        engine.end_call().await?;
                        break;
                    }
                    Some("score") => match engine.score().await {
                        Ok(report) => {
                            print_report(&report);
                            break;
                        }
                        Err(e) => println!("Scoring failed: {e}"),
                    },
                    Some("") => {}
                    Some(other) => println!("Unknown command `{other}` (use `score` or `end`)"),
                }
            }
            event = status.recv(), if status_open => match event {
                Ok(event) => {
                    let ended = event.status.state == TurnState::Ended
                        && event.status.phase == SessionPhase::Ended;
                    if ended && !announced_end {
                        announced_end = true;
                        match event.detail {
                            Some(detail) => println!("Call ended: {detail}"),
                            None => println!("Call ended."),
                        }
                        println!("Type `score` to score the call or `end` to exit.");
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => status_open = false,
            },
        }
    }

    let diagnostics = engine.diagnostics_snapshot();
    info!(
        turns = diagnostics.turns_started,
        stage_failures = diagnostics.stage_failures,
        playback_failures = diagnostics.playback_failures,
        outstanding = engine.resource_ledger().outstanding(),
        "session closed"
    );
    let session_id = engine.session().id.clone();
    drop(engine);
    printer.abort();
    println!("Session {session_id} saved.");
    Ok(())
}

fn print_report(report: &ScoreReport) {
    println!("Score: {}/100", report.score);
    if let Some(feedback) = &report.feedback {
        println!("{feedback}");
    }
    for strength in &report.strengths {
        println!("  + {strength}");
    }
    for improvement in &report.improvements {
        println!("  - {improvement}");
    }
}

fn print_history(settings: &AppSettings, session_id: &str) -> Result<()> {
    let log = SqliteMessageLog::open(settings.database_path())
        .context("failed to open message database")?;
    let summary = log
        .session(session_id)?
        .with_context(|| format!("no session with id {session_id}"))?;

    println!(
        "{} | persona {} | {} | {}",
        summary.id, summary.persona_id, summary.call_type, summary.started_at
    );
    match summary.score {
        Some(score) => println!("Score: {score}/100 ({})", summary.status),
        None => println!("Status: {}", summary.status),
    }
    if let Some(feedback) = &summary.feedback {
        println!("{feedback}");
    }
    for turn in log.turns(session_id)? {
        println!(
            "{} [{}] {}",
            turn.timestamp.format("%H:%M:%S"),
            turn.role.as_str(),
            turn.text
        );
    }
    Ok(())
}

fn show_settings(settings: &AppSettings, path: &Path, save: bool) -> Result<()> {
    if save {
        save_settings(path, settings)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    } else {
        println!("{}", path.display());
    }
    let json = serde_json::to_string_pretty(&settings.redacted())?;
    println!("{json}");
    Ok(())
}

fn print_devices() {
    let devices = list_input_devices();
    if devices.is_empty() {
        println!("No input devices found.");
        return;
    }
    for device in devices {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_recommended {
            tags.push("recommended");
        }
        if device.looks_like_loopback {
            tags.push("loopback");
        }
        if tags.is_empty() {
            println!("{}", device.name);
        } else {
            println!("{} ({})", device.name, tags.join(", "));
        }
    }
}
