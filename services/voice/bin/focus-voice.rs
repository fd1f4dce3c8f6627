//! Main Entrypoint for the Focus voice assistant
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Loading the system prompt template.
//! 3. Wiring the speaker, microphone, Gemini transport and JSON stores.
//! 4. Running one voice session until it ends or `Ctrl+C` is pressed.

use anyhow::Context;
use clap::Parser;
use focus_core::{Assistant, SessionDeps, transcript::TranscriptEntry};
use focus_voice::{
    audio::{CpalInput, CpalOutputDevice},
    config::Config,
    store::JsonStore,
};
use gemini_realtime::GeminiLiveTransport;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Talk to your task list")]
struct Args {
    /// Directory holding system_prompt.md (overrides PROMPTS_PATH).
    #[arg(long)]
    prompts_path: Option<PathBuf>,
    /// Directory holding tasks.json and appointments.json (overrides DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Name the assistant addresses you by (overrides USER_NAME).
    #[arg(long)]
    user_name: Option<String>,
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    let entries = fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", prompts_path.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

fn log_entry(entry: &TranscriptEntry) {
    info!(target: "transcript", "{entry}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(path) = args.prompts_path {
        config.prompts_path = path;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(name) = args.user_name {
        config.user_name = name;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing voice assistant...");

    // --- 3. Load Prompt and Stores ---
    let prompts = load_prompts(&config.prompts_path)?;
    let template = prompts
        .get("system_prompt")
        .context("system_prompt.md not found in prompts directory")?
        .clone();
    let store = Arc::new(JsonStore::new(config.data_dir.clone()));
    let snapshot = store
        .snapshot(config.user_name.clone(), chrono::Local::now().naive_local())
        .await
        .context("Failed to read tasks and appointments")?;

    // --- 4. Wire the Session ---
    let transport = GeminiLiveTransport::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
    )
    .with_url(config.gemini_url.clone());
    let deps = SessionDeps {
        transport: Arc::new(transport),
        input: Arc::new(CpalInput::new(config.input_device.clone())),
        output: Arc::new(CpalOutputDevice::new(config.output_device.clone())),
        tasks: store.clone(),
        appointments: store,
    };
    let assistant = Assistant::new(config.session_config(template), deps, |handle| {
        info!(session_id = %handle.id, "Voice session closed");
    });

    // --- 5. Run the Session ---
    info!(
        model = %config.gemini_model,
        voice = %config.gemini_voice,
        tasks = snapshot.tasks.len(),
        appointments = snapshot.appointments.len(),
        "Opening voice session..."
    );
    let handle = assistant
        .open_session(snapshot)
        .await
        .context("Failed to open voice session")?;
    let Some(session) = assistant.session(&handle) else {
        info!("Session ended before it could be observed.");
        return Ok(());
    };
    info!(status = %session.transcript().status(), "Say something. Press Ctrl+C to stop.");

    let mut transcript = session.transcript().subscribe();
    let mut status = session.transcript().subscribe_status();
    let closed = session.wait_closed();
    tokio::pin!(closed);
    loop {
        tokio::select! {
            _ = &mut closed => break,
            entry = transcript.recv() => match entry {
                Ok(entry) => log_entry(&entry),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Transcript display fell behind"),
                Err(RecvError::Closed) => {
                    (&mut closed).await;
                    break;
                }
            },
            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                info!(status = %current, "Session status changed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Closing session...");
                assistant.close_session(&handle);
                session.wait_closed().await;
                break;
            }
        }
    }

    info!(status = %session.transcript().status(), "Voice assistant has shut down.");
    Ok(())
}
