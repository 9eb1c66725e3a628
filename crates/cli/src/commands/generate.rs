//! `chatweave generate`: Pack a chat file and stream one reply.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chatweave_config::AppConfig;
use chatweave_core::event::{GenerationType, SessionEvent};
use chatweave_core::transport::Transport;
use chatweave_engine::{SessionOutcome, TokenCounter};
use chatweave_providers::{OpenAiCompatTransport, ScriptedTransport};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::chat_file::ChatFile;

pub struct GenerateArgs {
    pub chat: PathBuf,
    pub generation_type: GenerationType,
    /// Replay chunks from a JSON file instead of calling the backend
    pub script: Option<PathBuf>,
    /// Print the written message as JSON instead of streaming text
    pub json: bool,
}

pub async fn run(args: GenerateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let file = ChatFile::load(&args.chat)?;
    file.apply_names(&mut config);

    let counter = Arc::new(TokenCounter::from_config(&config.tokenizer));
    let mut conversation = file.into_conversation(&config, counter)?;

    let transport: Box<dyn Transport> = match &args.script {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            Box::new(ScriptedTransport::from_json(&json)?)
        }
        None => {
            if !config.has_api_key() {
                warn!("No API key configured; set CHATWEAVE_API_KEY or OPENAI_API_KEY for hosted backends");
            }
            Box::new(OpenAiCompatTransport::from_config(&config.backend)?)
        }
    };

    if !args.json {
        let printed = Arc::new(Mutex::new(String::new()));
        conversation.observe(move |event: &SessionEvent| {
            if let SessionEvent::Chunk { text, .. } = event {
                print_delta(&printed, text);
            }
        });
    }

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = conversation
        .generate(args.generation_type, transport.as_ref(), cancel)
        .await;
    ctrl_c.abort();
    let outcome = outcome?;

    let result = outcome.result();
    if args.json {
        match result
            .message_index
            .and_then(|i| conversation.history.get(i))
        {
            Some(message) => println!("{}", serde_json::to_string_pretty(message)?),
            None => println!("{}", serde_json::to_string_pretty(result)?),
        }
    } else {
        println!();
        eprintln!(
            "  {} tokens in {} ms{}",
            result.token_count,
            result.timing.elapsed_ms,
            if outcome.is_cancelled() { " (stopped)" } else { "" }
        );
    }

    if let SessionOutcome::Errored {
        error, preserved, ..
    } = outcome
    {
        let kept = if preserved { "; partial text kept" } else { "" };
        return Err(format!("{error}{kept}").into());
    }
    Ok(())
}

/// Print the part of `text` not yet on screen. A display text that shrank
/// (a trimmed stop-string prefix) prints nothing until it grows past.
fn print_delta(printed: &Mutex<String>, text: &str) {
    let Ok(mut printed) = printed.lock() else {
        return;
    };
    if let Some(delta) = text.strip_prefix(printed.as_str()) {
        print!("{delta}");
        let _ = std::io::stdout().flush();
        *printed = text.to_string();
    }
}
