//! `chatweave pack`: Pack a chat file and print the prompt.

use std::path::Path;
use std::sync::Arc;

use chatweave_config::AppConfig;
use chatweave_core::event::GenerationType;
use chatweave_engine::TokenCounter;

use super::chat_file::ChatFile;

pub async fn run(
    chat: &Path,
    generation_type: GenerationType,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let file = ChatFile::load(chat)?;
    file.apply_names(&mut config);

    let counter = Arc::new(TokenCounter::from_config(&config.tokenizer));
    let conversation = file.into_conversation(&config, counter.clone())?;
    let packed = conversation.pack(generation_type).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&packed.metadata)?);
        return Ok(());
    }

    println!("{}", packed.text);
    eprintln!();
    eprintln!(
        "  {} / {} tokens ({:.1}%) via {}",
        packed.total_tokens(),
        packed.ceiling(),
        packed.metadata.utilization_pct,
        counter.tokenizer_name()
    );
    for stats in &packed.metadata.per_class {
        eprintln!(
            "  {:<9} {:>6} tokens  {}/{} items",
            stats.name, stats.tokens, stats.items_included, stats.items_total
        );
    }
    for drop in &packed.metadata.drops {
        eprintln!(
            "  dropped {} {} item(s), {} tokens: {}",
            drop.items_dropped, drop.layer, drop.tokens_dropped, drop.reason
        );
    }
    Ok(())
}
