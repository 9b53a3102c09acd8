use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tracing_subscriber::EnvFilter;

use charphone::config::PhoneConfig;
use charphone::llm_client::{CharacterProfile, LlmExtractor};
use charphone::session::{ChatTurn, PhoneSession, UpdateOutcome};
use charphone::store::{FileCacheStore, MetadataStore};
use charphone::unread::Category;

/// Demo driver: feed a transcript file through a phone session and print the
/// resulting snapshot. Transcript lines are `Speaker: text`.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,charphone=debug")),
        )
        .init();

    let config = PhoneConfig::load()?;
    tracing::info!("Using LLM endpoint {}", config.llm_api_url);

    let transcript_path = std::env::args()
        .nth(1)
        .context("usage: charphone <transcript-file>")?;
    let chat = read_transcript(&transcript_path)?;
    tracing::info!("Loaded {} conversation turns", chat.len());

    let profile = CharacterProfile {
        name: if config.character_name.is_empty() {
            "Character".to_string()
        } else {
            config.character_name.clone()
        },
        description: config.character_description.clone(),
        personality: config.character_personality.clone(),
        scenario: config.character_scenario.clone(),
    };

    let extractor = Arc::new(LlmExtractor::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let primary = Arc::new(MetadataStore::new());
    let fallback = Arc::new(FileCacheStore::new(
        config.cache_dir.clone(),
        config.cache_prefix.clone(),
    ));

    let owner_id = profile.name.to_lowercase().replace(' ', "-");
    let mut session = PhoneSession::new(owner_id, profile, extractor, primary, fallback)
        .with_recent_turn_window(config.recent_turn_window)
        .with_regen_debounce(Duration::seconds(config.regen_debounce_secs as i64));

    // Open against the first half of the transcript, then reconcile the rest
    // to exercise the incremental path.
    let split = (chat.len() / 2).max(1).min(chat.len());
    session
        .open(&chat[..split])
        .await
        .map_err(|e| anyhow::anyhow!("failed to open phone session: {e}"))?;

    match session.check_for_updates(&chat).await {
        Ok(UpdateOutcome::Applied { records }) => {
            tracing::info!("Merged {records} new records from the conversation");
        }
        Ok(UpdateOutcome::NoUpdates) => tracing::info!("No phone-relevant facts found"),
        Ok(UpdateOutcome::NoNewMessages) => tracing::info!("Nothing new to analyze"),
        Err(e) => tracing::warn!("Update pass failed: {e}"),
    }

    let phone = session
        .phone()
        .context("session ended without a snapshot")?;
    println!("{}", serde_json::to_string_pretty(phone)?);
    for category in Category::ALL {
        println!("unread {}: {}", category.as_str(), session.unread(category));
    }
    println!("versions retained: {}", session.history().len());

    Ok(())
}

fn read_transcript(path: &str) -> Result<Vec<ChatTurn>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {path}"))?;
    let turns = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(':') {
            Some((speaker, text)) => ChatTurn::new(speaker.trim(), text.trim()),
            None => ChatTurn::new("Narrator", line.trim()),
        })
        .collect();
    Ok(turns)
}
