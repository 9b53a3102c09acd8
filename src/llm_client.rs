//! LLM-backed fact extraction.
//!
//! Talks to an OpenAI-compatible chat-completions endpoint and decodes the
//! model's output into typed values. Decoding is best-effort: markdown fences,
//! leading prose, trailing commas and unbalanced braces are salvaged here so
//! the reconciliation engine never sees malformed input.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::phone::{
    new_record_id, unread_in, BrowserEntry, LocationVisit, MessageThread, Note, PhoneData,
    PhoneSettings, SocialPost, SocialProfile, SocialStory, Timeline, Wallet,
};
use crate::reconcile::UpdateBatch;

/// The character the phone belongs to, as known to the host.
#[derive(Debug, Clone, Default)]
pub struct CharacterProfile {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
}

/// A lore/world entry fed into prompts for setting-appropriate content.
#[derive(Debug, Clone)]
pub struct WorldFact {
    pub key: String,
    pub content: String,
}

/// Source of extracted phone facts. Implemented by [`LlmExtractor`] in
/// production and by scripted doubles in tests.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Full snapshot-shaped generation for a character with no cached data.
    async fn extract_initial(
        &self,
        profile: &CharacterProfile,
        recent_turns: &[String],
        world: &[WorldFact],
    ) -> Result<GeneratedPhone>;

    /// Facts newly observable in `new_turns`, or `None` when the model found
    /// nothing relevant.
    async fn extract_incremental(
        &self,
        profile: &CharacterProfile,
        new_turns: &[String],
        world: &[WorldFact],
        current: &PhoneData,
    ) -> Result<Option<UpdateBatch>>;
}

/// Snapshot-shaped output of initial extraction, before it is stamped with an
/// owner, settings and timeline. The five core collections are required; a
/// response missing any of them is rejected at decode time.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedPhone {
    pub messages: Vec<MessageThread>,
    pub browser_history: Vec<BrowserEntry>,
    pub wallet: Wallet,
    pub notes: Vec<Note>,
    pub location_history: Vec<LocationVisit>,
    #[serde(default)]
    pub posts: Vec<SocialPost>,
    #[serde(default)]
    pub stories: Vec<SocialStory>,
    #[serde(default)]
    pub profile: Option<SocialProfile>,
}

impl GeneratedPhone {
    /// Stamp the generated content into a complete snapshot. Blank ids are
    /// filled in, per-thread unread counts are recomputed from the messages
    /// themselves, and the timeline is pinned to the current conversation
    /// position.
    pub fn into_phone_data(mut self, owner_id: impl Into<String>, chat_len: usize) -> PhoneData {
        let now = Utc::now();
        for thread in &mut self.messages {
            if thread.id.trim().is_empty() {
                thread.id = new_record_id("msg");
            }
            thread.unread_count = unread_in(&thread.thread);
        }
        for entry in &mut self.browser_history {
            if entry.id.trim().is_empty() {
                entry.id = new_record_id("browse");
            }
        }
        for trans in &mut self.wallet.transactions {
            if trans.id.trim().is_empty() {
                trans.id = new_record_id("trans");
            }
        }
        for note in &mut self.notes {
            if note.id.trim().is_empty() {
                note.id = new_record_id("note");
            }
        }
        for loc in &mut self.location_history {
            if loc.id.trim().is_empty() {
                loc.id = new_record_id("loc");
            }
        }
        for post in &mut self.posts {
            if post.id.trim().is_empty() {
                post.id = new_record_id("post");
            }
        }
        for story in &mut self.stories {
            if story.id.trim().is_empty() {
                story.id = new_record_id("story");
            }
        }
        if let Some(profile) = self.profile.as_mut() {
            profile.posts_count = self.posts.len();
        }

        PhoneData {
            owner_id: owner_id.into(),
            messages: self.messages,
            browser_history: self.browser_history,
            wallet: self.wallet,
            notes: self.notes,
            location_history: self.location_history,
            posts: self.posts,
            stories: self.stories,
            profile: self.profile,
            settings: PhoneSettings::default(),
            timeline: Timeline {
                last_message_index: chat_len.saturating_sub(1),
                last_sync: now,
            },
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Generate a completion using the OpenAI API format.
    pub async fn generate(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(4000),
        };

        let mut req = self.client.post(&url).json(&request);

        // API key header only when provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

/// Best-effort decoder for model output that is supposed to be JSON.
pub fn decode_json_loose<T>(raw: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(raw) {
        return Ok(parsed);
    }

    // Reasoning models sometimes prefix a think block.
    let cleaned = match raw.rfind("</think>") {
        Some(end) => &raw[end + 8..],
        None => raw,
    };

    let mut cleaned = cleaned.replace("```json", "").replace("```", "");
    // Slice to the outermost object, dropping surrounding prose.
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            cleaned = cleaned[start..=end].to_string();
        }
    }

    let trailing_commas = match Regex::new(r",\s*([}\]])") {
        Ok(re) => re,
        Err(e) => return Err(anyhow::anyhow!("invalid salvage pattern: {e}")),
    };
    let cleaned = trailing_commas.replace_all(&cleaned, "$1").into_owned();

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    // Last resort: close whatever the model left open.
    let repaired = repair_unbalanced(&cleaned);
    serde_json::from_str::<T>(repaired.trim()).with_context(|| {
        format!(
            "Failed to parse JSON. Raw response (first 500 chars): {}",
            raw.chars().take(500).collect::<String>()
        )
    })
}

fn repair_unbalanced(json: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in json.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack.push(c),
            '}' if !in_string => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                }
            }
            ']' if !in_string => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = json.trim_end().trim_end_matches(',').to_string();
    if in_string {
        repaired.push('"');
    }
    while let Some(opener) = stack.pop() {
        repaired.push(if opener == '{' { '}' } else { ']' });
    }
    repaired
}

/// One-paragraph summary of the existing snapshot, fed to the incremental
/// prompt so the model does not regenerate data it already produced.
pub fn summarize_phone(phone: &PhoneData) -> String {
    let contacts = phone
        .messages
        .iter()
        .map(|t| t.contact_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "EXISTING PHONE DATA SUMMARY:\n\
         - Messages: {} conversations (contacts: {})\n\
         - Browser history: {} searches\n\
         - Wallet balance: {:.2} {}\n\
         - Notes: {} notes\n\
         - Location history: {} trips\n\
         - Social: {} posts, {} stories",
        phone.messages.len(),
        if contacts.is_empty() { "none" } else { &contacts },
        phone.browser_history.len(),
        phone.wallet.balance,
        phone.wallet.currency.symbol(),
        phone.notes.len(),
        phone.location_history.len(),
        phone.posts.len(),
        phone.stories.len(),
    )
}

fn world_facts_text(world: &[WorldFact]) -> String {
    if world.is_empty() {
        return "No additional world information available.".to_string();
    }
    world
        .iter()
        .map(|entry| format!("- {}: {}", entry.key, entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for full initial generation.
pub fn build_initial_prompt(
    profile: &CharacterProfile,
    recent_turns: &[String],
    world: &[WorldFact],
) -> String {
    let name = &profile.name;
    let chat_text = if recent_turns.is_empty() {
        "No chat history available yet.".to_string()
    } else {
        recent_turns.join("\n")
    };
    let today = Utc::now().format("%Y-%m-%d");

    format!(
        "You are a specialized assistant that generates realistic smartphone data for fictional characters.\n\n\
         This is {name}'s PERSONAL phone. The RECENT CHAT below is between {name} and a USER and is\n\
         context ONLY - do not copy those messages into the phone. Invent SEPARATE conversations {name}\n\
         had with OTHER people (friends, family, colleagues, NPCs).\n\n\
         CHARACTER INFO:\n\
         Name: {name}\n\
         Description: {description}\n\
         Personality: {personality}\n\
         Scenario: {scenario}\n\n\
         WORLD INFO:\n{world}\n\n\
         RECENT CHAT (context only):\n{chat_text}\n\n\
         CURRENT DATE: {today}\n\n\
         Create:\n\
         1. messages: 2-3 text conversations with people {name} knows, 2-4 messages each,\n\
            senders are either \"{name}\" or the contact's name\n\
         2. browser_history: 3-4 searches matching {name}'s interests\n\
         3. wallet: a realistic balance, a setting-appropriate currency (VND, USD, EUR, GBP or JPY)\n\
            and 5-6 signed transactions (negative = expense, positive = income)\n\
         4. notes: 2-3 personal notes or reminders\n\
         5. location_history: 2-3 recent trips\n\
         6. posts and stories: a few social feed entries, plus a profile\n\n\
         Respond with ONLY a JSON object of this shape, no markdown, no explanations:\n\
         {{\n\
           \"messages\": [{{\"id\": \"msg_001\", \"contact_name\": \"Mom\", \"contact_type\": \"family\",\n\
             \"thread\": [{{\"sender\": \"Mom\", \"content\": \"...\", \"timestamp\": \"{today}T10:00:00Z\", \"read\": true}}],\n\
             \"last_message_time\": \"{today}T10:00:00Z\", \"unread_count\": 0}}],\n\
           \"browser_history\": [{{\"id\": \"browse_001\", \"url\": \"...\", \"title\": \"...\",\n\
             \"timestamp\": \"{today}T14:00:00Z\", \"reason\": \"...\", \"category\": \"news\"}}],\n\
           \"wallet\": {{\"balance\": 1000.00, \"currency\": \"USD\", \"transactions\": [{{\"id\": \"trans_001\",\n\
             \"type\": \"expense\", \"amount\": -50.00, \"category\": \"food\", \"merchant\": \"...\",\n\
             \"note\": \"...\", \"timestamp\": \"{today}T12:00:00Z\", \"location\": \"...\"}}]}},\n\
           \"notes\": [{{\"id\": \"note_001\", \"title\": \"...\", \"content\": \"...\",\n\
             \"created_at\": \"{today}T08:00:00Z\", \"updated_at\": \"{today}T09:00:00Z\",\n\
             \"category\": \"personal\", \"pinned\": false}}],\n\
           \"location_history\": [{{\"id\": \"loc_001\", \"from\": \"Home\", \"to\": \"Work\",\n\
             \"departure_time\": \"{today}T08:00:00Z\", \"arrival_time\": \"{today}T08:30:00Z\",\n\
             \"travel_mode\": \"car\", \"purpose\": \"Commute\", \"route\": [\"Home\", \"Work\"]}}],\n\
           \"posts\": [{{\"id\": \"post_001\", \"type\": \"text\", \"images\": [], \"caption\": \"...\",\n\
             \"likes\": 42, \"comments\": [], \"timestamp\": \"{today}T18:00:00Z\", \"music\": null}}],\n\
           \"stories\": [],\n\
           \"profile\": {{\"username\": \"...\", \"display_name\": \"{name}\", \"bio\": \"...\",\n\
             \"posts_count\": 1, \"followers\": 120, \"following\": 80}}\n\
         }}\n\n\
         All timestamps must be valid ISO 8601. Keep the content consistent with {name}'s\n\
         personality and the story setting.",
        name = name,
        description = or_na(&profile.description),
        personality = or_na(&profile.personality),
        scenario = or_na(&profile.scenario),
        world = world_facts_text(world),
        chat_text = chat_text,
        today = today,
    )
}

/// Prompt for incremental extraction over only the new conversation turns.
pub fn build_incremental_prompt(
    profile: &CharacterProfile,
    new_turns: &[String],
    world: &[WorldFact],
    current: &PhoneData,
) -> String {
    let name = &profile.name;
    let today = Utc::now().format("%Y-%m-%d");

    format!(
        "You are analyzing NEW chat messages to find updates for {name}'s phone.\n\n\
         CHARACTER: {name}\n\
         PERSONALITY: {personality}\n\n\
         {summary}\n\n\
         NEW MESSAGES TO ANALYZE (between {name} and the USER, context only - never copy them\n\
         into phone messages):\n{turns}\n\n\
         WORLD INFO:\n{world}\n\n\
         Identify any NEW facts the messages reveal: conversations {name} had with other people,\n\
         web searches, money spent or received, notes made, places visited, social posts or stories.\n\n\
         RULES:\n\
         - Only add information explicitly mentioned in the new messages\n\
         - Do not duplicate or regenerate existing data\n\
         - Set \"has_updates\": false and leave every array empty if nothing relevant was found\n\
         - Be conservative\n\n\
         Respond with ONLY JSON of this shape:\n\
         {{\n\
           \"has_updates\": true,\n\
           \"new_messages\": [{{\"contact_name\": \"...\", \"contact_type\": \"npc\",\n\
             \"thread\": [{{\"sender\": \"...\", \"content\": \"...\", \"timestamp\": \"{today}T14:00:00Z\", \"read\": false}}],\n\
             \"last_message_time\": \"{today}T14:00:00Z\"}}],\n\
           \"new_browser_history\": [{{\"url\": \"...\", \"title\": \"...\", \"timestamp\": \"{today}T15:00:00Z\",\n\
             \"reason\": \"...\", \"category\": \"...\"}}],\n\
           \"new_transactions\": [{{\"type\": \"expense\", \"amount\": -50.00, \"category\": \"food\",\n\
             \"merchant\": \"...\", \"note\": \"...\", \"timestamp\": \"{today}T16:00:00Z\", \"location\": \"...\"}}],\n\
           \"new_notes\": [{{\"title\": \"...\", \"content\": \"...\", \"created_at\": \"{today}T17:00:00Z\",\n\
             \"updated_at\": \"{today}T17:00:00Z\", \"category\": \"personal\", \"pinned\": false}}],\n\
           \"new_locations\": [{{\"from\": \"...\", \"to\": \"...\", \"departure_time\": \"{today}T18:00:00Z\",\n\
             \"arrival_time\": \"{today}T18:30:00Z\", \"travel_mode\": \"walk\", \"purpose\": \"...\", \"route\": []}}],\n\
           \"new_posts\": [{{\"type\": \"text\", \"images\": [], \"caption\": \"...\", \"likes\": 0,\n\
             \"comments\": [], \"timestamp\": \"{today}T19:00:00Z\", \"music\": null}}],\n\
           \"new_stories\": [{{\"image_description\": \"...\", \"text_overlay\": \"...\",\n\
             \"timestamp\": \"{today}T20:00:00Z\", \"views\": 0}}]\n\
         }}",
        name = name,
        personality = or_na(&profile.personality),
        summary = summarize_phone(current),
        turns = new_turns.join("\n"),
        world = world_facts_text(world),
        today = today,
    )
}

fn or_na(value: &str) -> &str {
    if value.trim().is_empty() {
        "N/A"
    } else {
        value
    }
}

/// Production extractor over an OpenAI-compatible endpoint.
pub struct LlmExtractor {
    client: LlmClient,
}

impl LlmExtractor {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client: LlmClient::new(api_url, api_key.unwrap_or_default(), model),
        }
    }

    fn envelope(prompt: String) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".to_string(),
                content: "You generate structured smartphone data for fictional characters. \
                          Return strict JSON only."
                    .to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: prompt,
            },
        ]
    }
}

#[async_trait]
impl FactExtractor for LlmExtractor {
    async fn extract_initial(
        &self,
        profile: &CharacterProfile,
        recent_turns: &[String],
        world: &[WorldFact],
    ) -> Result<GeneratedPhone> {
        let prompt = build_initial_prompt(profile, recent_turns, world);
        let response = self.client.generate(Self::envelope(prompt)).await?;
        tracing::debug!(len = response.len(), "received initial generation response");
        decode_json_loose::<GeneratedPhone>(&response)
    }

    async fn extract_incremental(
        &self,
        profile: &CharacterProfile,
        new_turns: &[String],
        world: &[WorldFact],
        current: &PhoneData,
    ) -> Result<Option<UpdateBatch>> {
        let prompt = build_incremental_prompt(profile, new_turns, world, current);
        let response = self.client.generate(Self::envelope(prompt)).await?;
        tracing::debug!(len = response.len(), "received incremental update response");
        let batch = decode_json_loose::<UpdateBatch>(&response)?;
        if !batch.has_updates {
            tracing::debug!("model reported no updates");
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> CharacterProfile {
        CharacterProfile {
            name: "Mira Chen".to_string(),
            description: "A night-shift radio host".to_string(),
            personality: "wry, observant".to_string(),
            scenario: String::new(),
        }
    }

    #[test]
    fn decodes_fenced_json() {
        let raw = "Here you go:\n```json\n{\"has_updates\": false}\n```\nHope that helps!";
        let batch: UpdateBatch = decode_json_loose(raw).expect("decode");
        assert!(!batch.has_updates);
    }

    #[test]
    fn decodes_json_with_trailing_commas() {
        let raw = r#"{"has_updates": true, "new_notes": [{"title": "t", "content": "c",
            "created_at": "2026-08-20T10:00:00Z", "updated_at": "2026-08-20T10:00:00Z",},],}"#;
        let batch: UpdateBatch = decode_json_loose(raw).expect("decode");
        assert!(batch.has_updates);
        assert_eq!(batch.new_notes.len(), 1);
    }

    #[test]
    fn decodes_truncated_json_by_closing_open_scopes() {
        let raw = r#"{"has_updates": true, "new_browser_history": [{"url": "u", "title": "t",
            "timestamp": "2026-08-20T10:00:00Z""#;
        let batch: UpdateBatch = decode_json_loose(raw).expect("decode");
        assert!(batch.has_updates);
        assert_eq!(batch.new_browser_history.len(), 1);
    }

    #[test]
    fn strips_think_blocks() {
        let raw = "<think>counting braces</think>{\"has_updates\": false}";
        let batch: UpdateBatch = decode_json_loose(raw).expect("decode");
        assert!(!batch.has_updates);
    }

    #[test]
    fn rejects_unusable_output() {
        let err = decode_json_loose::<UpdateBatch>("I could not find anything.").unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }

    #[test]
    fn initial_prompt_contains_core_sections() {
        let prompt = build_initial_prompt(&sample_profile(), &[], &[]);
        assert!(prompt.contains("CHARACTER INFO"));
        assert!(prompt.contains("Mira Chen"));
        assert!(prompt.contains("\"browser_history\""));
        assert!(prompt.contains("No chat history available yet."));
    }

    #[test]
    fn incremental_prompt_embeds_existing_summary() {
        let phone = PhoneData::placeholder("char-1", "Mira Chen", 4, Utc::now());
        let turns = vec!["[Mira Chen]: I bought a new lamp today".to_string()];
        let prompt = build_incremental_prompt(&sample_profile(), &turns, &[], &phone);
        assert!(prompt.contains("EXISTING PHONE DATA SUMMARY"));
        assert!(prompt.contains("new lamp"));
        assert!(prompt.contains("\"has_updates\""));
    }

    #[test]
    fn generated_phone_is_stamped_with_ids_and_consistent_counts() {
        let raw = serde_json::json!({
            "messages": [{
                "contact_name": "Mom",
                "thread": [
                    {"sender": "Mom", "content": "hi", "timestamp": "2026-08-20T10:00:00Z", "read": false}
                ],
                "last_message_time": "2026-08-20T10:00:00Z",
                "unread_count": 7
            }],
            "browser_history": [],
            "wallet": {"balance": 250.0, "currency": "EUR", "transactions": []},
            "notes": [],
            "location_history": []
        });
        let generated: GeneratedPhone = serde_json::from_value(raw).expect("decode");
        let phone = generated.into_phone_data("char-1", 12);

        assert_eq!(phone.owner_id, "char-1");
        assert_eq!(phone.timeline.last_message_index, 11);
        let thread = &phone.messages[0];
        assert!(thread.id.starts_with("msg_"));
        assert_eq!(thread.unread_count, 1, "model count recomputed from thread");
        assert!(thread.unread_consistent());
    }
}
