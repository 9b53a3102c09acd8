//! Per-character phone session.
//!
//! Owns the live snapshot, the version ledger and the stores for one
//! character, and runs the generate/reconcile lifecycle over them. At most
//! one generation or reconciliation runs at a time; a second request while
//! one is in flight is rejected rather than queued, and full regeneration is
//! debounced so a burst of host events cannot trigger repeated LLM calls.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::PhoneError;
use crate::history::VersionHistory;
use crate::llm_client::{CharacterProfile, FactExtractor, WorldFact};
use crate::phone::{Currency, PhoneData, Theme};
use crate::reconcile;
use crate::store::{load_with_fallback, LoadSource, SnapshotStore, StoredPhone};
use crate::unread::{
    self, mark_category_read, mark_story_viewed, mark_thread_read, toggle_post_like, Category,
};

/// One turn of the host conversation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub speaker: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            content: content.into(),
        }
    }

    fn as_prompt_line(&self) -> String {
        format!("[{}]: {}", self.speaker, self.content)
    }
}

/// What a reconciliation pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New facts were merged into the snapshot.
    Applied { records: usize },
    /// The conversation has not advanced past the last processed turn.
    NoNewMessages,
    /// New turns were analyzed but contained nothing phone-relevant.
    NoUpdates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Generating,
    Reconciling,
}

pub struct PhoneSession {
    owner_id: String,
    profile: CharacterProfile,
    world: Vec<WorldFact>,
    extractor: Arc<dyn FactExtractor>,
    primary: Arc<dyn SnapshotStore>,
    fallback: Arc<dyn SnapshotStore>,
    phone: Option<PhoneData>,
    history: VersionHistory,
    phase: Phase,
    last_generated_at: Option<DateTime<Utc>>,
    regen_debounce: Duration,
    recent_turn_window: usize,
}

impl PhoneSession {
    pub fn new(
        owner_id: impl Into<String>,
        profile: CharacterProfile,
        extractor: Arc<dyn FactExtractor>,
        primary: Arc<dyn SnapshotStore>,
        fallback: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            profile,
            world: Vec::new(),
            extractor,
            primary,
            fallback,
            phone: None,
            history: VersionHistory::new(),
            phase: Phase::Idle,
            last_generated_at: None,
            regen_debounce: Duration::seconds(5),
            recent_turn_window: 20,
        }
    }

    pub fn with_world(mut self, world: Vec<WorldFact>) -> Self {
        self.world = world;
        self
    }

    pub fn with_regen_debounce(mut self, debounce: Duration) -> Self {
        self.regen_debounce = debounce;
        self
    }

    pub fn with_recent_turn_window(mut self, window: usize) -> Self {
        self.recent_turn_window = window;
        self
    }

    pub fn phone(&self) -> Option<&PhoneData> {
        self.phone.as_ref()
    }

    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    pub fn unread(&self, category: Category) -> usize {
        self.phone
            .as_ref()
            .map_or(0, |p| unread::count_unread(p, category))
    }

    /// Load cached data for this character, or generate it from scratch.
    ///
    /// A record restored from the fallback cache is mirrored back into the
    /// primary store so the next load takes the fast path.
    pub async fn open(&mut self, chat: &[ChatTurn]) -> Result<(), PhoneError> {
        match load_with_fallback(self.primary.as_ref(), self.fallback.as_ref(), &self.owner_id)
            .await
            .map_err(|e| PhoneError::Store(e.to_string()))?
        {
            Some((record, source)) => {
                if source == LoadSource::Fallback {
                    if let Err(e) = self.primary.save(&record).await {
                        tracing::warn!("failed to mirror fallback record into primary: {e}");
                    }
                }
                self.phone = Some(record.phone);
                self.history = record.history;
                Ok(())
            }
            None => self.generate_initial(chat).await,
        }
    }

    /// Generate a fresh snapshot from the character profile and recent chat.
    ///
    /// If extraction fails the session falls back to a minimal placeholder
    /// snapshot so the phone is still usable. Repeat calls within the
    /// debounce window are ignored when a snapshot already exists.
    pub async fn generate_initial(&mut self, chat: &[ChatTurn]) -> Result<(), PhoneError> {
        if self.phase != Phase::Idle {
            return Err(PhoneError::OperationInFlight);
        }
        if self.phone.is_some() {
            if let Some(last) = self.last_generated_at {
                if Utc::now() - last < self.regen_debounce {
                    tracing::debug!(owner = %self.owner_id, "regeneration debounced");
                    return Ok(());
                }
            }
        }

        self.phase = Phase::Generating;
        let result = self.generate_initial_inner(chat).await;
        self.phase = Phase::Idle;
        result
    }

    async fn generate_initial_inner(&mut self, chat: &[ChatTurn]) -> Result<(), PhoneError> {
        let recent = self.recent_turn_lines(chat);
        tracing::info!(owner = %self.owner_id, turns = recent.len(), "generating phone data");

        let phone = match self
            .extractor
            .extract_initial(&self.profile, &recent, &self.world)
            .await
        {
            Ok(generated) => generated.into_phone_data(self.owner_id.clone(), chat.len()),
            Err(e) => {
                tracing::warn!("initial extraction failed, using placeholder data: {e:#}");
                PhoneData::placeholder(
                    self.owner_id.clone(),
                    &self.profile.name,
                    chat.len(),
                    Utc::now(),
                )
            }
        };

        self.phone = Some(phone);
        self.last_generated_at = Some(Utc::now());
        self.save().await
    }

    /// Reconcile the snapshot against conversation turns newer than the last
    /// processed index. Each turn is analyzed at most once: the timeline
    /// advances even when the pass finds nothing, so the same turns are never
    /// re-fed to the extractor.
    pub async fn check_for_updates(
        &mut self,
        chat: &[ChatTurn],
    ) -> Result<UpdateOutcome, PhoneError> {
        if self.phone.is_none() {
            return Err(PhoneError::NoSnapshot);
        }
        if self.phase != Phase::Idle {
            return Err(PhoneError::OperationInFlight);
        }
        if chat.is_empty() {
            return Ok(UpdateOutcome::NoNewMessages);
        }

        let current_index = chat.len() - 1;
        let last_processed = self
            .phone
            .as_ref()
            .map_or(0, |p| p.timeline.last_message_index);
        if current_index <= last_processed {
            return Ok(UpdateOutcome::NoNewMessages);
        }

        self.phase = Phase::Reconciling;
        let result = self.check_for_updates_inner(chat, current_index, last_processed).await;
        self.phase = Phase::Idle;
        result
    }

    async fn check_for_updates_inner(
        &mut self,
        chat: &[ChatTurn],
        current_index: usize,
        last_processed: usize,
    ) -> Result<UpdateOutcome, PhoneError> {
        let new_turns: Vec<String> = chat[last_processed + 1..=current_index]
            .iter()
            .map(ChatTurn::as_prompt_line)
            .collect();
        tracing::info!(
            owner = %self.owner_id,
            new_turns = new_turns.len(),
            "checking for phone updates"
        );

        let current = match self.phone.as_ref() {
            Some(phone) => phone,
            None => return Err(PhoneError::NoSnapshot),
        };

        let batch = self
            .extractor
            .extract_incremental(&self.profile, &new_turns, &self.world, current)
            .await
            .map_err(|e| PhoneError::Extraction(e.to_string()))?;

        match batch {
            None => {
                if let Some(phone) = self.phone.as_mut() {
                    phone.timeline.last_message_index = current_index;
                    phone.timeline.last_sync = Utc::now();
                }
                self.save().await?;
                Ok(UpdateOutcome::NoUpdates)
            }
            Some(batch) => {
                let records = batch.record_count();
                let next = reconcile::apply(current, &batch, current_index)?;
                self.phone = Some(next);
                self.save().await?;
                Ok(UpdateOutcome::Applied { records })
            }
        }
    }

    /// Open an app category, clearing its unread markers.
    pub async fn open_app(&mut self, category: Category) -> Result<(), PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        if mark_category_read(phone, category) {
            self.save().await?;
        }
        Ok(())
    }

    /// Open one conversation, marking only that thread read.
    pub async fn open_thread(&mut self, thread_id: &str) -> Result<(), PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        if mark_thread_read(phone, thread_id) {
            self.save().await?;
        }
        Ok(())
    }

    /// Delete a conversation. Returns false when no such thread exists.
    pub async fn delete_thread(&mut self, thread_id: &str) -> Result<bool, PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        let before = phone.messages.len();
        phone.messages.retain(|t| t.id != thread_id);
        if phone.messages.len() == before {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    /// Toggle the viewer's like on a post. Returns the new liked state.
    pub async fn toggle_like(&mut self, post_id: &str) -> Result<Option<bool>, PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        let liked = toggle_post_like(phone, post_id);
        if liked.is_some() {
            self.save().await?;
        }
        Ok(liked)
    }

    /// Mark one story as viewed.
    pub async fn view_story(&mut self, story_id: &str) -> Result<(), PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        if mark_story_viewed(phone, story_id) {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn set_currency(&mut self, currency: Currency) -> Result<(), PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        if phone.wallet.currency != currency {
            phone.wallet.currency = currency;
            self.save().await?;
        }
        Ok(())
    }

    pub async fn set_theme(&mut self, theme: Theme) -> Result<(), PhoneError> {
        let phone = self.phone.as_mut().ok_or(PhoneError::NoSnapshot)?;
        if phone.settings.theme != theme {
            phone.settings.theme = theme;
            self.save().await?;
        }
        Ok(())
    }

    /// Roll back to the ledger entry at `index` (0 = oldest retained). The
    /// restored snapshot is saved as a new version on top of the ledger.
    pub async fn restore_version(&mut self, index: usize) -> Result<(), PhoneError> {
        if self.phase != Phase::Idle {
            return Err(PhoneError::OperationInFlight);
        }
        let restored = self.history.restore(index)?;
        self.phone = Some(restored);
        self.save().await
    }

    /// Record the current snapshot in the ledger and persist both stores.
    /// The primary store is authoritative; a fallback write failure only
    /// degrades crash recovery and is logged rather than propagated.
    async fn save(&mut self) -> Result<(), PhoneError> {
        let phone = self.phone.as_ref().ok_or(PhoneError::NoSnapshot)?;
        let version = self.history.record(phone);
        let record = StoredPhone {
            owner_id: self.owner_id.clone(),
            phone: phone.clone(),
            history: self.history.clone(),
            saved_at: Utc::now(),
        };
        self.primary
            .save(&record)
            .await
            .map_err(|e| PhoneError::Store(e.to_string()))?;
        if let Err(e) = self.fallback.save(&record).await {
            tracing::warn!("failed to write fallback cache: {e}");
        }
        tracing::debug!(owner = %self.owner_id, version, "saved phone snapshot");
        Ok(())
    }

    fn recent_turn_lines(&self, chat: &[ChatTurn]) -> Vec<String> {
        let start = chat.len().saturating_sub(self.recent_turn_window);
        chat[start..].iter().map(ChatTurn::as_prompt_line).collect()
    }
}
