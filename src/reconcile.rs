//! Merges an extracted [`UpdateBatch`] into an existing snapshot.
//!
//! The merge is additive: records are only ever appended (posts are prepended
//! for newest-first display), threads grow at the tail, and derived fields
//! (`unread_count`, `wallet.balance`, `profile.posts_count`) are maintained
//! transactionally as each record lands. Applying the same batch twice
//! duplicates its content; at-most-once application is enforced upstream by
//! the session's message-index gate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PhoneError;
use crate::phone::{
    new_record_id, unread_in, BrowserEntry, ContactType, LocationVisit, Message, MessageThread,
    MusicTag, Note, PhoneData, PostComment, PostImage, PostKind, SocialPost, SocialStory,
    Transaction, TransactionKind, TravelMode,
};

/// Newly observed facts proposed for merging, as decoded from the extractor.
/// Incoming records carry no ids or read markers; those are assigned on merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateBatch {
    #[serde(default)]
    pub has_updates: bool,
    #[serde(default)]
    pub new_messages: Vec<ThreadFragment>,
    #[serde(default)]
    pub new_browser_history: Vec<NewBrowserEntry>,
    #[serde(default)]
    pub new_transactions: Vec<NewTransaction>,
    #[serde(default)]
    pub new_notes: Vec<NewNote>,
    #[serde(default)]
    pub new_locations: Vec<NewLocation>,
    #[serde(default)]
    pub new_posts: Vec<NewPost>,
    #[serde(default)]
    pub new_stories: Vec<NewStory>,
}

impl UpdateBatch {
    pub fn record_count(&self) -> usize {
        self.new_messages.iter().map(|f| f.thread.len()).sum::<usize>()
            + self.new_browser_history.len()
            + self.new_transactions.len()
            + self.new_notes.len()
            + self.new_locations.len()
            + self.new_posts.len()
            + self.new_stories.len()
    }
}

/// A [`MessageThread`] minus `id` and `unread_count`, which are computed on
/// merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadFragment {
    pub contact_name: String,
    #[serde(default)]
    pub contact_type: ContactType,
    pub thread: Vec<Message>,
    pub last_message_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBrowserEntry {
    pub url: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount: f64,
    pub category: String,
    pub merchant: String,
    #[serde(default)]
    pub note: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLocation {
    pub from: String,
    pub to: String,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    #[serde(default)]
    pub travel_mode: TravelMode,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub route: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    #[serde(rename = "type", default)]
    pub kind: PostKind,
    #[serde(default)]
    pub images: Vec<PostImage>,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub comments: Vec<PostComment>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub music: Option<MusicTag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStory {
    #[serde(default)]
    pub image_description: Option<String>,
    #[serde(default)]
    pub text_overlay: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub views: u32,
}

/// Apply `batch` to `snapshot`, producing a new snapshot.
///
/// The input snapshot is never mutated: the batch is validated in full before
/// any merging happens, and merging operates on a buffered copy. A batch that
/// fails validation therefore leaves the caller's snapshot field-for-field
/// identical to before the call.
pub fn apply(
    snapshot: &PhoneData,
    batch: &UpdateBatch,
    current_message_index: usize,
) -> Result<PhoneData, PhoneError> {
    if !batch.has_updates {
        return Err(PhoneError::EmptyBatch);
    }
    validate(batch)?;

    let now = Utc::now();
    let mut next = snapshot.clone();

    merge_threads(&mut next, &batch.new_messages);
    merge_browser_history(&mut next, &batch.new_browser_history);
    merge_transactions(&mut next, &batch.new_transactions);
    merge_notes(&mut next, &batch.new_notes);
    merge_locations(&mut next, &batch.new_locations);
    merge_posts(&mut next, &batch.new_posts);
    merge_stories(&mut next, &batch.new_stories, now);

    // The index gate upstream guarantees current > last, but the timeline must
    // never move backwards even if a caller bypasses the gate.
    next.timeline.last_message_index =
        next.timeline.last_message_index.max(current_message_index);
    next.timeline.last_sync = now;

    tracing::debug!(
        threads = batch.new_messages.len(),
        browser = batch.new_browser_history.len(),
        transactions = batch.new_transactions.len(),
        notes = batch.new_notes.len(),
        locations = batch.new_locations.len(),
        posts = batch.new_posts.len(),
        stories = batch.new_stories.len(),
        "applied update batch"
    );

    Ok(next)
}

/// Reject the whole batch if any record is unusable. Silently dropping a bad
/// record would leave aggregates out of step with what the extractor reported.
pub fn validate(batch: &UpdateBatch) -> Result<(), PhoneError> {
    for fragment in &batch.new_messages {
        if fragment.contact_name.trim().is_empty() {
            return Err(malformed("message fragment with blank contact name"));
        }
        if fragment.thread.is_empty() {
            return Err(malformed(format!(
                "empty thread for contact '{}'",
                fragment.contact_name
            )));
        }
        for msg in &fragment.thread {
            if msg.sender.trim().is_empty() {
                return Err(malformed(format!(
                    "message with blank sender in thread '{}'",
                    fragment.contact_name
                )));
            }
        }
    }
    for entry in &batch.new_browser_history {
        if entry.url.trim().is_empty() {
            return Err(malformed("browser entry with blank url"));
        }
    }
    for trans in &batch.new_transactions {
        if !trans.amount.is_finite() {
            return Err(malformed(format!(
                "non-finite transaction amount for merchant '{}'",
                trans.merchant
            )));
        }
    }
    for note in &batch.new_notes {
        if note.title.trim().is_empty() {
            return Err(malformed("note with blank title"));
        }
    }
    for loc in &batch.new_locations {
        if loc.from.trim().is_empty() || loc.to.trim().is_empty() {
            return Err(malformed("location visit with blank endpoint"));
        }
    }
    Ok(())
}

fn malformed(reason: impl Into<String>) -> PhoneError {
    PhoneError::MalformedBatch {
        reason: reason.into(),
    }
}

fn merge_threads(phone: &mut PhoneData, fragments: &[ThreadFragment]) {
    for fragment in fragments {
        let incoming_unread = unread_in(&fragment.thread);
        let existing = phone
            .messages
            .iter_mut()
            .find(|t| t.contact_name.eq_ignore_ascii_case(&fragment.contact_name));

        match existing {
            Some(thread) => {
                thread.thread.extend(fragment.thread.iter().cloned());
                thread.last_message_time = fragment.last_message_time;
                thread.unread_count += incoming_unread;
                tracing::debug!(
                    contact = %thread.contact_name,
                    added = fragment.thread.len(),
                    unread = incoming_unread,
                    "extended existing conversation"
                );
            }
            None => {
                phone.messages.push(MessageThread {
                    id: new_record_id("msg"),
                    contact_name: fragment.contact_name.clone(),
                    contact_type: fragment.contact_type,
                    thread: fragment.thread.clone(),
                    last_message_time: fragment.last_message_time,
                    unread_count: incoming_unread,
                });
                tracing::debug!(
                    contact = %fragment.contact_name,
                    unread = incoming_unread,
                    "added new conversation"
                );
            }
        }
    }
}

fn merge_browser_history(phone: &mut PhoneData, entries: &[NewBrowserEntry]) {
    for entry in entries {
        phone.browser_history.push(BrowserEntry {
            id: new_record_id("browse"),
            url: entry.url.clone(),
            title: entry.title.clone(),
            timestamp: entry.timestamp,
            reason: entry.reason.clone(),
            category: entry.category.clone(),
            is_new: true,
        });
    }
}

fn merge_transactions(phone: &mut PhoneData, transactions: &[NewTransaction]) {
    for trans in transactions {
        phone.wallet.transactions.push(Transaction {
            id: new_record_id("trans"),
            kind: trans.kind,
            amount: trans.amount,
            category: trans.category.clone(),
            merchant: trans.merchant.clone(),
            note: trans.note.clone(),
            timestamp: trans.timestamp,
            location: trans.location.clone(),
            is_new: true,
        });
        // Running sum, applied per transaction in batch order.
        phone.wallet.balance += trans.amount;
    }
}

fn merge_notes(phone: &mut PhoneData, notes: &[NewNote]) {
    for note in notes {
        phone.notes.push(Note {
            id: new_record_id("note"),
            title: note.title.clone(),
            content: note.content.clone(),
            created_at: note.created_at,
            updated_at: note.updated_at,
            category: note.category.clone(),
            pinned: note.pinned,
            is_new: true,
        });
    }
}

fn merge_locations(phone: &mut PhoneData, locations: &[NewLocation]) {
    for loc in locations {
        phone.location_history.push(LocationVisit {
            id: new_record_id("loc"),
            from: loc.from.clone(),
            to: loc.to.clone(),
            departure_time: loc.departure_time,
            arrival_time: loc.arrival_time,
            travel_mode: loc.travel_mode,
            purpose: loc.purpose.clone(),
            route: loc.route.clone(),
            is_new: true,
        });
    }
}

fn merge_posts(phone: &mut PhoneData, posts: &[NewPost]) {
    for post in posts {
        // Prepended rather than appended: the feed reads newest-first.
        phone.posts.insert(
            0,
            SocialPost {
                id: new_record_id("post"),
                kind: post.kind,
                images: post.images.clone(),
                caption: post.caption.clone(),
                likes: post.likes,
                liked_by_user: false,
                comments: post.comments.clone(),
                timestamp: post.timestamp,
                music: post.music.clone(),
                is_new: true,
            },
        );
    }
    if let Some(profile) = phone.profile.as_mut() {
        profile.posts_count = phone.posts.len();
    }
}

fn merge_stories(phone: &mut PhoneData, stories: &[NewStory], now: DateTime<Utc>) {
    for story in stories {
        phone.stories.push(SocialStory {
            id: new_record_id("story"),
            image_description: story.image_description.clone(),
            text_overlay: story.text_overlay.clone(),
            timestamp: story.timestamp,
            views: story.views,
            expires_at: Some(now + Duration::hours(24)),
            is_new: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::{Currency, SocialProfile};

    fn base_phone() -> PhoneData {
        PhoneData::empty("char-1", Utc::now())
    }

    fn fragment(contact: &str, messages: Vec<(&str, bool)>) -> ThreadFragment {
        let now = Utc::now();
        ThreadFragment {
            contact_name: contact.to_string(),
            contact_type: ContactType::Npc,
            thread: messages
                .into_iter()
                .map(|(content, read)| Message {
                    sender: contact.to_string(),
                    content: content.to_string(),
                    timestamp: now,
                    read,
                })
                .collect(),
            last_message_time: now,
        }
    }

    fn batch_with_messages(fragments: Vec<ThreadFragment>) -> UpdateBatch {
        UpdateBatch {
            has_updates: true,
            new_messages: fragments,
            ..UpdateBatch::default()
        }
    }

    #[test]
    fn new_thread_gets_fresh_id_and_unread_count() {
        let phone = base_phone();
        let batch = batch_with_messages(vec![fragment(
            "Mom",
            vec![("Dinner tonight?", true), ("Hello?", false)],
        )]);

        let next = apply(&phone, &batch, 5).expect("apply");
        assert_eq!(next.messages.len(), 1);
        let thread = &next.messages[0];
        assert!(!thread.id.is_empty());
        assert_eq!(thread.unread_count, 1);
        assert!(thread.unread_consistent());
    }

    #[test]
    fn fragment_merges_into_existing_thread_case_insensitively() {
        let mut phone = base_phone();
        let batch = batch_with_messages(vec![fragment("Mom", vec![("First", true)])]);
        phone = apply(&phone, &batch, 1).expect("first apply");

        let batch = batch_with_messages(vec![fragment("mom", vec![("Second", false)])]);
        let next = apply(&phone, &batch, 2).expect("second apply");

        assert_eq!(next.messages.len(), 1, "no duplicate thread for 'mom'");
        let thread = &next.messages[0];
        assert_eq!(thread.thread.len(), 2);
        assert_eq!(thread.unread_count, 1);
        assert!(thread.unread_consistent());
    }

    #[test]
    fn no_two_threads_share_a_contact_after_any_merge() {
        let mut phone = base_phone();
        for name in ["Mom", "MOM", "Dad", "mom", "dad"] {
            let batch = batch_with_messages(vec![fragment(name, vec![("hi", false)])]);
            phone = apply(&phone, &batch, 0).expect("apply");
        }
        let mut keys: Vec<String> = phone
            .messages
            .iter()
            .map(|t| t.contact_name.to_ascii_lowercase())
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), phone.messages.len());
    }

    #[test]
    fn transactions_update_balance_as_a_running_sum() {
        let mut phone = base_phone();
        phone.wallet.balance = 1000.0;
        phone.wallet.currency = Currency::Usd;

        let now = Utc::now();
        let batch = UpdateBatch {
            has_updates: true,
            new_transactions: vec![
                NewTransaction {
                    kind: TransactionKind::Expense,
                    amount: -50.0,
                    category: "food".to_string(),
                    merchant: "Diner".to_string(),
                    note: String::new(),
                    timestamp: now,
                    location: None,
                },
                NewTransaction {
                    kind: TransactionKind::Income,
                    amount: 200.0,
                    category: "salary".to_string(),
                    merchant: "Workplace".to_string(),
                    note: String::new(),
                    timestamp: now,
                    location: None,
                },
            ],
            ..UpdateBatch::default()
        };

        let next = apply(&phone, &batch, 0).expect("apply");
        assert!((next.wallet.balance - 1150.0).abs() < f64::EPSILON);
        assert_eq!(next.wallet.transactions.len(), 2);
        assert!(next.wallet.transactions.iter().all(|t| t.is_new));
        assert!((next.recomputed_balance(1000.0) - next.wallet.balance).abs() < f64::EPSILON);
    }

    #[test]
    fn posts_are_prepended_and_profile_count_tracks_length() {
        let mut phone = base_phone();
        phone.profile = Some(SocialProfile {
            username: "mira".to_string(),
            display_name: "Mira".to_string(),
            bio: String::new(),
            posts_count: 0,
            followers: 10,
            following: 10,
        });

        let now = Utc::now();
        let post = |caption: &str| NewPost {
            kind: PostKind::Text,
            images: Vec::new(),
            caption: caption.to_string(),
            likes: 0,
            comments: Vec::new(),
            timestamp: now,
            music: None,
        };
        let batch = UpdateBatch {
            has_updates: true,
            new_posts: vec![post("older"), post("newer")],
            ..UpdateBatch::default()
        };

        let next = apply(&phone, &batch, 0).expect("apply");
        assert_eq!(next.posts[0].caption, "newer");
        assert_eq!(next.posts[1].caption, "older");
        assert_eq!(next.profile.as_ref().expect("profile").posts_count, 2);
    }

    #[test]
    fn stories_expire_a_day_after_merge() {
        let phone = base_phone();
        let now = Utc::now();
        let batch = UpdateBatch {
            has_updates: true,
            new_stories: vec![NewStory {
                image_description: Some("coffee selfie".to_string()),
                text_overlay: None,
                timestamp: now,
                views: 0,
            }],
            ..UpdateBatch::default()
        };

        let next = apply(&phone, &batch, 0).expect("apply");
        let story = &next.stories[0];
        let expires = story.expires_at.expect("expiry");
        let delta = expires - Utc::now();
        assert!(delta <= Duration::hours(24));
        assert!(delta > Duration::hours(23));
        assert!(story.is_new);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let phone = base_phone();
        let batch = UpdateBatch::default();
        let err = apply(&phone, &batch, 3).expect_err("must reject");
        assert!(matches!(err, PhoneError::EmptyBatch));
    }

    #[test]
    fn malformed_batch_leaves_snapshot_untouched() {
        let mut phone = base_phone();
        phone.wallet.balance = 500.0;
        let before = phone.clone();

        let now = Utc::now();
        let batch = UpdateBatch {
            has_updates: true,
            new_transactions: vec![NewTransaction {
                kind: TransactionKind::Expense,
                amount: 25.0,
                category: "misc".to_string(),
                merchant: "Shop".to_string(),
                note: String::new(),
                timestamp: now,
                location: None,
            }],
            // Blank contact name fails validation after the transaction list
            // would already have been merged under a mutate-in-place scheme.
            new_messages: vec![ThreadFragment {
                contact_name: "  ".to_string(),
                contact_type: ContactType::Npc,
                thread: vec![Message {
                    sender: "x".to_string(),
                    content: "y".to_string(),
                    timestamp: now,
                    read: false,
                }],
                last_message_time: now,
            }],
            ..UpdateBatch::default()
        };

        let err = apply(&phone, &batch, 9).expect_err("must reject");
        assert!(matches!(err, PhoneError::MalformedBatch { .. }));
        assert_eq!(phone, before);
    }

    #[test]
    fn timeline_index_never_decreases() {
        let mut phone = base_phone();
        phone.timeline.last_message_index = 40;

        let batch = batch_with_messages(vec![fragment("Mom", vec![("hi", true)])]);
        let next = apply(&phone, &batch, 12).expect("apply");
        assert_eq!(next.timeline.last_message_index, 40);

        let next = apply(&next, &batch, 55).expect("apply");
        assert_eq!(next.timeline.last_message_index, 55);
    }
}
