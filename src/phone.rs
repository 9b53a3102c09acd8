use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a prefixed record id, e.g. `note_7f3a...`.
pub fn new_record_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// The complete simulated phone state for one character.
///
/// Collections are append-oriented: reconciliation only ever adds records and
/// flips read markers; nothing is rewritten in place except derived fields
/// (`unread_count`, `wallet.balance`, `profile.posts_count`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneData {
    pub owner_id: String,
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
    #[serde(default)]
    pub settings: PhoneSettings,
    pub timeline: Timeline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageThread {
    #[serde(default)]
    pub id: String,
    pub contact_name: String,
    #[serde(default)]
    pub contact_type: ContactType,
    pub thread: Vec<Message>,
    pub last_message_time: DateTime<Utc>,
    /// Count of `read == false` messages in `thread`; maintained, not derived.
    #[serde(default)]
    pub unread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_read")]
    pub read: bool,
}

fn default_read() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    #[default]
    Npc,
    Friend,
    Family,
    Colleague,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub balance: f64,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Vnd,
    #[default]
    Usd,
    Eur,
    Gbp,
    Jpy,
}

impl Currency {
    pub fn symbol(self) -> &'static str {
        match self {
            Currency::Vnd => "₫",
            Currency::Usd => "$",
            Currency::Eur => "€",
            Currency::Gbp => "£",
            Currency::Jpy => "¥",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Signed: negative = expense, positive = income.
    pub amount: f64,
    pub category: String,
    pub merchant: String,
    #[serde(default)]
    pub note: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Expense,
    Income,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserEntry {
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationVisit {
    #[serde(default)]
    pub id: String,
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
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    #[default]
    Walk,
    Car,
    Bike,
    Transit,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialPost {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: PostKind,
    #[serde(default)]
    pub images: Vec<PostImage>,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub liked_by_user: bool,
    #[serde(default)]
    pub comments: Vec<PostComment>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub music: Option<MusicTag>,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Photo,
    #[default]
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostImage {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostComment {
    pub username: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicTag {
    pub title: String,
    pub artist: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialStory {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub image_description: Option<String>,
    #[serde(default)]
    pub text_overlay: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub views: u32,
    /// Set to creation time + 24h when merged in.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialProfile {
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub posts_count: usize,
    #[serde(default)]
    pub followers: u32,
    #[serde(default)]
    pub following: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneSettings {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "default_wallpaper")]
    pub wallpaper: String,
    #[serde(default = "Utc::now")]
    pub last_opened: DateTime<Utc>,
}

fn default_wallpaper() -> String {
    "default".to_string()
}

impl Default for PhoneSettings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            wallpaper: default_wallpaper(),
            last_opened: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

/// Tracks how far into the host conversation the snapshot has been synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Index of the last conversation turn already folded into the snapshot.
    /// Monotonically non-decreasing.
    pub last_message_index: usize,
    pub last_sync: DateTime<Utc>,
}

/// Count of unread messages in a thread slice.
pub fn unread_in(messages: &[Message]) -> usize {
    messages.iter().filter(|m| !m.read).count()
}

impl MessageThread {
    /// True when `unread_count` matches the actual unread messages.
    pub fn unread_consistent(&self) -> bool {
        self.unread_count == unread_in(&self.thread)
    }
}

impl PhoneData {
    /// An empty snapshot for a freshly opened character.
    pub fn empty(owner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            messages: Vec::new(),
            browser_history: Vec::new(),
            wallet: Wallet {
                balance: 0.0,
                currency: Currency::default(),
                transactions: Vec::new(),
            },
            notes: Vec::new(),
            location_history: Vec::new(),
            posts: Vec::new(),
            stories: Vec::new(),
            profile: None,
            settings: PhoneSettings {
                theme: Theme::Dark,
                wallpaper: default_wallpaper(),
                last_opened: now,
            },
            timeline: Timeline {
                last_message_index: 0,
                last_sync: now,
            },
        }
    }

    /// Deterministic fallback snapshot used when extraction fails, so the
    /// caller always has something to render.
    pub fn placeholder(
        owner_id: impl Into<String>,
        character_name: &str,
        chat_len: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut phone = Self::empty(owner_id, now);
        phone.messages.push(MessageThread {
            id: "msg_001".to_string(),
            contact_name: "Friend".to_string(),
            contact_type: ContactType::Npc,
            thread: vec![
                Message {
                    sender: "Friend".to_string(),
                    content: "Hey! How are you?".to_string(),
                    timestamp: now,
                    read: true,
                },
                Message {
                    sender: character_name.to_string(),
                    content: "I'm good, thanks!".to_string(),
                    timestamp: now,
                    read: true,
                },
            ],
            last_message_time: now,
            unread_count: 0,
        });
        phone.browser_history.push(BrowserEntry {
            id: "browse_001".to_string(),
            url: "www.example.com".to_string(),
            title: "Example Search".to_string(),
            timestamp: now,
            reason: Some("Looking for information".to_string()),
            category: "general".to_string(),
            is_new: false,
        });
        phone.wallet = Wallet {
            balance: 1000.0,
            currency: Currency::Usd,
            transactions: vec![Transaction {
                id: "trans_001".to_string(),
                kind: TransactionKind::Expense,
                amount: -50.0,
                category: "food".to_string(),
                merchant: "Coffee Shop".to_string(),
                note: "Morning coffee".to_string(),
                timestamp: now,
                location: Some("Downtown".to_string()),
                is_new: false,
            }],
        };
        phone.notes.push(Note {
            id: "note_001".to_string(),
            title: "Todo".to_string(),
            content: "Remember to check messages".to_string(),
            created_at: now,
            updated_at: now,
            category: "personal".to_string(),
            pinned: false,
            is_new: false,
        });
        phone.location_history.push(LocationVisit {
            id: "loc_001".to_string(),
            from: "Home".to_string(),
            to: "Work".to_string(),
            departure_time: now,
            arrival_time: now,
            travel_mode: TravelMode::Car,
            purpose: "Commute".to_string(),
            route: vec!["Home".to_string(), "Work".to_string()],
            is_new: false,
        });
        phone.posts.push(SocialPost {
            id: "post_001".to_string(),
            kind: PostKind::Text,
            images: Vec::new(),
            caption: "Sometimes silence speaks louder than words".to_string(),
            likes: 95,
            liked_by_user: false,
            comments: Vec::new(),
            timestamp: now,
            music: None,
            is_new: false,
        });
        phone.profile = Some(SocialProfile {
            username: character_name.to_lowercase().replace(char::is_whitespace, "_"),
            display_name: character_name.to_string(),
            bio: "Living my best life".to_string(),
            posts_count: 1,
            followers: 486,
            following: 312,
        });
        phone.timeline.last_message_index = chat_len.saturating_sub(1);
        phone
    }

    /// Recompute the wallet balance from scratch for consistency checks.
    /// `initial` is whatever the balance was before the first recorded
    /// transaction.
    pub fn recomputed_balance(&self, initial: f64) -> f64 {
        initial + self.wallet.transactions.iter().map(|t| t.amount).sum::<f64>()
    }
}
