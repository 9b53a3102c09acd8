//! Derived unread/"new" aggregates over a snapshot.
//!
//! Messages keep a per-thread `unread_count`; every other category keeps a
//! per-record `is_new` flag. Reconciliation is the only path that raises
//! either marker; the mark-read operations here are the only paths that clear
//! them.

use crate::phone::PhoneData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Messages,
    Browser,
    Wallet,
    Notes,
    Locations,
    Posts,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Messages,
        Category::Browser,
        Category::Wallet,
        Category::Notes,
        Category::Locations,
        Category::Posts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Messages => "messages",
            Category::Browser => "browser",
            Category::Wallet => "wallet",
            Category::Notes => "notes",
            Category::Locations => "locations",
            Category::Posts => "posts",
        }
    }
}

/// Unread count for a category: summed `unread_count` for messages, `is_new`
/// records everywhere else.
pub fn count_unread(phone: &PhoneData, category: Category) -> usize {
    match category {
        Category::Messages => phone.messages.iter().map(|t| t.unread_count).sum(),
        Category::Browser => phone.browser_history.iter().filter(|e| e.is_new).count(),
        Category::Wallet => phone
            .wallet
            .transactions
            .iter()
            .filter(|t| t.is_new)
            .count(),
        Category::Notes => phone.notes.iter().filter(|n| n.is_new).count(),
        Category::Locations => phone.location_history.iter().filter(|l| l.is_new).count(),
        Category::Posts => phone.posts.iter().filter(|p| p.is_new).count(),
    }
}

/// Clear every unread marker in `category`. Returns false when nothing was
/// marked, so callers can skip a pointless save.
pub fn mark_category_read(phone: &mut PhoneData, category: Category) -> bool {
    let mut changed = false;
    match category {
        Category::Messages => {
            for thread in &mut phone.messages {
                if thread.unread_count > 0 {
                    thread.unread_count = 0;
                    changed = true;
                }
                for msg in &mut thread.thread {
                    if !msg.read {
                        msg.read = true;
                        changed = true;
                    }
                }
            }
        }
        Category::Browser => {
            for entry in &mut phone.browser_history {
                changed |= clear_flag(&mut entry.is_new);
            }
        }
        Category::Wallet => {
            for trans in &mut phone.wallet.transactions {
                changed |= clear_flag(&mut trans.is_new);
            }
        }
        Category::Notes => {
            for note in &mut phone.notes {
                changed |= clear_flag(&mut note.is_new);
            }
        }
        Category::Locations => {
            for loc in &mut phone.location_history {
                changed |= clear_flag(&mut loc.is_new);
            }
        }
        Category::Posts => {
            for post in &mut phone.posts {
                changed |= clear_flag(&mut post.is_new);
            }
        }
    }
    if changed {
        tracing::debug!(category = category.as_str(), "marked category read");
    }
    changed
}

fn clear_flag(flag: &mut bool) -> bool {
    let was_set = *flag;
    *flag = false;
    was_set
}

/// Mark one conversation read (the thread was opened); other threads are
/// untouched. Returns false when the thread is missing or already read.
pub fn mark_thread_read(phone: &mut PhoneData, thread_id: &str) -> bool {
    let Some(thread) = phone.messages.iter_mut().find(|t| t.id == thread_id) else {
        return false;
    };
    let mut changed = thread.unread_count > 0;
    thread.unread_count = 0;
    for msg in &mut thread.thread {
        if !msg.read {
            msg.read = true;
            changed = true;
        }
    }
    changed
}

/// Toggle the viewer's like on a post, adjusting the like counter in the same
/// direction. Returns the new liked state, or None if the post is missing.
/// Does not touch unread state.
pub fn toggle_post_like(phone: &mut PhoneData, post_id: &str) -> Option<bool> {
    let post = phone.posts.iter_mut().find(|p| p.id == post_id)?;
    post.liked_by_user = !post.liked_by_user;
    post.likes += if post.liked_by_user { 1 } else { -1 };
    Some(post.liked_by_user)
}

/// Clear the `is_new` flag on a single story. Returns false when the story is
/// missing or already viewed.
pub fn mark_story_viewed(phone: &mut PhoneData, story_id: &str) -> bool {
    match phone.stories.iter_mut().find(|s| s.id == story_id) {
        Some(story) => clear_flag(&mut story.is_new),
        None => false,
    }
}
