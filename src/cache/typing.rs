use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Tracks who is typing in which conversation. Entries expire after the TTL
/// unless refreshed, so a client that vanishes mid-keystroke never leaves a
/// stuck indicator.
pub struct TypingCache {
    ttl: Duration,
    entries: DashMap<(Uuid, Uuid), Instant>,
}

impl TypingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Returns true when the caller's typing state actually changed, so the
    /// caller can skip redundant fan-out for refreshes.
    pub fn set_typing(&self, conversation_id: Uuid, user_id: Uuid, is_typing: bool) -> bool {
        let key = (conversation_id, user_id);
        if is_typing {
            let was_live = self
                .entries
                .insert(key, Instant::now() + self.ttl)
                .map(|expiry| expiry > Instant::now())
                .unwrap_or(false);
            !was_live
        } else {
            self.entries.remove(&key).is_some()
        }
    }

    pub fn typing_users(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let now = Instant::now();
        let mut users = Vec::new();
        self.entries.retain(|(conv, user), expiry| {
            if *expiry <= now {
                return false;
            }
            if *conv == conversation_id {
                users.push(*user);
            }
            true
        });
        users
    }

    /// Drops expired entries, returning the pairs that lapsed so the caller
    /// can synthesize stopped-typing events.
    pub fn sweep(&self) -> Vec<(Uuid, Uuid)> {
        let now = Instant::now();
        let mut lapsed = Vec::new();
        self.entries.retain(|key, expiry| {
            if *expiry <= now {
                lapsed.push(*key);
                return false;
            }
            true
        });
        lapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_appears_and_clears() {
        let cache = TypingCache::new(Duration::from_secs(10));
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(cache.set_typing(conv, user, true));
        assert_eq!(cache.typing_users(conv), vec![user]);

        assert!(cache.set_typing(conv, user, false));
        assert!(cache.typing_users(conv).is_empty());
    }

    #[test]
    fn refresh_is_not_a_state_change() {
        let cache = TypingCache::new(Duration::from_secs(10));
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(cache.set_typing(conv, user, true));
        assert!(!cache.set_typing(conv, user, true));
    }

    #[test]
    fn clearing_an_absent_entry_changes_nothing() {
        let cache = TypingCache::new(Duration::from_secs(10));
        assert!(!cache.set_typing(Uuid::new_v4(), Uuid::new_v4(), false));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = TypingCache::new(Duration::from_millis(20));
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.set_typing(conv, user, true);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.typing_users(conv).is_empty());
    }

    #[test]
    fn sweep_reports_lapsed_pairs() {
        let cache = TypingCache::new(Duration::from_millis(20));
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.set_typing(conv, user, true);
        std::thread::sleep(Duration::from_millis(40));
        let lapsed = cache.sweep();
        assert_eq!(lapsed, vec![(conv, user)]);
        assert!(cache.sweep().is_empty());
    }

    #[test]
    fn conversations_are_isolated() {
        let cache = TypingCache::new(Duration::from_secs(10));
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();
        let user = Uuid::new_v4();

        cache.set_typing(conv_a, user, true);
        assert!(cache.typing_users(conv_b).is_empty());
    }
}
