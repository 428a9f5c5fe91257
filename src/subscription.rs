// =============================================================================
// Subscription Index — bidirectional user ⇄ stock map
// =============================================================================
//
// Both directions are mutated under one write lock so the invariant
// `code ∈ stocks_of(u) ⇔ u ∈ subscribers_of(code)` holds after every
// operation. Critical sections are short; callers copy the sets they need out
// before doing any I/O.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

#[derive(Default)]
struct Index {
    by_user: HashMap<String, HashSet<String>>,
    by_code: HashMap<String, HashSet<String>>,
}

/// Thread-safe bidirectional map between user ids and subscribed ts-codes.
#[derive(Default)]
pub struct SubscriptionIndex {
    inner: RwLock<Index>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the given codes to a user's subscription set. Idempotent per
    /// `(user, code)` pair. Codes must already be validated and normalised.
    pub fn subscribe(&self, user_id: &str, codes: &[String]) {
        if codes.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let user_set = inner.by_user.entry(user_id.to_string()).or_default();
        let mut added: Vec<&String> = Vec::new();
        for code in codes {
            if user_set.insert(code.clone()) {
                added.push(code);
            }
        }
        for code in added {
            inner
                .by_code
                .entry(code.clone())
                .or_default()
                .insert(user_id.to_string());
        }
    }

    /// Remove the given codes from a user's subscription set. Unknown codes
    /// are a no-op. Emptied sets are dropped from both maps.
    pub fn unsubscribe(&self, user_id: &str, codes: &[String]) {
        if codes.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let mut emptied_user = false;
        if let Some(user_set) = inner.by_user.get_mut(user_id) {
            for code in codes {
                user_set.remove(code);
            }
            emptied_user = user_set.is_empty();
        }
        if emptied_user {
            inner.by_user.remove(user_id);
        }
        for code in codes {
            let emptied = match inner.by_code.get_mut(code) {
                Some(set) => {
                    set.remove(user_id);
                    set.is_empty()
                }
                None => false,
            };
            if emptied {
                inner.by_code.remove(code);
            }
        }
    }

    /// Remove the user from every stock set. Called on disconnect.
    pub fn unsubscribe_all(&self, user_id: &str) {
        let mut inner = self.inner.write();
        let codes = match inner.by_user.remove(user_id) {
            Some(set) => set,
            None => return,
        };
        for code in codes {
            let emptied = match inner.by_code.get_mut(&code) {
                Some(set) => {
                    set.remove(user_id);
                    set.is_empty()
                }
                None => false,
            };
            if emptied {
                inner.by_code.remove(&code);
            }
        }
    }

    /// The set of codes a user is subscribed to.
    pub fn stocks_of(&self, user_id: &str) -> HashSet<String> {
        self.inner
            .read()
            .by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The set of users subscribed to a code.
    pub fn subscribers_of(&self, code: &str) -> HashSet<String> {
        self.inner
            .read()
            .by_code
            .get(code)
            .cloned()
            .unwrap_or_default()
    }

    /// Union of all subscribed codes across users, in sorted order so the
    /// fan-out issues deterministic upstream requests.
    pub fn all_subscribed_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.inner.read().by_code.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Number of users with at least one subscription.
    pub fn user_count(&self) -> usize {
        self.inner.read().by_user.len()
    }

    /// Number of distinct subscribed codes.
    pub fn code_count(&self) -> usize {
        self.inner.read().by_code.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
