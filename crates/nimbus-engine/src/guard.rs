//! Dedup and race guards.
//!
//! [`ProcessedIds`] lives inside one turn's context, so a new turn starts
//! with an empty set by construction. [`PendingAccounting`] is keyed by turn
//! and drained exactly once.

use std::collections::{HashMap, HashSet};

use nimbus_core::{TokenUsage, TurnId};

/// Tool-invocation ids admitted during the current turn.
#[derive(Clone, Debug, Default)]
pub struct ProcessedIds {
    ids: HashSet<String>,
}

impl ProcessedIds {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `id`; returns `false` if it was already admitted.
    pub fn admit(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        let _ = self.ids.insert(id.to_owned());
        true
    }

    /// Whether `id` was admitted.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of admitted ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no id was admitted.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Token accounting that arrived before its document was addressable.
#[derive(Clone, Debug, Default)]
pub struct PendingAccounting {
    pending: HashMap<TurnId, TokenUsage>,
}

impl PendingAccounting {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stash the latest counts for `turn_id`.
    pub fn stash(&mut self, turn_id: &TurnId, usage: TokenUsage) {
        let _ = self.pending.insert(turn_id.clone(), usage);
    }

    /// Remove and return the counts for `turn_id`.
    pub fn drain(&mut self, turn_id: &TurnId) -> Option<TokenUsage> {
        self.pending.remove(turn_id)
    }

    /// Discard every entry not owned by `turn_id`; returns how many went.
    pub fn purge_except(&mut self, turn_id: &TurnId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|id, _| id == turn_id);
        before - self.pending.len()
    }

    /// Whether counts are stashed for `turn_id`.
    pub fn contains(&self, turn_id: &TurnId) -> bool {
        self.pending.contains_key(turn_id)
    }

    /// Number of stashed entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is stashed.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            ..TokenUsage::default()
        }
    }

    #[test]
    fn admit_rejects_repeats() {
        let mut ids = ProcessedIds::new();
        assert!(ids.admit("t1"));
        assert!(!ids.admit("t1"));
        assert!(ids.admit("t2"));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn drain_is_exactly_once() {
        let mut pending = PendingAccounting::new();
        let turn = TurnId::from("q1");
        pending.stash(&turn, usage(1));
        pending.stash(&turn, usage(7));
        assert_eq!(pending.drain(&turn).unwrap().input_tokens, 7);
        assert!(pending.drain(&turn).is_none());
    }

    #[test]
    fn purge_keeps_only_current_turn() {
        let mut pending = PendingAccounting::new();
        let old = TurnId::from("q-old");
        let current = TurnId::from("q-new");
        pending.stash(&old, usage(1));
        pending.stash(&current, usage(2));
        assert_eq!(pending.purge_except(&current), 1);
        assert!(!pending.contains(&old));
        assert!(pending.contains(&current));
    }
}
