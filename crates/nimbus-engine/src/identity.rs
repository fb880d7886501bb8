//! Conversation store and identity reconciliation.
//!
//! Documents are addressed by `(ConversationId, TurnId)`. When the server
//! confirms a different conversation id (`session_created`) or replaces an
//! expired one mid-turn (`session_renewed`), the whole conversation record
//! moves to the new key. Built content is never dropped or duplicated, and
//! the active pointer follows the move.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nimbus_core::{ConversationId, TurnId};
use tracing::{debug, info};

use crate::document::Document;
use crate::turn::Turn;

/// One conversation and the documents produced in it.
#[derive(Clone, Debug)]
pub struct ConversationRecord {
    /// Conversation id.
    pub id: ConversationId,
    /// Display title.
    pub title: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Documents in creation order.
    pub documents: Vec<Document>,
}

impl ConversationRecord {
    fn new(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            created_at: now,
            updated_at: now,
            documents: Vec::new(),
        }
    }
}

/// Keyed store `ConversationId -> ConversationRecord` plus the active pointer.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<ConversationId, ConversationRecord>,
    active: Option<ConversationId>,
}

impl ConversationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the record for `id`.
    pub fn ensure(&mut self, id: &ConversationId) -> &mut ConversationRecord {
        self.conversations
            .entry(id.clone())
            .or_insert_with(|| ConversationRecord::new(id.clone()))
    }

    /// Record for `id`.
    pub fn get(&self, id: &ConversationId) -> Option<&ConversationRecord> {
        self.conversations.get(id)
    }

    /// Document of `turn_id` in `conversation_id`.
    pub fn document(&self, conversation_id: &ConversationId, turn_id: &TurnId) -> Option<&Document> {
        self.conversations
            .get(conversation_id)?
            .documents
            .iter()
            .find(|doc| &doc.turn_id == turn_id)
    }

    /// Document of `turn_id` in any conversation.
    pub fn find_document(&self, turn_id: &TurnId) -> Option<&Document> {
        self.conversations
            .values()
            .flat_map(|record| record.documents.iter())
            .find(|doc| &doc.turn_id == turn_id)
    }

    /// Mutable document of `turn_id` in `conversation_id`.
    pub fn document_mut(
        &mut self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
    ) -> Option<&mut Document> {
        let record = self.conversations.get_mut(conversation_id)?;
        record.updated_at = Utc::now();
        record.documents.iter_mut().find(|doc| &doc.turn_id == turn_id)
    }

    /// Get or lazily create the document of `turn_id`.
    pub fn ensure_document(
        &mut self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
    ) -> &mut Document {
        let record = self.ensure(conversation_id);
        record.updated_at = Utc::now();
        let index = match record.documents.iter().position(|doc| &doc.turn_id == turn_id) {
            Some(index) => index,
            None => {
                debug!(%turn_id, %conversation_id, "creating document");
                record
                    .documents
                    .push(Document::new(turn_id.clone(), conversation_id.clone()));
                record.documents.len() - 1
            }
        };
        &mut record.documents[index]
    }

    /// Insert a document, replacing one with the same turn id.
    pub fn insert_document(&mut self, doc: Document) {
        let record = self.ensure(&doc.conversation_id);
        record.updated_at = Utc::now();
        if let Some(existing) = record.documents.iter_mut().find(|d| d.turn_id == doc.turn_id) {
            *existing = doc;
        } else {
            record.documents.push(doc);
        }
    }

    /// Move the record of `old` to `new`.
    ///
    /// If `new` already exists, documents are merged in without duplicating
    /// turn ids. Returns `false` when `old` is unknown or equal to `new`.
    pub fn rekey(&mut self, old: &ConversationId, new: &ConversationId) -> bool {
        if old == new {
            return false;
        }
        let Some(mut moved) = self.conversations.remove(old) else {
            return false;
        };
        for doc in &mut moved.documents {
            doc.conversation_id = new.clone();
        }

        if let Some(target) = self.conversations.get_mut(new) {
            for doc in moved.documents {
                if !target.documents.iter().any(|d| d.turn_id == doc.turn_id) {
                    target.documents.push(doc);
                }
            }
            if target.title.is_none() {
                target.title = moved.title;
            }
            target.created_at = target.created_at.min(moved.created_at);
            target.updated_at = Utc::now();
        } else {
            moved.id = new.clone();
            moved.updated_at = Utc::now();
            let _ = self.conversations.insert(new.clone(), moved);
        }

        if self.active.as_ref() == Some(old) {
            self.active = Some(new.clone());
        }
        true
    }

    /// Point the active pointer at `id`.
    pub fn set_active(&mut self, id: ConversationId) {
        self.active = Some(id);
    }

    /// Current active conversation.
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Number of conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

/// An identity move applied to a turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rekey {
    /// Previous id.
    pub from: ConversationId,
    /// New id.
    pub to: ConversationId,
}

/// Handle `session_created`: confirm the turn's conversation id, re-keying
/// storage when the server assigned a different one.
pub fn on_session_created(
    store: &mut ConversationStore,
    turn: &mut Turn,
    confirmed: ConversationId,
) -> Option<Rekey> {
    if confirmed == turn.conversation_id {
        debug!(conversation_id = %confirmed, "conversation confirmed");
        let _ = store.ensure(&confirmed);
        return None;
    }

    let from = std::mem::replace(&mut turn.conversation_id, confirmed.clone());
    if !store.rekey(&from, &confirmed) {
        let _ = store.ensure(&confirmed);
    }
    info!(
        turn_id = %turn.turn_id,
        from = %from,
        to = %confirmed,
        "server assigned a different conversation id"
    );
    Some(Rekey {
        from,
        to: confirmed,
    })
}

/// Handle `session_renewed`: move everything under `old` to `new`.
pub fn on_session_renewed(
    store: &mut ConversationStore,
    turn: &mut Turn,
    old: ConversationId,
    new: ConversationId,
    reason: Option<&str>,
) -> Option<Rekey> {
    if old == new {
        return None;
    }
    let moved = store.rekey(&old, &new);
    let owns_turn = turn.conversation_id == old;
    if owns_turn {
        turn.conversation_id = new.clone();
    }
    if !moved && !owns_turn {
        debug!(from = %old, to = %new, "renewal for an unknown conversation ignored");
        return None;
    }
    info!(
        turn_id = %turn.turn_id,
        from = %old,
        to = %new,
        reason = reason.unwrap_or("unspecified"),
        "conversation renewed"
    );
    Some(Rekey { from: old, to: new })
}
