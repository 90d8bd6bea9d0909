//! Pure dialog state: the message list, its load phase, and the merge rules
//! that keep it consistent under overlapping history pages and feed batches.
//!
//! Nothing here is async. The worker owns one `DialogState` and applies
//! every transition on its own task, which is what makes the merge rules
//! race-free.

use parley_store::{
    ConversationId, ConversationRecord, MessageId, MessagePage, MessageRecord, RequestId,
    chronological,
};

/// Where the selected conversation is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// No conversation selected yet.
    Idle,
    /// Initial history fetch in flight; `attempt` is 1-based.
    LoadingInitial { attempt: u32 },
    /// History present and the live feed is (or is about to be) attached.
    Ready,
    /// An older page is being fetched; the list is still usable.
    LoadingOlder,
    /// Initial load exhausted its retry budget.
    Failed,
}

#[derive(Debug, Clone)]
pub struct DialogState {
    pub request_id: Option<RequestId>,
    pub conversation_id: Option<ConversationId>,
    /// Ascending by `created_at`, ties broken by id. Every mutation below
    /// preserves this.
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
    pub phase: LoadPhase,
    /// Sibling conversations under the same parent request.
    pub siblings: Vec<ConversationRecord>,
    pub last_error: Option<String>,
    /// Outcome of the most recent failed send/edit/delete, if any.
    pub mutation_error: Option<String>,
    /// Set when the push feed drops; history stays usable.
    pub feed_notice: Option<String>,
}

impl Default for DialogState {
    fn default() -> Self {
        Self {
            request_id: None,
            conversation_id: None,
            messages: Vec::new(),
            has_more: false,
            phase: LoadPhase::Idle,
            siblings: Vec::new(),
            last_error: None,
            mutation_error: None,
            feed_notice: None,
        }
    }
}

impl DialogState {
    /// Clears per-conversation state for a fresh selection. Siblings survive
    /// when the parent request is unchanged; a new request drops them until
    /// the next fetch repopulates the list.
    pub fn reset_for_selection(
        &mut self,
        request_id: RequestId,
        conversation_id: Option<ConversationId>,
    ) {
        if self.request_id != Some(request_id) {
            self.siblings.clear();
        }
        self.request_id = Some(request_id);
        self.conversation_id = conversation_id;
        self.messages.clear();
        // Optimistic until the first page says otherwise.
        self.has_more = true;
        self.last_error = None;
        self.mutation_error = None;
        self.feed_notice = None;
        self.phase = LoadPhase::LoadingInitial { attempt: 1 };
    }

    /// Pagination anchor: the oldest message currently loaded.
    pub fn oldest_loaded(&self) -> Option<MessageId> {
        self.messages.first().map(|message| message.id)
    }

    pub fn apply_initial_page(&mut self, page: MessagePage) {
        self.messages = page.messages;
        self.messages.sort_by(chronological);
        self.has_more = page.has_more;
        self.siblings = page.siblings;
        self.last_error = None;
        self.phase = LoadPhase::Ready;
    }

    /// Terminal initial-load failure. `has_more` and the cursor are left
    /// alone so a later manual retry resumes cleanly.
    pub fn initial_load_failed(&mut self, details: String) {
        self.phase = LoadPhase::Failed;
        self.last_error = Some(details);
    }

    pub fn begin_loading_older(&mut self) {
        self.phase = LoadPhase::LoadingOlder;
    }

    /// Prepends an older page. The page arrives oldest→newest and is
    /// strictly older than everything loaded, so splicing at the front keeps
    /// the order invariant.
    pub fn apply_older_page(&mut self, page: MessagePage) {
        let mut merged = page.messages;
        merged.append(&mut self.messages);
        self.messages = merged;
        self.has_more = page.has_more;
        self.phase = LoadPhase::Ready;
    }

    /// Pagination failure keeps the loaded window, `has_more`, and the
    /// cursor untouched; only an error surfaces.
    pub fn older_load_failed(&mut self, details: String) {
        self.phase = LoadPhase::Ready;
        self.last_error = Some(details);
    }

    /// Merges a live feed batch. Known ids are updated in place, unseen ones
    /// appended, then the whole list is re-sorted. Applying the same batch
    /// twice is a no-op. Returns how many messages were truly new.
    pub fn merge_feed_batch(&mut self, batch: Vec<MessageRecord>) -> usize {
        let mut appended = 0;
        for incoming in batch {
            match self
                .messages
                .iter_mut()
                .find(|existing| existing.id == incoming.id)
            {
                Some(existing) => {
                    if *existing != incoming {
                        *existing = incoming;
                    }
                }
                None => {
                    self.messages.push(incoming);
                    appended += 1;
                }
            }
        }
        self.messages.sort_by(chronological);
        appended
    }

    pub fn apply_edited(&mut self, record: MessageRecord) {
        if let Some(existing) = self
            .messages
            .iter_mut()
            .find(|existing| existing.id == record.id)
        {
            *existing = record;
        }
    }

    pub fn apply_deleted(&mut self, message_id: MessageId) {
        self.messages.retain(|message| message.id != message_id);
    }

    pub fn mutation_failed(&mut self, details: String) {
        self.mutation_error = Some(details);
    }

    pub fn feed_lost(&mut self, details: String) {
        self.feed_notice = Some(details);
    }

    pub fn is_ordered(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| chronological(&pair[0], &pair[1]).is_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use parley_store::{AccountId, MessageKind, SenderRole};

    fn message(minute: i64) -> MessageRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute);
        MessageRecord {
            id: MessageId::generate(),
            conversation_id: ConversationId::generate(),
            body: format!("minute {minute}"),
            kind: MessageKind::Text,
            sender_role: SenderRole::Student,
            sender_id: AccountId::generate(),
            created_at: at,
            updated_at: at,
            edited: false,
            seen: false,
        }
    }

    fn ready_state(messages: Vec<MessageRecord>) -> DialogState {
        let mut state = DialogState::default();
        state.reset_for_selection(RequestId::generate(), Some(ConversationId::generate()));
        state.apply_initial_page(MessagePage {
            messages,
            has_more: true,
            siblings: Vec::new(),
        });
        state
    }

    #[test]
    fn feed_merge_is_idempotent_and_deduplicates() {
        let loaded = vec![message(0), message(1), message(2)];
        let mut state = ready_state(loaded.clone());

        let fresh = message(3);
        let mut batch = loaded[1..].to_vec();
        batch.push(fresh.clone());

        assert_eq!(state.merge_feed_batch(batch.clone()), 1);
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages.last().unwrap().id, fresh.id);

        // The same overlapping batch again changes nothing.
        assert_eq!(state.merge_feed_batch(batch), 0);
        assert_eq!(state.messages.len(), 4);
        assert!(state.is_ordered());
    }

    #[test]
    fn feed_merge_restores_order_for_out_of_order_arrivals() {
        let mut state = ready_state(vec![message(5), message(9)]);

        // A batch carrying something older than the newest loaded message.
        state.merge_feed_batch(vec![message(7), message(11)]);
        assert_eq!(state.messages.len(), 4);
        assert!(state.is_ordered());
    }

    #[test]
    fn feed_merge_applies_remote_edits_in_place() {
        let original = message(1);
        let mut state = ready_state(vec![message(0), original.clone(), message(2)]);

        let mut revised = original.clone();
        revised.body = "corrected".to_string();
        revised.edited = true;
        state.merge_feed_batch(vec![revised]);

        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.messages[1].id, original.id);
        assert_eq!(state.messages[1].body, "corrected");
        assert!(state.messages[1].edited);
    }

    #[test]
    fn older_page_prepends_and_moves_cursor() {
        let older = vec![message(0), message(1)];
        let newer = vec![message(2), message(3)];
        let mut state = ready_state(newer.clone());
        assert_eq!(state.oldest_loaded(), Some(newer[0].id));

        state.begin_loading_older();
        assert_eq!(state.phase, LoadPhase::LoadingOlder);
        state.apply_older_page(MessagePage {
            messages: older.clone(),
            has_more: false,
            siblings: Vec::new(),
        });

        assert_eq!(state.phase, LoadPhase::Ready);
        assert!(!state.has_more);
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.oldest_loaded(), Some(older[0].id));
        assert!(state.is_ordered());
    }

    #[test]
    fn pagination_failure_keeps_window_and_cursor() {
        let loaded = vec![message(2), message(3)];
        let mut state = ready_state(loaded.clone());
        let cursor = state.oldest_loaded();

        state.begin_loading_older();
        state.older_load_failed("store unreachable".to_string());

        assert_eq!(state.phase, LoadPhase::Ready);
        assert!(state.has_more);
        assert_eq!(state.oldest_loaded(), cursor);
        assert_eq!(state.messages.len(), 2);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn selection_reset_clears_conversation_state() {
        let request = RequestId::generate();
        let mut state = ready_state(vec![message(0), message(1)]);
        state.last_error = Some("stale".to_string());
        state.feed_notice = Some("stale".to_string());
        let first_request = state.request_id;

        state.reset_for_selection(request, Some(ConversationId::generate()));
        assert_ne!(state.request_id, first_request);
        assert!(state.messages.is_empty());
        assert!(state.has_more);
        assert!(state.last_error.is_none());
        assert!(state.feed_notice.is_none());
        assert_eq!(state.phase, LoadPhase::LoadingInitial { attempt: 1 });
    }

    #[test]
    fn siblings_survive_switch_within_same_request() {
        let request = RequestId::generate();
        let mut state = DialogState::default();
        state.reset_for_selection(request, Some(ConversationId::generate()));
        state.apply_initial_page(MessagePage {
            messages: vec![message(0)],
            has_more: false,
            siblings: vec![ConversationRecord {
                id: ConversationId::generate(),
                request_id: request,
                student_id: AccountId::generate(),
                tutor_id: AccountId::generate(),
                operator_id: None,
                last_message: None,
                unread_student: 0,
                unread_tutor: 0,
            }],
        });
        assert_eq!(state.siblings.len(), 1);

        state.reset_for_selection(request, Some(ConversationId::generate()));
        assert_eq!(state.siblings.len(), 1);

        state.reset_for_selection(RequestId::generate(), None);
        assert!(state.siblings.is_empty());
    }

    #[test]
    fn local_edit_and_delete_apply_in_place() {
        let target = message(1);
        let mut state = ready_state(vec![message(0), target.clone(), message(2)]);

        let mut revised = target.clone();
        revised.body = "rewritten".to_string();
        revised.edited = true;
        state.apply_edited(revised);
        assert_eq!(state.messages[1].body, "rewritten");
        assert_eq!(state.messages.len(), 3);
        assert!(state.is_ordered());

        state.apply_deleted(target.id);
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages.iter().all(|message| message.id != target.id));

        // Deleting something unknown is a no-op.
        state.apply_deleted(MessageId::generate());
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn initial_failure_is_terminal_until_reset() {
        let mut state = DialogState::default();
        state.reset_for_selection(RequestId::generate(), Some(ConversationId::generate()));
        state.initial_load_failed("store down".to_string());

        assert_eq!(state.phase, LoadPhase::Failed);
        assert!(state.last_error.is_some());
        assert!(state.messages.is_empty());
    }
}
