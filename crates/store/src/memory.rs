//! In-memory reference implementation of the store seams.
//!
//! Behaves like the production document store from the dialog's point of
//! view: newest-first paging with a clamped server-side limit, `has_more`
//! reported as "the page came back full", a push feed that re-broadcasts the
//! most recent window on every change, and sibling discovery keyed by the
//! parent request. Used by the QA runner and the integration suite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::{
    ConversationNotFoundSnafu, EmptyBodySnafu, MessageNotFoundSnafu, RejectedSnafu, StoreResult,
};
use crate::feed::{FeedEvent, FeedSubscription, make_feed_channel};
use crate::ids::{AccountId, ConversationId, MessageId, RequestId};
use crate::types::{
    ConversationRecord, LastMessageSummary, MessagePage, MessagePatch, MessageRecord, NewMessage,
    PageRequest, Profile, SenderRole,
};
use crate::{BoxFuture, IdentityBackend, MessageBackend};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 50;
pub const DEFAULT_FEED_WINDOW: usize = 10;

struct Watcher {
    token: u64,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

struct ConversationSlot {
    record: ConversationRecord,
    /// Kept in chronological order at all times.
    messages: Vec<MessageRecord>,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, ConversationSlot>,
    by_request: HashMap<RequestId, Vec<ConversationId>>,
    profiles: HashMap<AccountId, Profile>,
    next_watcher_token: u64,
}

pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    operator_account: AccountId,
    page_size: usize,
    feed_window: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            operator_account: AccountId::generate(),
            page_size: DEFAULT_PAGE_SIZE,
            feed_window: DEFAULT_FEED_WINDOW,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_feed_window(mut self, feed_window: usize) -> Self {
        self.feed_window = feed_window.max(1);
        self
    }

    pub fn operator_account(&self) -> AccountId {
        self.operator_account
    }

    /// Creates an empty conversation under the given parent request.
    pub fn create_conversation(
        &self,
        request_id: RequestId,
        student_id: AccountId,
        tutor_id: AccountId,
    ) -> ConversationRecord {
        let record = ConversationRecord {
            id: ConversationId::generate(),
            request_id,
            student_id,
            tutor_id,
            operator_id: None,
            last_message: None,
            unread_student: 0,
            unread_tutor: 0,
        };

        let mut inner = self.lock();
        inner
            .by_request
            .entry(request_id)
            .or_default()
            .push(record.id);
        inner.conversations.insert(
            record.id,
            ConversationSlot {
                record: record.clone(),
                messages: Vec::new(),
                watchers: Vec::new(),
            },
        );
        record
    }

    /// Seeds history without waking the feed, for fixtures that predate the
    /// dialog being opened.
    pub fn insert_history(
        &self,
        conversation_id: ConversationId,
        mut records: Vec<MessageRecord>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let slot = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| {
                ConversationNotFoundSnafu {
                    stage: "memory-insert-history",
                    conversation_id,
                }
                .build()
            })?;

        slot.messages.append(&mut records);
        slot.messages.sort_by(crate::types::chronological);
        Ok(())
    }

    pub fn register_profile(&self, account_id: AccountId, nickname: &str, email: &str) {
        self.lock().profiles.insert(
            account_id,
            Profile {
                nickname: nickname.to_string(),
                email: email.to_string(),
            },
        );
    }

    /// Number of live feed watchers for a conversation. Test observability.
    pub fn watcher_count(&self, conversation_id: ConversationId) -> usize {
        self.lock()
            .conversations
            .get(&conversation_id)
            .map(|slot| slot.watchers.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn siblings_for(inner: &Inner, request_id: RequestId) -> Vec<ConversationRecord> {
        inner
            .by_request
            .get(&request_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.conversations.get(id))
                    .map(|slot| slot.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn page_for(&self, slot: &ConversationSlot, before: Option<MessageId>) -> (Vec<MessageRecord>, bool) {
        // Messages strictly older than the anchor, newest first, then
        // reversed for oldest→newest delivery. A vanished anchor falls back
        // to the newest page, as the production route does.
        let upper = before
            .and_then(|anchor| slot.messages.iter().position(|message| message.id == anchor))
            .unwrap_or(slot.messages.len());

        let start = upper.saturating_sub(self.page_size);
        let page = slot.messages[start..upper].to_vec();
        let has_more = page.len() == self.page_size;
        (page, has_more)
    }

    fn broadcast(&self, conversation_id: ConversationId) {
        let mut inner = self.lock();
        let Some(slot) = inner.conversations.get_mut(&conversation_id) else {
            return;
        };

        let window_start = slot.messages.len().saturating_sub(self.feed_window);
        let window = slot.messages[window_start..].to_vec();
        let before = slot.watchers.len();
        slot.watchers
            .retain(|watcher| watcher.sender.send(FeedEvent::Batch(window.clone())).is_ok());
        let pruned = before - slot.watchers.len();
        if pruned > 0 {
            tracing::debug!(%conversation_id, pruned, "dropped dead feed watchers");
        }
    }

}

impl MessageBackend for MemoryBackend {
    fn fetch_page(&self, request: PageRequest) -> BoxFuture<'_, StoreResult<MessagePage>> {
        Box::pin(async move {
            let inner = self.lock();
            let siblings = if request.before.is_none() {
                Self::siblings_for(&inner, request.request_id)
            } else {
                Vec::new()
            };

            let Some(conversation_id) = request.conversation_id else {
                // Discovery: chat list only, like the production route when
                // no conversation is named.
                return Ok(MessagePage {
                    messages: Vec::new(),
                    has_more: false,
                    siblings,
                });
            };

            let slot = inner.conversations.get(&conversation_id).ok_or_else(|| {
                ConversationNotFoundSnafu {
                    stage: "memory-fetch-page",
                    conversation_id,
                }
                .build()
            })?;

            let (messages, has_more) = self.page_for(slot, request.before);
            Ok(MessagePage {
                messages,
                has_more,
                siblings,
            })
        })
    }

    fn open_feed(&self, conversation_id: ConversationId) -> StoreResult<FeedSubscription> {
        let (event_tx, subscription, cancel_rx) = make_feed_channel(conversation_id);

        let (token, window) = {
            let mut inner = self.lock();
            let token = inner.next_watcher_token;
            inner.next_watcher_token += 1;

            let slot = inner
                .conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| {
                    ConversationNotFoundSnafu {
                        stage: "memory-open-feed",
                        conversation_id,
                    }
                    .build()
                })?;

            let window_start = slot.messages.len().saturating_sub(self.feed_window);
            let window = slot.messages[window_start..].to_vec();
            slot.watchers.push(Watcher {
                token,
                sender: event_tx.clone(),
            });
            (token, window)
        };

        // The push layer delivers the current window immediately on attach.
        let _ = event_tx.send(FeedEvent::Batch(window));

        // Detach the watcher as soon as the subscription is cancelled or
        // dropped, so switch-away tears down promptly instead of waiting for
        // the next failed broadcast.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = cancel_rx.await;
            let mut inner = inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(slot) = inner.conversations.get_mut(&conversation_id) {
                slot.watchers.retain(|watcher| watcher.token != token);
            }
        });

        Ok(subscription)
    }

    fn send_message(
        &self,
        conversation_id: ConversationId,
        draft: NewMessage,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        Box::pin(async move {
            let body = draft.body.trim().to_string();
            if body.is_empty() {
                return EmptyBodySnafu {
                    stage: "memory-send-message",
                }
                .fail();
            }

            let record = {
                let mut inner = self.lock();
                let slot = inner
                    .conversations
                    .get_mut(&conversation_id)
                    .ok_or_else(|| {
                        ConversationNotFoundSnafu {
                            stage: "memory-send-message",
                            conversation_id,
                        }
                        .build()
                    })?;

                let now = Utc::now();
                let record = MessageRecord {
                    id: MessageId::generate(),
                    conversation_id,
                    body,
                    kind: draft.kind,
                    sender_role: SenderRole::Operator,
                    sender_id: self.operator_account,
                    created_at: now,
                    updated_at: now,
                    edited: false,
                    seen: false,
                };

                slot.messages.push(record.clone());
                slot.messages.sort_by(crate::types::chronological);
                slot.record.last_message = Some(LastMessageSummary {
                    body: record.body.clone(),
                    kind: record.kind,
                    at: record.created_at,
                });
                slot.record.unread_student += 1;
                slot.record.unread_tutor += 1;
                record
            };

            self.broadcast(conversation_id);
            Ok(record)
        })
    }

    fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        Box::pin(async move {
            let record = {
                let mut inner = self.lock();
                let slot = inner
                    .conversations
                    .get_mut(&conversation_id)
                    .ok_or_else(|| {
                        ConversationNotFoundSnafu {
                            stage: "memory-edit-message",
                            conversation_id,
                        }
                        .build()
                    })?;

                let message = slot
                    .messages
                    .iter_mut()
                    .find(|message| message.id == message_id)
                    .ok_or_else(|| {
                        MessageNotFoundSnafu {
                            stage: "memory-edit-message",
                            conversation_id,
                            message_id,
                        }
                        .build()
                    })?;

                if let Some(body) = patch.body {
                    let body = body.trim().to_string();
                    if body.is_empty() {
                        return EmptyBodySnafu {
                            stage: "memory-edit-message",
                        }
                        .fail();
                    }
                    message.body = body;
                }
                message.edited = true;
                message.updated_at = Utc::now();
                message.clone()
            };

            self.broadcast(conversation_id);
            Ok(record)
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            {
                let mut inner = self.lock();
                let slot = inner
                    .conversations
                    .get_mut(&conversation_id)
                    .ok_or_else(|| {
                        ConversationNotFoundSnafu {
                            stage: "memory-delete-message",
                            conversation_id,
                        }
                        .build()
                    })?;

                let before = slot.messages.len();
                slot.messages.retain(|message| message.id != message_id);
                if slot.messages.len() == before {
                    return MessageNotFoundSnafu {
                        stage: "memory-delete-message",
                        conversation_id,
                        message_id,
                    }
                    .fail();
                }
            }

            self.broadcast(conversation_id);
            Ok(())
        })
    }
}

impl IdentityBackend for MemoryBackend {
    fn lookup_profile(&self, account_id: AccountId) -> BoxFuture<'_, StoreResult<Profile>> {
        Box::pin(async move {
            self.lock()
                .profiles
                .get(&account_id)
                .cloned()
                .ok_or_else(|| {
                    RejectedSnafu {
                        stage: "memory-lookup-profile",
                        status: 404_u16,
                        details: format!("no profile for account '{account_id}'"),
                    }
                    .build()
                })
        })
    }
}
