//! End-to-end controller behavior against a scripted backend: selection
//! races, the retry budget, feed subscription lifecycle, and pagination
//! coalescing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, sleep, timeout};

use parley_dialog::{DialogConfig, DialogHandle, DialogState, LoadPhase};
use parley_store::{
    AccountId, BoxFuture, ConversationId, ConversationRecord, FeedEvent, FeedSubscription,
    MemoryBackend, MessageBackend, MessageId, MessageKind, MessagePage, MessagePatch,
    MessageRecord, NewMessage, PageRequest, RequestId, SenderRole, StoreError, StoreResult,
    make_feed_channel,
};

fn record(conversation_id: ConversationId, minute: i64, label: &str) -> MessageRecord {
    let at = Utc::now() + chrono::Duration::minutes(minute);
    MessageRecord {
        id: MessageId::generate(),
        conversation_id,
        body: label.to_string(),
        kind: MessageKind::Text,
        sender_role: SenderRole::Student,
        sender_id: AccountId::generate(),
        created_at: at,
        updated_at: at,
        edited: false,
        seen: false,
    }
}

async fn wait_until(
    handle: &DialogHandle,
    predicate: impl Fn(&DialogState) -> bool,
) -> DialogState {
    let mut watch = handle.watch();
    timeout(Duration::from_secs(30), async {
        loop {
            if predicate(&watch.borrow()) {
                return watch.borrow().clone();
            }
            if watch.changed().await.is_err() {
                panic!("dialog worker went away while waiting");
            }
        }
    })
    .await
    .expect("timed out waiting for dialog state")
}

/// Backend with scripted pages and feeds plus call accounting. History pages
/// can be gated so a fetch stays in flight until the test releases it.
struct ScriptedBackend {
    conversations: Mutex<HashMap<RequestId, Vec<ConversationRecord>>>,
    pages: Mutex<HashMap<ConversationId, Vec<MessageRecord>>>,
    page_size: usize,
    fetch_calls: AtomicU32,
    feed_opens: AtomicU32,
    fetch_failures_left: AtomicU32,
    gates: Mutex<HashMap<ConversationId, Arc<Semaphore>>>,
    feeds: Mutex<HashMap<ConversationId, mpsc::UnboundedSender<FeedEvent>>>,
}

impl ScriptedBackend {
    fn new(page_size: usize) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            page_size,
            fetch_calls: AtomicU32::new(0),
            feed_opens: AtomicU32::new(0),
            fetch_failures_left: AtomicU32::new(0),
            gates: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    fn add_conversation(&self, request_id: RequestId, messages: Vec<MessageRecord>) -> ConversationId {
        let conversation_id = messages
            .first()
            .map(|message| message.conversation_id)
            .unwrap_or_else(ConversationId::generate);
        let record = ConversationRecord {
            id: conversation_id,
            request_id,
            student_id: AccountId::generate(),
            tutor_id: AccountId::generate(),
            operator_id: None,
            last_message: None,
            unread_student: 0,
            unread_tutor: 0,
        };
        self.conversations
            .lock()
            .unwrap()
            .entry(request_id)
            .or_default()
            .push(record);
        self.pages.lock().unwrap().insert(conversation_id, messages);
        conversation_id
    }

    /// Future fetches for this conversation block until `release` is called.
    fn gate(&self, conversation_id: ConversationId) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(conversation_id, gate.clone());
        gate
    }

    fn fail_next_fetches(&self, count: u32) {
        self.fetch_failures_left.store(count, Ordering::SeqCst);
    }

    fn push_feed(&self, conversation_id: ConversationId, event: FeedEvent) {
        if let Some(sender) = self.feeds.lock().unwrap().get(&conversation_id) {
            let _ = sender.send(event);
        }
    }

    /// Drops the store side of the feed channel, as a teardown without a
    /// final `Lost` event would.
    fn close_feed(&self, conversation_id: ConversationId) {
        self.feeds.lock().unwrap().remove(&conversation_id);
    }
}

impl MessageBackend for ScriptedBackend {
    fn fetch_page(&self, request: PageRequest) -> BoxFuture<'_, StoreResult<MessagePage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(conversation_id) = request.conversation_id {
                let gate = self.gates.lock().unwrap().get(&conversation_id).cloned();
                if let Some(gate) = gate {
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|_| StoreError::Transport {
                            stage: "scripted-gate",
                            details: "gate closed".to_string(),
                        })?;
                }
            }

            let failing = self
                .fetch_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Transport {
                    stage: "scripted-fetch",
                    details: "injected failure".to_string(),
                });
            }

            let siblings = if request.before.is_none() {
                self.conversations
                    .lock()
                    .unwrap()
                    .get(&request.request_id)
                    .cloned()
                    .unwrap_or_default()
            } else {
                Vec::new()
            };

            let Some(conversation_id) = request.conversation_id else {
                return Ok(MessagePage {
                    messages: Vec::new(),
                    has_more: false,
                    siblings,
                });
            };

            let all = self
                .pages
                .lock()
                .unwrap()
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            let upper = request
                .before
                .and_then(|anchor| all.iter().position(|message| message.id == anchor))
                .unwrap_or(all.len());
            let start = upper.saturating_sub(self.page_size);
            let messages = all[start..upper].to_vec();
            let has_more = messages.len() == self.page_size;
            Ok(MessagePage {
                messages,
                has_more,
                siblings,
            })
        })
    }

    fn open_feed(&self, conversation_id: ConversationId) -> StoreResult<FeedSubscription> {
        self.feed_opens.fetch_add(1, Ordering::SeqCst);
        let (event_tx, subscription, _cancel_rx) = make_feed_channel(conversation_id);
        self.feeds
            .lock()
            .unwrap()
            .insert(conversation_id, event_tx);
        Ok(subscription)
    }

    fn send_message(
        &self,
        conversation_id: ConversationId,
        draft: NewMessage,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        Box::pin(async move {
            let sent = MessageRecord {
                id: MessageId::generate(),
                conversation_id,
                body: draft.body,
                kind: draft.kind,
                sender_role: SenderRole::Operator,
                sender_id: AccountId::generate(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                edited: false,
                seen: false,
            };
            self.pages
                .lock()
                .unwrap()
                .entry(conversation_id)
                .or_default()
                .push(sent.clone());
            Ok(sent)
        })
    }

    fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        Box::pin(async move {
            let mut pages = self.pages.lock().unwrap();
            let messages = pages.entry(conversation_id).or_default();
            let message = messages
                .iter_mut()
                .find(|message| message.id == message_id)
                .ok_or(StoreError::MessageNotFound {
                    stage: "scripted-edit",
                    conversation_id,
                    message_id,
                })?;
            if let Some(body) = patch.body {
                message.body = body;
            }
            message.edited = true;
            Ok(message.clone())
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.pages
                .lock()
                .unwrap()
                .entry(conversation_id)
                .or_default()
                .retain(|message| message.id != message_id);
            Ok(())
        })
    }
}

fn scripted_messages(conversation_id: ConversationId, count: usize) -> Vec<MessageRecord> {
    (0..count)
        .map(|index| record(conversation_id, index as i64, &format!("m{index}")))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn late_page_from_a_previous_selection_is_dropped() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let slow_conversation = ConversationId::generate();
    let slow_id = backend.add_conversation(request_id, scripted_messages(slow_conversation, 5));
    let fast_id = backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 3));

    let gate = backend.gate(slow_id);
    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());

    handle.select(request_id, Some(slow_id)).unwrap();
    wait_until(&handle, |state| {
        matches!(state.phase, LoadPhase::LoadingInitial { .. })
    })
    .await;

    // Switch away while the first fetch is stuck behind the gate.
    handle.select(request_id, Some(fast_id)).unwrap();
    let state = wait_until(&handle, |state| {
        state.conversation_id == Some(fast_id) && state.phase == LoadPhase::Ready
    })
    .await;
    assert_eq!(state.messages.len(), 3);

    // Let the stale fetch complete; it must not disturb the new selection.
    gate.add_permits(1);
    sleep(Duration::from_millis(200)).await;

    let state = handle.snapshot();
    assert_eq!(state.conversation_id, Some(fast_id));
    assert_eq!(state.messages.len(), 3);
    assert!(
        state
            .messages
            .iter()
            .all(|message| message.conversation_id == fast_id)
    );
}

#[tokio::test(start_paused = true)]
async fn initial_load_recovers_on_the_final_attempt() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 4));
    backend.fail_next_fetches(2);

    let started = Instant::now();
    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();

    let state = wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;
    assert_eq!(state.messages.len(), 4);
    assert!(state.last_error.is_none());
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 3);
    // Linear backoff: 1s after the first failure, 2s after the second.
    assert!(started.elapsed() >= Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn initial_load_stops_after_the_attempt_budget() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 4));
    backend.fail_next_fetches(u32::MAX);

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();

    let state = wait_until(&handle, |state| state.phase == LoadPhase::Failed).await;
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 3);
    assert!(state.last_error.is_some());
    assert!(state.messages.is_empty());
    // No feed without history.
    assert_eq!(backend.feed_opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn manual_retry_restarts_the_budget_after_failure() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 2));
    backend.fail_next_fetches(3);

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Failed).await;

    handle.retry_initial().unwrap();
    let state = wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;
    assert_eq!(state.messages.len(), 2);
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn reselecting_the_open_conversation_does_not_reload_or_resubscribe() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 3));

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;

    handle.select(request_id, Some(conversation_id)).unwrap();
    handle.select(request_id, Some(conversation_id)).unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.feed_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn discovery_auto_selects_the_first_conversation() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let first_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 2));
    backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 7));

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, None).unwrap();

    let state = wait_until(&handle, |state| {
        state.conversation_id == Some(first_id) && state.phase == LoadPhase::Ready
    })
    .await;
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.siblings.len(), 2);
    assert_eq!(backend.feed_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_older_page_requests_coalesce() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 30));

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 1);

    handle.load_older().unwrap();
    handle.load_older().unwrap();
    handle.load_older().unwrap();

    let state = wait_until(&handle, |state| state.messages.len() == 20).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.fetch_calls.load(Ordering::SeqCst), 2);
    assert!(state.has_more);
}

#[tokio::test(start_paused = true)]
async fn feed_loss_keeps_history_and_raises_a_notice() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 6));

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;

    backend.push_feed(
        conversation_id,
        FeedEvent::Lost {
            details: "listener disconnected".to_string(),
        },
    );

    let state = wait_until(&handle, |state| state.feed_notice.is_some()).await;
    assert_eq!(state.messages.len(), 6);
    assert_eq!(state.phase, LoadPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn closed_feed_raises_a_typed_notice_and_keeps_history() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let conversation_id =
        backend.add_conversation(request_id, scripted_messages(ConversationId::generate(), 6));

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;

    backend.close_feed(conversation_id);

    let state = wait_until(&handle, |state| state.feed_notice.is_some()).await;
    let expected = StoreError::FeedClosed {
        stage: "feed-recv",
        conversation_id,
    }
    .to_string();
    assert_eq!(state.feed_notice.as_deref(), Some(expected.as_str()));
    assert_eq!(state.messages.len(), 6);
    assert_eq!(state.phase, LoadPhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn scripted_feed_batches_merge_through_the_worker() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let request_id = RequestId::generate();
    let seeded = scripted_messages(ConversationId::generate(), 4);
    let conversation_id = backend.add_conversation(request_id, seeded.clone());

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(conversation_id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;

    // Overlapping batch: the last two known messages plus one new one.
    let fresh = record(conversation_id, 10, "fresh");
    let mut batch = seeded[2..].to_vec();
    batch.push(fresh.clone());
    backend.push_feed(conversation_id, FeedEvent::Batch(batch));

    let state = wait_until(&handle, |state| state.messages.len() == 5).await;
    assert_eq!(state.messages.last().unwrap().id, fresh.id);

    // An identical batch afterwards must change nothing.
    let mut batch = seeded[2..].to_vec();
    batch.push(fresh);
    backend.push_feed(conversation_id, FeedEvent::Batch(batch));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.snapshot().messages.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn switching_detaches_the_previous_feed() {
    let backend = Arc::new(MemoryBackend::new());
    let request_id = RequestId::generate();
    let student = AccountId::generate();
    let first = backend.create_conversation(request_id, student, AccountId::generate());
    let second = backend.create_conversation(request_id, student, AccountId::generate());

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle.select(request_id, Some(first.id)).unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;
    assert_eq!(backend.watcher_count(first.id), 1);

    handle.select(request_id, Some(second.id)).unwrap();
    wait_until(&handle, |state| {
        state.conversation_id == Some(second.id) && state.phase == LoadPhase::Ready
    })
    .await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.watcher_count(first.id), 0);
    assert_eq!(backend.watcher_count(second.id), 1);
}

#[tokio::test(start_paused = true)]
async fn mutations_flow_through_reply_and_state() {
    let backend = Arc::new(MemoryBackend::new());
    let conversation = backend.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );

    let handle = DialogHandle::spawn(backend.clone(), None, &DialogConfig::default());
    handle
        .select(conversation.request_id, Some(conversation.id))
        .unwrap();
    wait_until(&handle, |state| state.phase == LoadPhase::Ready).await;

    let sent = handle.send_message(NewMessage::text("hello")).await.unwrap();
    wait_until(&handle, |state| {
        state.messages.iter().any(|message| message.id == sent.id)
    })
    .await;

    let edited = handle
        .edit_message(
            sent.id,
            MessagePatch {
                body: Some("hello again".to_string()),
            },
        )
        .await
        .unwrap();
    assert!(edited.edited);
    wait_until(&handle, |state| {
        state
            .messages
            .iter()
            .any(|message| message.id == sent.id && message.body == "hello again")
    })
    .await;

    handle.delete_message(sent.id).await.unwrap();
    wait_until(&handle, |state| {
        state.messages.iter().all(|message| message.id != sent.id)
    })
    .await;
}

#[tokio::test]
async fn mutations_without_a_selection_are_rejected() {
    let backend = Arc::new(ScriptedBackend::new(10));
    let handle = DialogHandle::spawn(backend, None, &DialogConfig::default());

    let error = handle
        .send_message(NewMessage::text("into the void"))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        parley_dialog::DialogError::NoConversationSelected { .. }
    ));
}
