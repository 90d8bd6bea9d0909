//! The dialog controller: a worker task that owns the conversation state and
//! a cloneable handle the UI talks through.
//!
//! All state transitions happen on the worker task. History loads and
//! mutations run as spawned tasks that report back over an internal channel,
//! stamped with the selection epoch at spawn time; completions from a
//! superseded selection are discarded on arrival. The live feed is a select!
//! arm of the same loop, so feed merges can never race a page application.

use std::sync::Arc;

use parley_store::{
    ConversationId, FeedEvent, FeedSubscription, MessageBackend, MessageId, MessagePatch,
    MessageRecord, NewMessage, PageRequest, RequestId, StoreError,
};
use snafu::IntoError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DialogConfig;
use crate::error::{
    DialogError, DialogResult, MutationFailedSnafu, NoConversationSelectedSnafu, WorkerGoneSnafu,
};
use crate::history::{HistoryLoader, InitialLoad};
use crate::identity::IdentityDirectory;
use crate::state::{DialogState, LoadPhase};

enum DialogCommand {
    Select {
        request_id: RequestId,
        conversation_id: Option<ConversationId>,
    },
    LoadOlder,
    RetryInitial,
    Send {
        draft: NewMessage,
        reply: oneshot::Sender<DialogResult<MessageRecord>>,
    },
    Edit {
        message_id: MessageId,
        patch: MessagePatch,
        reply: oneshot::Sender<DialogResult<MessageRecord>>,
    },
    Delete {
        message_id: MessageId,
        reply: oneshot::Sender<DialogResult<()>>,
    },
    Close,
}

/// Result of a spawned load or mutation, stamped with the selection epoch
/// that was current when the work started.
enum Completion {
    Initial {
        epoch: u64,
        result: DialogResult<InitialLoad>,
    },
    Older {
        epoch: u64,
        result: DialogResult<parley_store::MessagePage>,
    },
    Edited {
        epoch: u64,
        record: MessageRecord,
    },
    Deleted {
        epoch: u64,
        message_id: MessageId,
    },
    MutationFailed {
        epoch: u64,
        action: &'static str,
        details: String,
    },
}

/// Cloneable front for the dialog worker.
#[derive(Clone)]
pub struct DialogHandle {
    commands: mpsc::UnboundedSender<DialogCommand>,
    snapshot: watch::Receiver<DialogState>,
}

impl DialogHandle {
    /// Spawns the worker on the current runtime.
    pub fn spawn(
        backend: Arc<dyn MessageBackend>,
        identity: Option<Arc<IdentityDirectory>>,
        config: &DialogConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(DialogState::default());

        let worker = DialogWorker {
            backend,
            identity,
            loader: HistoryLoader::new(config),
            state: DialogState::default(),
            epoch: 0,
            feed: None,
            commands: command_rx,
            completions: completion_rx,
            completion_tx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(worker.run());

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Switches the dialog to a conversation, or to discovery mode for the
    /// request when no conversation is named yet.
    pub fn select(
        &self,
        request_id: RequestId,
        conversation_id: Option<ConversationId>,
    ) -> DialogResult<()> {
        self.send_command(DialogCommand::Select {
            request_id,
            conversation_id,
        })
    }

    /// Requests the next page of older history. Ignored while another page
    /// is already in flight or when history is exhausted.
    pub fn load_older(&self) -> DialogResult<()> {
        self.send_command(DialogCommand::LoadOlder)
    }

    /// Restarts the initial load after a terminal failure.
    pub fn retry_initial(&self) -> DialogResult<()> {
        self.send_command(DialogCommand::RetryInitial)
    }

    pub async fn send_message(&self, draft: NewMessage) -> DialogResult<MessageRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(DialogCommand::Send {
            draft,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| DialogError::WorkerGone {
            stage: "send-message-reply",
        })?
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> DialogResult<MessageRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(DialogCommand::Edit {
            message_id,
            patch,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| DialogError::WorkerGone {
            stage: "edit-message-reply",
        })?
    }

    pub async fn delete_message(&self, message_id: MessageId) -> DialogResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(DialogCommand::Delete {
            message_id,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| DialogError::WorkerGone {
            stage: "delete-message-reply",
        })?
    }

    pub fn close(&self) {
        let _ = self.commands.send(DialogCommand::Close);
    }

    /// Current published state.
    pub fn snapshot(&self) -> DialogState {
        self.snapshot.borrow().clone()
    }

    /// Watch side of the published state, for callers that want to await
    /// changes.
    pub fn watch(&self) -> watch::Receiver<DialogState> {
        self.snapshot.clone()
    }

    fn send_command(&self, command: DialogCommand) -> DialogResult<()> {
        self.commands
            .send(command)
            .map_err(|_| WorkerGoneSnafu { stage: "command" }.build())
    }
}

struct DialogWorker {
    backend: Arc<dyn MessageBackend>,
    identity: Option<Arc<IdentityDirectory>>,
    loader: HistoryLoader,
    state: DialogState,
    /// Bumped on every (re)selection; completions carrying an older value
    /// are from a superseded conversation and get dropped.
    epoch: u64,
    feed: Option<FeedSubscription>,
    commands: mpsc::UnboundedReceiver<DialogCommand>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    snapshot: watch::Sender<DialogState>,
}

impl DialogWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                completion = self.completions.recv() => {
                    if let Some(completion) = completion {
                        self.handle_completion(completion);
                    }
                }
                event = Self::next_feed_event(&mut self.feed) => {
                    self.handle_feed_event(event);
                }
            }
            self.publish();
        }
        tracing::debug!("dialog worker shutting down");
    }

    async fn next_feed_event(feed: &mut Option<FeedSubscription>) -> Option<FeedEvent> {
        match feed.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Returns true when the worker should stop.
    fn handle_command(&mut self, command: DialogCommand) -> bool {
        match command {
            DialogCommand::Select {
                request_id,
                conversation_id,
            } => {
                let already_there = self.state.request_id == Some(request_id)
                    && self.state.conversation_id == conversation_id
                    && conversation_id.is_some()
                    && !matches!(self.state.phase, LoadPhase::Failed);
                if already_there {
                    // Reselecting the open conversation must not reload or
                    // resubscribe.
                    tracing::debug!(%request_id, "reselect of the open conversation ignored");
                    return false;
                }
                self.start_selection(request_id, conversation_id);
            }
            DialogCommand::LoadOlder => self.start_loading_older(),
            DialogCommand::RetryInitial => {
                if !matches!(self.state.phase, LoadPhase::Failed) {
                    tracing::debug!("retry requested but the dialog is not in a failed state");
                    return false;
                }
                match (self.state.request_id, self.state.conversation_id) {
                    (Some(request_id), conversation_id) => {
                        self.start_selection(request_id, conversation_id);
                    }
                    (None, _) => {
                        tracing::warn!("retry requested with nothing selected");
                    }
                }
            }
            DialogCommand::Send { draft, reply } => self.start_send(draft, reply),
            DialogCommand::Edit {
                message_id,
                patch,
                reply,
            } => self.start_edit(message_id, patch, reply),
            DialogCommand::Delete { message_id, reply } => self.start_delete(message_id, reply),
            DialogCommand::Close => return true,
        }
        false
    }

    /// Teardown order matters: the old feed is cancelled on the store side
    /// before the state resets, and the new feed attaches only after the
    /// initial page lands.
    fn start_selection(
        &mut self,
        request_id: RequestId,
        conversation_id: Option<ConversationId>,
    ) {
        self.epoch += 1;
        if let Some(mut feed) = self.feed.take() {
            feed.cancel();
        }
        self.state.reset_for_selection(request_id, conversation_id);
        tracing::info!(%request_id, ?conversation_id, epoch = self.epoch, "switching conversation");

        let request = match conversation_id {
            Some(conversation_id) => PageRequest::initial(request_id, conversation_id),
            None => PageRequest::discovery(request_id),
        };

        let backend = Arc::clone(&self.backend);
        let loader = self.loader.clone();
        let completion_tx = self.completion_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = loader.load_initial(backend.as_ref(), request).await;
            let _ = completion_tx.send(Completion::Initial { epoch, result });
        });
    }

    fn start_loading_older(&mut self) {
        if !matches!(self.state.phase, LoadPhase::Ready) {
            // Covers coalescing: a second request while one is in flight is
            // dropped here because the phase is LoadingOlder.
            tracing::debug!(phase = ?self.state.phase, "older-page request ignored");
            return;
        }
        if !self.state.has_more {
            tracing::debug!("older-page request ignored, history exhausted");
            return;
        }
        let (Some(request_id), Some(conversation_id), Some(anchor)) = (
            self.state.request_id,
            self.state.conversation_id,
            self.state.oldest_loaded(),
        ) else {
            return;
        };

        self.state.begin_loading_older();
        let request = PageRequest::older(request_id, conversation_id, anchor);
        let backend = Arc::clone(&self.backend);
        let loader = self.loader.clone();
        let completion_tx = self.completion_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = loader.load_older(backend.as_ref(), request).await;
            let _ = completion_tx.send(Completion::Older { epoch, result });
        });
    }

    fn start_send(&mut self, draft: NewMessage, reply: oneshot::Sender<DialogResult<MessageRecord>>) {
        let Some(conversation_id) = self.state.conversation_id else {
            let _ = reply.send(
                NoConversationSelectedSnafu {
                    stage: "send-message",
                }
                .fail(),
            );
            return;
        };

        self.state.mutation_error = None;
        let backend = Arc::clone(&self.backend);
        let completion_tx = self.completion_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            // The record is not inserted locally; the live feed delivers it,
            // and the merge dedupes if the reply races the feed.
            let result = backend
                .send_message(conversation_id, draft)
                .await
                .map_err(|source| {
                    MutationFailedSnafu {
                        action: "sending a message",
                    }
                    .into_error(source)
                });
            if let Err(error) = &result {
                let _ = completion_tx.send(Completion::MutationFailed {
                    epoch,
                    action: "send",
                    details: error.to_string(),
                });
            }
            let _ = reply.send(result);
        });
    }

    fn start_edit(
        &mut self,
        message_id: MessageId,
        patch: MessagePatch,
        reply: oneshot::Sender<DialogResult<MessageRecord>>,
    ) {
        let Some(conversation_id) = self.state.conversation_id else {
            let _ = reply.send(
                NoConversationSelectedSnafu {
                    stage: "edit-message",
                }
                .fail(),
            );
            return;
        };

        self.state.mutation_error = None;
        let backend = Arc::clone(&self.backend);
        let completion_tx = self.completion_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = backend
                .edit_message(conversation_id, message_id, patch)
                .await
                .map_err(|source| {
                    MutationFailedSnafu {
                        action: "editing a message",
                    }
                    .into_error(source)
                });
            match &result {
                Ok(record) => {
                    let _ = completion_tx.send(Completion::Edited {
                        epoch,
                        record: record.clone(),
                    });
                }
                Err(error) => {
                    let _ = completion_tx.send(Completion::MutationFailed {
                        epoch,
                        action: "edit",
                        details: error.to_string(),
                    });
                }
            }
            let _ = reply.send(result);
        });
    }

    fn start_delete(
        &mut self,
        message_id: MessageId,
        reply: oneshot::Sender<DialogResult<()>>,
    ) {
        let Some(conversation_id) = self.state.conversation_id else {
            let _ = reply.send(
                NoConversationSelectedSnafu {
                    stage: "delete-message",
                }
                .fail(),
            );
            return;
        };

        self.state.mutation_error = None;
        let backend = Arc::clone(&self.backend);
        let completion_tx = self.completion_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = backend
                .delete_message(conversation_id, message_id)
                .await
                .map_err(|source| {
                    MutationFailedSnafu {
                        action: "deleting a message",
                    }
                    .into_error(source)
                });
            match &result {
                Ok(()) => {
                    let _ = completion_tx.send(Completion::Deleted { epoch, message_id });
                }
                Err(error) => {
                    let _ = completion_tx.send(Completion::MutationFailed {
                        epoch,
                        action: "delete",
                        details: error.to_string(),
                    });
                }
            }
            let _ = reply.send(result);
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Initial { epoch, result } => {
                if epoch != self.epoch {
                    tracing::debug!(epoch, current = self.epoch, "stale initial load dropped");
                    return;
                }
                match result {
                    Ok(load) => self.finish_initial_load(load),
                    Err(error) => {
                        tracing::error!(error = %error, "initial history load failed");
                        self.state.initial_load_failed(error.to_string());
                    }
                }
            }
            Completion::Older { epoch, result } => {
                if epoch != self.epoch {
                    tracing::debug!(epoch, current = self.epoch, "stale older page dropped");
                    return;
                }
                match result {
                    Ok(page) => self.state.apply_older_page(page),
                    Err(error) => {
                        tracing::warn!(error = %error, "older page load failed");
                        self.state.older_load_failed(error.to_string());
                    }
                }
            }
            Completion::Edited { epoch, record } => {
                if epoch == self.epoch {
                    self.state.apply_edited(record);
                }
            }
            Completion::Deleted { epoch, message_id } => {
                if epoch == self.epoch {
                    self.state.apply_deleted(message_id);
                }
            }
            Completion::MutationFailed {
                epoch,
                action,
                details,
            } => {
                if epoch == self.epoch {
                    tracing::warn!(action, details = %details, "mutation failed");
                    self.state.mutation_failed(details);
                }
            }
        }
    }

    fn finish_initial_load(&mut self, load: InitialLoad) {
        if load.attempts > 1 {
            tracing::info!(attempts = load.attempts, "initial history load recovered");
        }
        let siblings = load.page.siblings.clone();
        self.state.apply_initial_page(load.page);
        self.prefetch_identities();

        let Some(conversation_id) = self.state.conversation_id else {
            // Discovery mode: no conversation was named. Fall through to the
            // first sibling, which re-runs the whole selection for it.
            if let (Some(request_id), Some(first)) = (self.state.request_id, siblings.first()) {
                let conversation_id = first.id;
                tracing::info!(%conversation_id, "auto-selecting first conversation of request");
                self.start_selection(request_id, Some(conversation_id));
            }
            return;
        };

        match self.backend.open_feed(conversation_id) {
            Ok(subscription) => self.feed = Some(subscription),
            Err(error) => {
                tracing::warn!(error = %error, "live feed unavailable, history only");
                self.state.feed_lost(error.to_string());
            }
        }
    }

    fn handle_feed_event(&mut self, event: Option<FeedEvent>) {
        match event {
            Some(FeedEvent::Batch(batch)) => {
                let appended = self.state.merge_feed_batch(batch);
                if appended > 0 {
                    tracing::debug!(appended, "live feed delivered new messages");
                }
            }
            Some(FeedEvent::Lost { details }) => {
                tracing::warn!(details = %details, "live feed lost");
                self.state.feed_lost(details);
                self.feed = None;
            }
            None => {
                let details = match self.feed.as_ref().map(FeedSubscription::conversation_id) {
                    Some(conversation_id) => StoreError::FeedClosed {
                        stage: "feed-recv",
                        conversation_id,
                    }
                    .to_string(),
                    None => "live feed closed by the store".to_string(),
                };
                tracing::warn!(details = %details, "live feed closed by the store");
                self.state.feed_lost(details);
                self.feed = None;
            }
        }
    }

    fn prefetch_identities(&self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        let mut accounts = Vec::new();
        for sibling in &self.state.siblings {
            accounts.push(sibling.student_id);
            accounts.push(sibling.tutor_id);
            if let Some(operator_id) = sibling.operator_id {
                accounts.push(operator_id);
            }
        }
        if accounts.is_empty() {
            return;
        }
        tokio::spawn(async move {
            identity.prefetch(accounts).await;
        });
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.state.clone());
    }
}
