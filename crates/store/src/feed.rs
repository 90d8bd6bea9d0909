use tokio::sync::{mpsc, oneshot};

use super::ids::ConversationId;
use super::types::MessageRecord;

/// One delivery from the live feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// The store's current view of the most recent messages in the
    /// conversation, ordered ascending by `created_at`. Batches overlap with
    /// earlier deliveries; consumers must dedupe by id.
    Batch(Vec<MessageRecord>),
    /// The push layer failed. Non-fatal for the dialog; no more events will
    /// arrive on this subscription.
    Lost { details: String },
}

/// Live push subscription over the most recent window of one conversation.
/// Dropping the subscription cancels it on the store side.
pub struct FeedSubscription {
    conversation_id: ConversationId,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl FeedSubscription {
    pub(crate) fn new(
        conversation_id: ConversationId,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            conversation_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Next feed event; `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Tells the store to stop delivering. Idempotent; dropping the
    /// subscription has the same effect.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Builds the channel trio backing a subscription. The store keeps the sender
/// and the cancel receiver; the dialog keeps the `FeedSubscription`.
pub fn make_feed_channel(
    conversation_id: ConversationId,
) -> (
    mpsc::UnboundedSender<FeedEvent>,
    FeedSubscription,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        FeedSubscription::new(conversation_id, event_rx, cancel_tx),
        cancel_rx,
    )
}
