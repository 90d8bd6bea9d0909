//! Message-store access layer for the conversation dialog.
//!
//! Defines the typed records, the backend seams the dialog controller talks
//! through, and an in-memory backend used by tests and the QA runner.

pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod types;
pub mod wire;

pub use error::{StoreError, StoreResult};
pub use feed::{FeedEvent, FeedSubscription, make_feed_channel};
pub use ids::{AccountId, ConversationId, MessageId, RequestId};
pub use memory::MemoryBackend;
pub use types::{
    ConversationRecord, LastMessageSummary, MessageKind, MessagePage, MessagePatch, MessageRecord,
    NewMessage, NoticeKind, PageRequest, Profile, SenderRole, UNKNOWN_PROFILE_LABEL, chronological,
};

pub use futures::future::BoxFuture;

/// Everything the dialog needs from the message store. One history endpoint
/// covers discovery, initial load, and backwards pagination; the feed is a
/// separate push channel per conversation.
pub trait MessageBackend: Send + Sync {
    fn fetch_page(&self, request: PageRequest) -> BoxFuture<'_, StoreResult<MessagePage>>;
    fn open_feed(&self, conversation_id: ConversationId) -> StoreResult<FeedSubscription>;
    fn send_message(
        &self,
        conversation_id: ConversationId,
        draft: NewMessage,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>>;
    fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>>;
    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>>;
}

/// Best-effort participant identity resolution. Failures degrade to
/// placeholder profiles, never to dialog errors.
pub trait IdentityBackend: Send + Sync {
    fn lookup_profile(&self, account_id: AccountId) -> BoxFuture<'_, StoreResult<Profile>>;
}
