use snafu::Snafu;

use super::ids::{ConversationId, MessageId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("transport failure while talking to the message store: {details}"))]
    Transport {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("message store rejected the request with status {status}: {details}"))]
    Rejected {
        stage: &'static str,
        status: u16,
        details: String,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("message '{message_id}' was not found in conversation '{conversation_id}'"))]
    MessageNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[snafu(display("message body must not be empty"))]
    EmptyBody { stage: &'static str },
    #[snafu(display("wire document is missing required field '{field}'"))]
    MissingField {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("wire field '{field}' holds an unusable timestamp: {raw}"))]
    InvalidTimestamp {
        stage: &'static str,
        field: &'static str,
        raw: String,
    },
    #[snafu(display("unknown message type token '{raw}'"))]
    UnknownMessageKind { stage: &'static str, raw: String },
    #[snafu(display("unknown sender role token '{raw}'"))]
    UnknownSenderRole { stage: &'static str, raw: String },
    #[snafu(display("live feed for conversation '{conversation_id}' is closed"))]
    FeedClosed {
        stage: &'static str,
        conversation_id: ConversationId,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
