use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::ids::{AccountId, ConversationId, MessageId, RequestId};

/// Placeholder shown while a participant profile is unknown or unavailable.
pub const UNKNOWN_PROFILE_LABEL: &str = "N/A";

/// Which side of the marketplace sent a message. The operator is the admin
/// console user (or a support agent once one joins a room).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderRole {
    Student,
    Tutor,
    Operator,
}

impl SenderRole {
    pub fn wire_token(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Tutor => "tutor",
            Self::Operator => "admin",
        }
    }

    pub fn from_wire_token(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Self::Student),
            "tutor" => Some(Self::Tutor),
            "admin" => Some(Self::Operator),
            _ => None,
        }
    }
}

/// Request-lifecycle markers that render as system notices instead of chat
/// bubbles. The token set is closed; anything else is a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    RequestCreated,
    BidInvite,
    BidInviteRejected,
    TutorBid,
    TutorEditBid,
    StudentReject,
    RequestTaken,
    StudentChangeMind,
    StudentAccept,
    StudentPaid,
    StudentOngoing,
    TutorComplete,
    StudentAcceptComplete,
    StudentRejectComplete,
    StudentCancelRequest,
    TutorDeclineAccepted,
    ZoomCreated,
    ZoomReady,
}

impl NoticeKind {
    pub fn wire_token(&self) -> &'static str {
        match self {
            Self::RequestCreated => "requestcreated",
            Self::BidInvite => "bidinvite",
            Self::BidInviteRejected => "bidinviterejected",
            Self::TutorBid => "tutorbid",
            Self::TutorEditBid => "tutoreditbid",
            Self::StudentReject => "studentreject",
            Self::RequestTaken => "requesttaken",
            Self::StudentChangeMind => "studentchangemind",
            Self::StudentAccept => "studentaccept",
            Self::StudentPaid => "studentpaid",
            Self::StudentOngoing => "studentongoing",
            Self::TutorComplete => "tutorcomplete",
            Self::StudentAcceptComplete => "studentacceptcomplete",
            Self::StudentRejectComplete => "studentrejectcomplete",
            Self::StudentCancelRequest => "studentcancelrequest",
            Self::TutorDeclineAccepted => "tutordeclineaccepted",
            Self::ZoomCreated => "zoomcreated",
            Self::ZoomReady => "zoomready",
        }
    }

    fn from_wire_token(raw: &str) -> Option<Self> {
        match raw {
            "requestcreated" => Some(Self::RequestCreated),
            "bidinvite" => Some(Self::BidInvite),
            "bidinviterejected" => Some(Self::BidInviteRejected),
            "tutorbid" => Some(Self::TutorBid),
            "tutoreditbid" => Some(Self::TutorEditBid),
            "studentreject" => Some(Self::StudentReject),
            "requesttaken" => Some(Self::RequestTaken),
            "studentchangemind" => Some(Self::StudentChangeMind),
            "studentaccept" => Some(Self::StudentAccept),
            "studentpaid" => Some(Self::StudentPaid),
            "studentongoing" => Some(Self::StudentOngoing),
            "tutorcomplete" => Some(Self::TutorComplete),
            "studentacceptcomplete" => Some(Self::StudentAcceptComplete),
            "studentrejectcomplete" => Some(Self::StudentRejectComplete),
            "studentcancelrequest" => Some(Self::StudentCancelRequest),
            "tutordeclineaccepted" => Some(Self::TutorDeclineAccepted),
            "zoomcreated" => Some(Self::ZoomCreated),
            "zoomready" => Some(Self::ZoomReady),
            _ => None,
        }
    }
}

/// Message payload kind. For media kinds the record body carries a storage
/// path or URL rather than display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Voice,
    Image,
    File,
    Notice(NoticeKind),
}

impl MessageKind {
    pub fn wire_token(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::File => "file",
            Self::Notice(notice) => notice.wire_token(),
        }
    }

    pub fn from_wire_token(raw: &str) -> Option<Self> {
        let token = raw.trim().to_ascii_lowercase();
        match token.as_str() {
            "text" => Some(Self::Text),
            "voice" => Some(Self::Voice),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            other => NoticeKind::from_wire_token(other).map(Self::Notice),
        }
    }

    /// True when the body is an opaque media reference.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Voice | Self::Image | Self::File)
    }

    /// True when the message renders as a system notice, not a bubble.
    pub fn is_notice(&self) -> bool {
        matches!(self, Self::Notice(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub body: String,
    pub kind: MessageKind,
    pub sender_role: SenderRole,
    pub sender_id: AccountId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub edited: bool,
    pub seen: bool,
}

/// Denormalized preview for conversation lists. Never used for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessageSummary {
    pub body: String,
    pub kind: MessageKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub request_id: RequestId,
    pub student_id: AccountId,
    pub tutor_id: AccountId,
    /// Set once a support agent joins the room; absent for request chats.
    pub operator_id: Option<AccountId>,
    pub last_message: Option<LastMessageSummary>,
    pub unread_student: u32,
    pub unread_tutor: u32,
}

/// History fetch parameters. With `conversation_id` unset the store returns
/// only the sibling conversation list for the parent request (discovery).
/// With `before` set it returns the page strictly older than that message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub request_id: RequestId,
    pub conversation_id: Option<ConversationId>,
    pub before: Option<MessageId>,
}

impl PageRequest {
    pub fn discovery(request_id: RequestId) -> Self {
        Self {
            request_id,
            conversation_id: None,
            before: None,
        }
    }

    pub fn initial(request_id: RequestId, conversation_id: ConversationId) -> Self {
        Self {
            request_id,
            conversation_id: Some(conversation_id),
            before: None,
        }
    }

    pub fn older(
        request_id: RequestId,
        conversation_id: ConversationId,
        before: MessageId,
    ) -> Self {
        Self {
            request_id,
            conversation_id: Some(conversation_id),
            before: Some(before),
        }
    }
}

/// One page of history. Messages run oldest→newest within the page so the
/// controller can prepend them wholesale. Siblings are populated only on
/// discovery/initial fetches (`before` absent).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
    pub siblings: Vec<ConversationRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub body: String,
    pub kind: MessageKind,
}

impl NewMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            kind: MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub body: Option<String>,
}

/// Display identity for a participant, resolved best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub nickname: String,
    pub email: String,
}

impl Profile {
    pub fn placeholder() -> Self {
        Self {
            nickname: UNKNOWN_PROFILE_LABEL.to_string(),
            email: UNKNOWN_PROFILE_LABEL.to_string(),
        }
    }
}

/// Global message order: `created_at` ascending, ties broken by id so merges
/// stay deterministic.
pub fn chronological(left: &MessageRecord, right: &MessageRecord) -> Ordering {
    left.created_at
        .cmp(&right.created_at)
        .then_with(|| left.id.cmp(&right.id))
}
